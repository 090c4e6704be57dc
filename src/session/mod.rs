//! Build-fix sessions.
//!
//! A [`Session`] is created per invocation and owns everything that lives
//! for one run: counters, the cumulative fixed-file set, the ordered log and
//! the content states already seen. Nothing is kept in global registries.
//!
//! - [`pipeline`] - The state machine driving validation and repair rounds
//! - [`persistence`] - Session report storage
//!
//! # States
//!
//! ```text
//! INSTALLING ─> VALIDATING ─> DONE
//!                   │
//!                   └─> MAPPING ─> SCHEDULING ─> FIXING ─> PROPAGATING ─┐
//!                           ^                                           │
//!                           └──────────────── VALIDATING <──────────────┘
//!
//! terminal: DONE | EXHAUSTED | ESCALATED | FATAL
//! ```

pub mod persistence;
pub mod pipeline;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use persistence::SessionReports;
pub use pipeline::{run_build_and_fix_pipeline, BuildFixPipeline, PipelineResult};

// ============================================================================
// State
// ============================================================================

/// Phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Installing,
    Validating,
    Mapping,
    Scheduling,
    Fixing,
    Propagating,
    Done,
    Exhausted,
    Escalated,
    Fatal,
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Exhausted | Self::Escalated | Self::Fatal
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Installing => "INSTALLING",
            Self::Validating => "VALIDATING",
            Self::Mapping => "MAPPING",
            Self::Scheduling => "SCHEDULING",
            Self::Fixing => "FIXING",
            Self::Propagating => "PROPAGATING",
            Self::Done => "DONE",
            Self::Exhausted => "EXHAUSTED",
            Self::Escalated => "ESCALATED",
            Self::Fatal => "FATAL",
        };
        write!(f, "{}", name)
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Success,
    Exhausted,
    Escalated,
    Fatal,
}

impl SessionStatus {
    /// Terminal state reached with this status.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        match self {
            Self::Success => SessionState::Done,
            Self::Exhausted => SessionState::Exhausted,
            Self::Escalated => SessionState::Escalated,
            Self::Fatal => SessionState::Fatal,
        }
    }

    /// Process exit code for the CLI.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Exhausted => 3,
            Self::Escalated => 4,
            Self::Fatal => 8,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Escalated => write!(f, "escalated"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

// ============================================================================
// Log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
}

/// One entry of the ordered session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    #[must_use]
    pub fn render(&self) -> String {
        let level = match self.level {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
        };
        format!(
            "{} {} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            level,
            self.message
        )
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Shared cancellation request, checked at round boundaries.
///
/// # Example
///
/// ```
/// use fixloop::session::CancellationFlag;
///
/// let flag = CancellationFlag::new();
/// let handle = flag.clone();
/// handle.cancel();
/// assert!(flag.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Session
// ============================================================================

/// State owned by one build-fix run.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    project_root: PathBuf,
    state: SessionState,
    /// Install retries consumed across all sub-roots.
    pub retry_count: u32,
    /// Fix rounds started.
    pub rounds: u32,
    fixed_files: BTreeSet<String>,
    log: Vec<LogEntry>,
    seen: HashSet<(String, String)>,
}

impl Session {
    pub fn new(id: impl Into<String>, project_root: impl AsRef<Path>) -> Self {
        Self {
            id: id.into(),
            project_root: project_root.as_ref().to_path_buf(),
            state: SessionState::Installing,
            retry_count: 0,
            rounds: 0,
            fixed_files: BTreeSet::new(),
            log: Vec::new(),
            seen: HashSet::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to the next state. Terminal states are final.
    pub fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if self.state.is_terminal() {
            warn!(
                "Session {} already terminated in {}, ignoring {}",
                self.id, self.state, next
            );
            return;
        }
        debug!("Session {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        if next.is_terminal() {
            self.log(format!("Session finished: {}", next));
        }
    }

    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.push(LogLevel::Warning, message);
    }

    fn push(&mut self, level: LogLevel, message: String) {
        self.log.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.log
    }

    /// The log rendered one line per entry.
    #[must_use]
    pub fn rendered_log(&self) -> Vec<String> {
        self.log.iter().map(LogEntry::render).collect()
    }

    pub fn mark_fixed(&mut self, path: &str) {
        self.fixed_files.insert(path.to_string());
    }

    #[must_use]
    pub fn fixed_files(&self) -> Vec<String> {
        self.fixed_files.iter().cloned().collect()
    }

    /// Remember a `(path, digest)` content state. Returns `true` when the
    /// state was never seen before in this session.
    pub fn remember_state(&mut self, path: &str, digest: &str) -> bool {
        self.seen.insert((path.to_string(), digest.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_state_is_final() {
        let mut session = Session::new("s1", "/tmp/project");
        session.transition(SessionState::Validating);
        session.transition(SessionState::Escalated);
        session.transition(SessionState::Validating);
        assert_eq!(session.state(), SessionState::Escalated);
        assert!(session
            .rendered_log()
            .last()
            .is_some_and(|l| l.ends_with("Session finished: ESCALATED")));
    }

    #[test]
    fn test_remember_state_detects_repeats() {
        let mut session = Session::new("s1", "/tmp/project");
        assert!(session.remember_state("a.ts", "d1"));
        assert!(session.remember_state("a.ts", "d2"));
        assert!(!session.remember_state("a.ts", "d1"));
    }

    #[test]
    fn test_log_levels_render() {
        let mut session = Session::new("s1", "/tmp/project");
        session.log("hello");
        session.warn("careful");
        let rendered = session.rendered_log();
        assert!(rendered[0].contains("INFO hello"));
        assert!(rendered[1].contains("WARN careful"));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Escalated).unwrap(),
            "\"escalated\""
        );
        assert_eq!(SessionStatus::Success.state(), SessionState::Done);
        assert_eq!(SessionStatus::Success.exit_code(), 0);
    }
}
