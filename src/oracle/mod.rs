//! Fix oracle adapter.
//!
//! The fix oracle is an external capability that proposes code when the
//! deterministic rules give up. Orchestration depends only on the
//! request/response contract here, never on how an oracle works inside.
//!
//! - [`command`] - Oracle backed by an external command
//! - [`response`] - Response parsing and path validation
//!
//! # Strategies
//!
//! ```text
//! Surgical ──(no rule applies)──> OracleTargeted ──(file-level errors or
//!                                                   failed targeted attempt,
//!                                                   no prior content)──> OracleFullRegenerate
//! ```
//!
//! [`FixStrategy::OracleFullRegenerate`] carries a [`RegenerationPermit`],
//! which can only be obtained for manifest entries without prior content.

pub mod command;
pub mod response;

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FixloopError, Result};
use crate::manifest::{Manifest, ManifestEntry};
use crate::propagation::ContextWindow;
use crate::workspace::ProjectTree;

pub use command::{oracle_from_config, CommandFixOracle, UnavailableOracle};
pub use response::{parse_response, resolve_path, FixResponse, ResponsePath};

/// Follow-up sent when a response could not be parsed.
const CLARIFICATION: &str = "Your previous reply could not be parsed. Reply with ONLY one JSON object \
of the form {\"success\": true|false, \"fixedContent\": {\"<path>\": \"<content>\"}, \
\"newFiles\": {}, \"explanation\": \"...\"} and no other text.";

/// Proof that a file may be regenerated wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegenerationPermit {
    path: String,
}

impl RegenerationPermit {
    /// Permit regeneration of an entry without prior content.
    #[must_use]
    pub fn for_entry(entry: &ManifestEntry) -> Option<Self> {
        (!entry.has_existing_content).then(|| Self {
            path: entry.path.clone(),
        })
    }

    /// Permit regeneration of a declared path.
    #[must_use]
    pub fn for_path(manifest: &Manifest, path: &str) -> Option<Self> {
        manifest.get(path).and_then(Self::for_entry)
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// How a file gets repaired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixStrategy {
    Surgical,
    /// Single-line oracle requests, allowed for every file.
    OracleTargeted,
    OracleFullRegenerate(RegenerationPermit),
}

impl FixStrategy {
    /// Label used in fix history.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Surgical => "surgical",
            Self::OracleTargeted => "oracle-targeted",
            Self::OracleFullRegenerate(_) => "oracle-regenerate",
        }
    }
}

/// What a request allows the oracle to change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixScope {
    /// One line of one file; only the returned line is applied.
    SingleLine { path: String, line: u32 },
    /// The whole file (requires a regeneration permit).
    File { path: String },
}

impl FixScope {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::SingleLine { path, .. } | Self::File { path } => path,
        }
    }
}

/// A request to the fix oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixRequest {
    pub error_summary: String,
    /// The code the oracle should rewrite.
    pub local_code: String,
    /// Surrounding code and dependent information.
    pub context: String,
    /// Compact listing of the project's declared files.
    pub manifest_context: String,
    pub scope: FixScope,
    pub clarification: Option<String>,
}

impl FixRequest {
    /// Single-line request built from a context window.
    #[must_use]
    pub fn targeted(window: &ContextWindow, error_summary: impl Into<String>, manifest_context: impl Into<String>) -> Self {
        Self {
            error_summary: error_summary.into(),
            local_code: window.target.clone(),
            context: window.render(),
            manifest_context: manifest_context.into(),
            scope: FixScope::SingleLine {
                path: window.path.clone(),
                line: window.line,
            },
            clarification: None,
        }
    }

    /// Whole-file request; only constructible with a permit.
    #[must_use]
    pub fn regenerate(
        permit: &RegenerationPermit,
        content: impl Into<String>,
        error_summary: impl Into<String>,
        manifest_context: impl Into<String>,
    ) -> Self {
        Self {
            error_summary: error_summary.into(),
            local_code: content.into(),
            context: String::new(),
            manifest_context: manifest_context.into(),
            scope: FixScope::File {
                path: permit.path().to_string(),
            },
            clarification: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let extra = context.into();
        if self.context.is_empty() {
            self.context = extra;
        } else if !extra.is_empty() {
            self.context = format!("{}\n\n{}", self.context, extra);
        }
        self
    }

    #[must_use]
    pub fn with_clarification(mut self, clarification: impl Into<String>) -> Self {
        self.clarification = Some(clarification.into());
        self
    }

    /// Render the request as a prompt.
    #[must_use]
    pub fn prompt(&self) -> String {
        let mut prompt = String::from("You are repairing build errors in a generated project.\n\n");

        prompt.push_str("## Errors\n\n");
        prompt.push_str(&self.error_summary);
        prompt.push_str("\n\n");

        match &self.scope {
            FixScope::SingleLine { path, line } => {
                prompt.push_str(&format!("## Line {} of {}\n\n```\n{}\n```\n\n", line, path, self.local_code));
            }
            FixScope::File { path } => {
                prompt.push_str(&format!("## File {}\n\n```\n{}\n```\n\n", path, self.local_code));
            }
        }

        if !self.context.is_empty() {
            prompt.push_str("## Context\n\n```\n");
            prompt.push_str(&self.context);
            prompt.push_str("\n```\n\n");
        }
        if !self.manifest_context.is_empty() {
            prompt.push_str("## Project files\n\n");
            prompt.push_str(&self.manifest_context);
            prompt.push_str("\n\n");
        }

        prompt.push_str("## Response format\n\n");
        prompt.push_str(
            "Reply with one JSON object: {\"success\": bool, \"fixedContent\": {\"<path>\": \"<content>\"}, \
             \"newFiles\": {\"<path>\": \"<content>\"}, \"explanation\": \"...\"}.\n",
        );
        match &self.scope {
            FixScope::SingleLine { path, line } => prompt.push_str(&format!(
                "Only line {} of {} may change: map \"{}\" to exactly one replacement line. Do not add files.\n",
                line, path, path
            )),
            FixScope::File { path } => prompt.push_str(&format!(
                "Map \"{}\" to its complete corrected content.\n",
                path
            )),
        }

        if let Some(note) = &self.clarification {
            prompt.push_str("\n## Note\n\n");
            prompt.push_str(note);
            prompt.push('\n');
        }
        prompt
    }
}

/// An external fix capability.
///
/// Implementations return the oracle's raw text; the adapter parses and
/// validates it.
#[async_trait]
pub trait FixOracle: Send + Sync {
    async fn invoke(&self, request: &FixRequest) -> anyhow::Result<String>;

    fn name(&self) -> &str {
        "oracle"
    }

    /// Whether requests can be served at all.
    fn is_available(&self) -> bool {
        true
    }
}

/// Result of one adapter request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleOutcome {
    Response(FixResponse),
    /// Per-file failure; the session continues.
    Failed(String),
}

/// Timeout-bounded access to a [`FixOracle`] with one clarification retry.
pub struct FixOracleAdapter<'a> {
    oracle: &'a dyn FixOracle,
    timeout: Duration,
}

impl<'a> FixOracleAdapter<'a> {
    pub fn new(oracle: &'a dyn FixOracle, timeout: Duration) -> Self {
        Self { oracle, timeout }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.oracle.is_available()
    }

    /// Send a request, retrying once with a clarification if the answer is
    /// malformed.
    ///
    /// # Errors
    ///
    /// Only fatal conditions (for example a missing oracle executable) are
    /// returned as errors.
    pub async fn request(&self, request: &FixRequest) -> Result<OracleOutcome> {
        let raw = match self.call(request).await? {
            Ok(raw) => raw,
            Err(reason) => return Ok(OracleOutcome::Failed(reason)),
        };
        let first_error = match parse_response(&raw) {
            Ok(response) => return Ok(Self::finish(response)),
            Err(e) => e,
        };

        warn!(
            "Malformed response from {} for {}: {}; retrying once",
            self.oracle.name(),
            request.scope.path(),
            first_error
        );
        let retry = request.clone().with_clarification(CLARIFICATION);
        let raw = match self.call(&retry).await? {
            Ok(raw) => raw,
            Err(reason) => return Ok(OracleOutcome::Failed(reason)),
        };
        match parse_response(&raw) {
            Ok(response) => Ok(Self::finish(response)),
            Err(e) => {
                warn!("Giving up on {} after clarification: {}", request.scope.path(), e);
                Ok(OracleOutcome::Failed(e.to_string()))
            }
        }
    }

    async fn call(&self, request: &FixRequest) -> Result<std::result::Result<String, String>> {
        debug!("Invoking {} for {}", self.oracle.name(), request.scope.path());
        match tokio::time::timeout(self.timeout, self.oracle.invoke(request)).await {
            Ok(Ok(raw)) => Ok(Ok(raw)),
            Ok(Err(e)) => match e.downcast::<FixloopError>() {
                Ok(err) if err.is_fatal() => Err(err),
                Ok(err) => Ok(Err(err.to_string())),
                Err(other) => Ok(Err(other.to_string())),
            },
            Err(_) => {
                let err = FixloopError::Timeout {
                    operation: format!("{} oracle", self.oracle.name()),
                    timeout_secs: self.timeout.as_secs(),
                };
                warn!("{}", err);
                Ok(Err(err.to_string()))
            }
        }
    }

    fn finish(response: FixResponse) -> OracleOutcome {
        if response.success {
            OracleOutcome::Response(response)
        } else {
            OracleOutcome::Failed(
                response
                    .explanation
                    .unwrap_or_else(|| "oracle reported no fix".to_string()),
            )
        }
    }
}

/// Files written while applying a whole-file response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedResponse {
    pub written: Vec<String>,
    pub rejected: Vec<String>,
}

/// Apply the file contents of a response.
///
/// Replacements need a [`RegenerationPermit`] for their resolved path;
/// new files are created only where nothing exists yet. Paths that escape
/// the root are skipped.
///
/// # Errors
///
/// Only write failures are returned.
pub fn apply_file_response(
    tree: &ProjectTree,
    manifest: &Manifest,
    target: &str,
    response: &FixResponse,
) -> Result<AppliedResponse> {
    let mut applied = AppliedResponse::default();
    let entries = response
        .fixed_content
        .iter()
        .chain(response.new_files.iter());

    for (raw, content) in entries {
        let resolved = match resolve_path(raw, manifest, tree, target) {
            Ok(resolved) => resolved,
            Err(FixloopError::PathEscape { path }) => {
                warn!("Skipping oracle write outside the project root: {}", path);
                applied.rejected.push(raw.clone());
                continue;
            }
            Err(e) => return Err(e),
        };

        match &resolved {
            ResponsePath::Declared(path) => {
                let Some(permit) = RegenerationPermit::for_path(manifest, path) else {
                    warn!("Refusing full replacement of {}: file has prior content", path);
                    applied.rejected.push(path.clone());
                    continue;
                };
                write_regenerated(tree, &permit, content)?;
            }
            ResponsePath::Undeclared(path) => {
                warn!("Refusing full replacement of undeclared file {}", path);
                applied.rejected.push(path.clone());
                continue;
            }
            ResponsePath::New(path) => {
                info!("Creating {} from oracle response", path);
                tree.write(path, content)?;
            }
        }
        if !applied.written.iter().any(|p| p == resolved.as_str()) {
            applied.written.push(resolved.as_str().to_string());
        }
    }
    Ok(applied)
}

fn write_regenerated(tree: &ProjectTree, permit: &RegenerationPermit, content: &str) -> Result<()> {
    info!("Regenerating {}", permit.path());
    let mut body = content.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    tree.write(permit.path(), &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FileRole, SubRootManifest};
    use crate::testing::MockFixOracle;
    use tempfile::TempDir;

    fn manifest() -> Manifest {
        Manifest::from_sub_roots(vec![SubRootManifest::new(
            "",
            vec![
                ManifestEntry::new("src/fresh.ts", FileRole::Service),
                ManifestEntry::new("src/legacy.ts", FileRole::Service).with_existing_content(),
            ],
        )])
    }

    fn request() -> FixRequest {
        let permit = RegenerationPermit::for_path(&manifest(), "src/fresh.ts").unwrap();
        FixRequest::regenerate(&permit, "const a = 1;", "[ERROR] [type] bad", "- src/fresh.ts")
    }

    #[test]
    fn test_permit_requires_no_prior_content() {
        let manifest = manifest();
        assert!(RegenerationPermit::for_path(&manifest, "src/fresh.ts").is_some());
        assert!(RegenerationPermit::for_path(&manifest, "src/legacy.ts").is_none());
        assert!(RegenerationPermit::for_path(&manifest, "src/unknown.ts").is_none());
    }

    #[test]
    fn test_prompt_sections() {
        let prompt = request().with_clarification("JSON only").prompt();
        assert!(prompt.contains("## Errors"));
        assert!(prompt.contains("## File src/fresh.ts"));
        assert!(prompt.contains("## Project files"));
        assert!(prompt.contains("## Note"));
    }

    #[tokio::test]
    async fn test_malformed_response_retried_once() {
        let oracle = MockFixOracle::new()
            .with_response("not json")
            .with_response(r#"{"success": true, "fixedContent": {"src/fresh.ts": "x"}}"#);
        let adapter = FixOracleAdapter::new(&oracle, Duration::from_secs(5));
        let outcome = adapter.request(&request()).await.unwrap();
        assert!(matches!(outcome, OracleOutcome::Response(_)));
        assert_eq!(oracle.call_count(), 2);
        assert!(oracle.requests()[1].clarification.is_some());
    }

    #[tokio::test]
    async fn test_malformed_twice_is_failure() {
        let oracle = MockFixOracle::new().with_default_response("still not json");
        let adapter = FixOracleAdapter::new(&oracle, Duration::from_secs(5));
        let outcome = adapter.request(&request()).await.unwrap();
        assert!(matches!(outcome, OracleOutcome::Failed(_)));
        assert_eq!(oracle.call_count(), 2);
    }

    #[tokio::test]
    async fn test_oracle_error_is_not_fatal() {
        let oracle = MockFixOracle::new().with_error("boom");
        let adapter = FixOracleAdapter::new(&oracle, Duration::from_secs(5));
        let outcome = adapter.request(&request()).await.unwrap();
        assert_eq!(outcome, OracleOutcome::Failed("boom".to_string()));
    }

    struct StalledOracle;

    #[async_trait]
    impl FixOracle for StalledOracle {
        async fn invoke(&self, _request: &FixRequest) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(String::new())
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_oracle_timeout_is_per_file_failure() {
        let adapter = FixOracleAdapter::new(&StalledOracle, Duration::from_secs(1));
        let outcome = adapter.request(&request()).await.unwrap();
        assert_eq!(
            outcome,
            OracleOutcome::Failed("stalled oracle timed out after 1s".to_string())
        );
    }

    #[test]
    fn test_apply_file_response_guards() {
        let temp = TempDir::new().unwrap();
        let tree = ProjectTree::open(temp.path()).unwrap();
        tree.write("src/fresh.ts", "old\n").unwrap();
        tree.write("src/legacy.ts", "keep\n").unwrap();
        let response = parse_response(
            r#"{"success": true,
                "fixedContent": {"src/fresh.ts": "new", "src/legacy.ts": "clobbered", "../outside.ts": "x"},
                "newFiles": {"src/extra.ts": "export {};"}}"#,
        )
        .unwrap();

        let applied = apply_file_response(&tree, &manifest(), "src/fresh.ts", &response).unwrap();
        assert_eq!(applied.written, vec!["src/fresh.ts", "src/extra.ts"]);
        assert_eq!(applied.rejected.len(), 2);
        assert_eq!(tree.read("src/fresh.ts").unwrap(), "new\n");
        assert_eq!(tree.read("src/legacy.ts").unwrap(), "keep\n");
        assert!(!temp.path().parent().unwrap().join("outside.ts").exists());
    }
}
