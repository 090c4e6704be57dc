//! Session report storage.
//!
//! Reports are written atomically: serialized to a temporary file, synced,
//! then renamed over `.fixloop/sessions/<session-id>.json`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::PipelineResult;
use crate::error::Result;

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Directory of persisted session reports.
#[derive(Debug, Clone)]
pub struct SessionReports {
    dir: PathBuf,
}

impl SessionReports {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the report for a session id.
    #[must_use]
    pub fn report_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(session_id)))
    }

    /// Save a report atomically and return its path.
    pub fn save(&self, result: &PipelineResult) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let target = self.report_path(&result.session_id);
        let tmp_path = target.with_extension(format!("json{TMP_SUFFIX}"));
        let json = serde_json::to_string_pretty(result)?;

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, &target)?;
        debug!("Saved session report to {}", target.display());
        Ok(target)
    }

    /// Load a report; corrupted files are treated as absent.
    pub fn load(&self, session_id: &str) -> Result<Option<PipelineResult>> {
        let path = self.report_path(session_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&contents) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                warn!("Corrupted session report at {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }
}

/// Keep session ids usable as file names.
fn sanitize(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use tempfile::TempDir;

    fn result(id: &str) -> PipelineResult {
        PipelineResult {
            success: false,
            status: SessionStatus::Escalated,
            fixed_files: vec!["src/a.ts".to_string()],
            remaining_errors: Vec::new(),
            warnings: Vec::new(),
            unattributed_errors: Vec::new(),
            logs: vec!["12:00:00.000 INFO started".to_string()],
            retry_count: 1,
            rounds: 2,
            session_id: id.to_string(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let reports = SessionReports::new(temp.path().join("sessions"));

        let path = reports.save(&result("abc")).unwrap();
        assert!(path.ends_with("abc.json"));
        assert!(!temp.path().join("sessions/abc.json.tmp").exists());

        let loaded = reports.load("abc").unwrap().unwrap();
        assert_eq!(loaded, result("abc"));
    }

    #[test]
    fn test_session_id_cannot_escape_directory() {
        let reports = SessionReports::new("/tmp/reports");
        assert_eq!(
            reports.report_path("../../etc/passwd"),
            PathBuf::from("/tmp/reports/______etc_passwd.json")
        );
    }

    #[test]
    fn test_corrupted_report_is_absent() {
        let temp = TempDir::new().unwrap();
        let reports = SessionReports::new(temp.path());
        fs::write(reports.report_path("bad"), "{not json").unwrap();
        assert!(reports.load("bad").unwrap().is_none());
        assert!(reports.load("missing").unwrap().is_none());
    }
}
