//! Custom error types for fixloop.
//!
//! Transient failures are logged and absorbed by their caller. Diagnostics
//! drive the repair loop and never surface here. Only fatal conditions
//! abort a session.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for fixloop operations
#[derive(Error, Debug)]
pub enum FixloopError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Manifest Errors
    // =========================================================================
    /// Manifest file exists but cannot be parsed
    #[error("Manifest error in {path}: {message}")]
    Manifest { path: PathBuf, message: String },

    // =========================================================================
    // Workspace Errors
    // =========================================================================
    /// A path resolved outside the project root
    #[error("Path escapes project root: {path}")]
    PathEscape { path: String },

    /// Writing to the project tree failed
    #[error("Failed to write {path}: {message}")]
    WriteFailed { path: String, message: String },

    /// Project directory is missing
    #[error("Project directory does not exist: {path}")]
    MissingProject { path: PathBuf },

    // =========================================================================
    // Tool Errors
    // =========================================================================
    /// Missing required tool
    #[error("Missing required tool: {tool}")]
    MissingTool { tool: String },

    /// External pass or oracle call exceeded its timeout
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    /// Dependency installation kept failing
    #[error("Install failed for {sub_root} after {attempts} attempts: {message}")]
    InstallFailed {
        sub_root: String,
        attempts: u32,
        message: String,
    },

    // =========================================================================
    // Oracle Errors
    // =========================================================================
    /// Fix oracle returned something that is not a structured response
    #[error("Malformed oracle response: {detail}")]
    MalformedResponse { detail: String },

    /// Fix oracle could not be reached or failed
    #[error("Fix oracle '{oracle}' failed: {message}")]
    Oracle { oracle: String, message: String },

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Session aborted on a fatal condition; carries the full ordered log
    #[error("Session {session_id} aborted: {reason}")]
    SessionAborted {
        session_id: String,
        reason: String,
        logs: Vec<String>,
    },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FixloopError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a write failure
    pub fn write_failed(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WriteFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an oracle failure
    pub fn oracle(oracle: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Oracle {
            oracle: oracle.into(),
            message: message.into(),
        }
    }

    /// Create a malformed-response error
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedResponse {
            detail: detail.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error is fatal (aborts the session)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::WriteFailed { .. }
                | Self::MissingTool { .. }
                | Self::MissingProject { .. }
                | Self::Manifest { .. }
                | Self::SessionAborted { .. }
                | Self::Io(_)
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PathEscape { .. } => 2,
            Self::MissingTool { .. } | Self::MissingProject { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } | Self::Manifest { .. } => 7,
            Self::SessionAborted { .. } | Self::WriteFailed { .. } => 8,
            _ => 1,
        }
    }
}

/// Type alias for fixloop results
pub type Result<T> = std::result::Result<T, FixloopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FixloopError::Timeout {
            operation: "typecheck pass".into(),
            timeout_secs: 30,
        };
        assert_eq!(err.to_string(), "typecheck pass timed out after 30s");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_is_fatal() {
        assert!(FixloopError::write_failed("a.ts", "denied").is_fatal());
        assert!(FixloopError::MissingTool { tool: "npx".into() }.is_fatal());
        assert!(!FixloopError::malformed("not json").is_fatal());
        assert!(!FixloopError::PathEscape {
            path: "../etc/passwd".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            FixloopError::PathEscape { path: "..".into() }.exit_code(),
            2
        );
        assert_eq!(FixloopError::config("bad").exit_code(), 7);
        assert_eq!(FixloopError::MissingTool { tool: "npm".into() }.exit_code(), 6);
        assert_eq!(FixloopError::malformed("x").exit_code(), 1);
    }

    #[test]
    fn test_config_with_path() {
        let path = PathBuf::from("/test/settings.json");
        let err = FixloopError::config_with_path("failed to parse", path.clone());
        if let FixloopError::Config {
            message,
            path: opt_path,
        } = err
        {
            assert_eq!(message, "failed to parse");
            assert_eq!(opt_path, Some(path));
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: FixloopError = io_err.into();
        assert!(matches!(err, FixloopError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }
}
