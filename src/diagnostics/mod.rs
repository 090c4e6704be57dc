//! Diagnostics produced by validation passes and their mapping onto files.
//!
//! - [`parser`] - Pass-specific parsers from raw tool output to [`BuildError`]
//! - [`mapper`] - Attribution of errors to files ([`ErrorFileMapping`])
//!
//! # Architecture
//!
//! ```text
//! RawDiagnostic ──parse──> BuildError ──attribute──> ErrorFileMapping
//!   (pass, sub-root,         (kind, file,              (per-line index,
//!    text)                    line, message)             dependents, ...)
//!                                  │
//!                                  └── no file ──> unattributed bucket
//! ```

pub mod mapper;
pub mod parser;

use serde::{Deserialize, Serialize};

pub use mapper::{
    broken_symbols, ErrorFileMapping, ErrorMap, ErrorMapper, FileFixState, FixLedger, FixRecord,
};
pub use parser::{locate_in_message, parse_raw_diagnostic, DiagnosticParser, LineFormat};

use crate::validation::ValidationPass;

/// Category of a build error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Type,
    Lint,
    Build,
    Test,
    Runtime,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Type => write!(f, "type"),
            Self::Lint => write!(f, "lint"),
            Self::Build => write!(f, "build"),
            Self::Test => write!(f, "test"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}

/// Severity level; warnings never block success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// A structured record of one failure from a validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildError {
    pub kind: ErrorKind,
    /// Project-relative file, once attributed.
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
    /// Tool error code (e.g. "TS2339", "no-unused-vars").
    pub code: Option<String>,
    pub severity: Severity,
}

impl BuildError {
    /// Create a new file-less error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            file: None,
            line: None,
            column: None,
            message: message.into(),
            code: None,
            severity: Severity::Error,
        }
    }

    /// Add a file location.
    #[must_use]
    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    /// Add a file without a line.
    #[must_use]
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Add column information.
    #[must_use]
    pub fn with_column(mut self, column: u32) -> Self {
        self.column = Some(column);
        self
    }

    /// Add an error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Set the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Format as a string for display.
    #[must_use]
    pub fn format(&self) -> String {
        let mut parts = vec![format!("[{}]", self.severity), format!("[{}]", self.kind)];

        if let Some(ref code) = self.code {
            parts.push(format!("[{}]", code));
        }

        parts.push(self.message.clone());

        if let Some(ref file) = self.file {
            let loc = match (self.line, self.column) {
                (Some(line), Some(col)) => format!("{}:{}:{}", file, line, col),
                (Some(line), None) => format!("{}:{}", file, line),
                _ => file.clone(),
            };
            parts.push(format!("at {}", loc));
        }

        parts.join(" ")
    }
}

/// Unparsed diagnostic text tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDiagnostic {
    pub pass: ValidationPass,
    /// Project-relative sub-root the pass ran in.
    pub sub_root: String,
    pub text: String,
}

impl RawDiagnostic {
    pub fn new(pass: ValidationPass, sub_root: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            pass,
            sub_root: sub_root.into(),
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_format() {
        let err = BuildError::new(ErrorKind::Type, "Type 'number' is not assignable")
            .with_location("src/a.ts", 10)
            .with_column(5)
            .with_code("TS2322");
        assert_eq!(
            err.format(),
            "[ERROR] [type] [TS2322] Type 'number' is not assignable at src/a.ts:10:5"
        );
    }

    #[test]
    fn test_build_error_format_without_location() {
        let err = BuildError::new(ErrorKind::Build, "npm ERR! missing script")
            .with_severity(Severity::Warning);
        assert_eq!(err.format(), "[WARNING] [build] npm ERR! missing script");
        assert!(!err.is_error());
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ErrorKind::Runtime).unwrap();
        assert_eq!(json, "\"runtime\"");
    }
}
