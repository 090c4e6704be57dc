//! fixloop - Dependency-aware build-error remediation
//!
//! Takes a generated multi-file project described by a manifest, runs its
//! install and validation passes, and iteratively repairs the errors they
//! report: rule-based surgical line edits first, an external fix oracle
//! second, with changes propagated to dependent files and every write kept
//! inside the project root.
//!
//! # Architecture
//!
//! - [`config`] - Session settings loaded from `.fixloop/settings.json`
//! - [`diagnostics`] - Build errors, tool output parsers and the error mapper
//! - [`error`] - Custom error types and handling
//! - [`manifest`] - Declared files and their dependency graph
//! - [`oracle`] - Fix oracle contract, adapter and response validation
//! - [`patcher`] - Surgical patcher and its rule registry
//! - [`propagation`] - Dependent propagation of symbol changes
//! - [`scheduler`] - Priority ordering of files to repair
//! - [`session`] - Session state machine and report persistence
//! - [`testing`] - Scripted oracles and project fixtures
//! - [`validation`] - Validation oracle adapter
//! - [`workspace`] - Root-confined access to the project tree
//!
//! # Example
//!
//! ```rust,ignore
//! use fixloop::run_build_and_fix_pipeline;
//!
//! let result = run_build_and_fix_pipeline("./generated-app", "session-1").await?;
//! if !result.success {
//!     for error in &result.remaining_errors {
//!         eprintln!("{}", error.format());
//!     }
//! }
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod manifest;
pub mod oracle;
pub mod patcher;
pub mod propagation;
pub mod scheduler;
pub mod session;
pub mod testing;
pub mod validation;
pub mod workspace;

// Re-export commonly used types
pub use error::{FixloopError, Result};

pub use config::FixloopConfig;

pub use diagnostics::{BuildError, ErrorFileMapping, ErrorKind, ErrorMap, ErrorMapper, Severity};

pub use manifest::{DependencyGraph, FileRole, Manifest, ManifestEntry};

pub use oracle::{CommandFixOracle, FixOracle, FixOracleAdapter, FixRequest, FixResponse, FixStrategy};

pub use patcher::{SurgicalChange, SurgicalPatcher};

pub use session::{
    run_build_and_fix_pipeline, BuildFixPipeline, CancellationFlag, PipelineResult, Session,
    SessionState, SessionStatus,
};

pub use validation::{
    CommandValidationOracle, PassOutcome, ValidationOracle, ValidationPass, ValidationReport,
};
