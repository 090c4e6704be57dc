//! Validation oracle adapter.
//!
//! Runs install, type-check, lint, build and test passes for every buildable
//! sub-root through a [`ValidationOracle`] and turns their output into
//! project-rooted [`BuildError`]s.
//!
//! # Pass order
//!
//! ```text
//! install (retried with backoff) ─> typecheck ─> lint ─> build ─> test
//! ```
//!
//! A pass that fails without any parseable diagnostic still yields one
//! file-less error, so a failing pass can never report success.

pub mod command;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::FixloopConfig;
use crate::diagnostics::{parse_raw_diagnostic, BuildError, ErrorKind, RawDiagnostic};
use crate::error::{FixloopError, Result};
use crate::manifest::Manifest;
use crate::workspace::{join_relative, ProjectTree};

pub use command::CommandValidationOracle;

/// Upper bound on the install retry delay.
const MAX_BACKOFF_MS: u64 = 30_000;

/// A validation pass run against a sub-root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPass {
    Install,
    TypeCheck,
    Lint,
    Build,
    Test,
}

impl ValidationPass {
    /// Passes run after a successful install, in order.
    pub const CHECKS: [ValidationPass; 4] = [Self::TypeCheck, Self::Lint, Self::Build, Self::Test];

    /// Kind assigned to errors produced by this pass.
    #[must_use]
    pub const fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Install | Self::Build => ErrorKind::Build,
            Self::TypeCheck => ErrorKind::Type,
            Self::Lint => ErrorKind::Lint,
            Self::Test => ErrorKind::Test,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::TypeCheck => "typecheck",
            Self::Lint => "lint",
            Self::Build => "build",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for ValidationPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one pass as reported by a validation oracle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub success: bool,
    /// Raw diagnostic output (one entry per output chunk or line).
    pub diagnostics: Vec<String>,
    pub logs: Vec<String>,
    pub timed_out: bool,
}

impl PassOutcome {
    /// A passing outcome.
    #[must_use]
    pub fn passed() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    /// A failing outcome with raw diagnostics.
    pub fn failed<I, S>(diagnostics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            success: false,
            diagnostics: diagnostics.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Mark the outcome as timed out.
    #[must_use]
    pub fn with_timeout(mut self) -> Self {
        self.timed_out = true;
        self.success = false;
        self
    }

    /// Attach a log line.
    #[must_use]
    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.logs.push(log.into());
        self
    }
}

/// External capability running validation passes.
///
/// Implementations return `Err` only when the pass could not run at all;
/// returning a [`FixloopError::MissingTool`] makes the session fatal.
#[async_trait]
pub trait ValidationOracle: Send + Sync {
    /// Run one pass in a sub-root directory.
    async fn run_pass(&self, sub_root: &Path, pass: ValidationPass) -> anyhow::Result<PassOutcome>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "validation"
    }
}

/// Aggregated result of validating a project.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub success: bool,
    pub errors: Vec<BuildError>,
    pub warnings: Vec<BuildError>,
    pub logs: Vec<String>,
    /// Install attempts made; zero for check passes.
    pub attempts: u32,
}

impl ValidationReport {
    fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.logs.extend(other.logs);
        self.success = self.errors.is_empty();
    }
}

/// Install retry delay: the base doubles per attempt, capped at 30s.
#[must_use]
pub fn install_backoff(base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let delay = base_ms.saturating_mul(2u64.saturating_pow(exponent));
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

/// Drives a [`ValidationOracle`] over a project tree.
pub struct ValidationRunner<'a> {
    oracle: &'a dyn ValidationOracle,
    tree: &'a ProjectTree,
    config: &'a FixloopConfig,
}

impl<'a> ValidationRunner<'a> {
    pub fn new(
        oracle: &'a dyn ValidationOracle,
        tree: &'a ProjectTree,
        config: &'a FixloopConfig,
    ) -> Self {
        Self {
            oracle,
            tree,
            config,
        }
    }

    /// Sub-roots of the manifest holding a build descriptor.
    #[must_use]
    pub fn buildable_sub_roots(&self, manifest: &Manifest) -> Vec<String> {
        manifest
            .sub_roots()
            .iter()
            .filter(|root| {
                let present = self.tree.dir_contains(root, &self.config.build_descriptor);
                if !present {
                    debug!(
                        "Skipping sub-root '{}': no {}",
                        root, self.config.build_descriptor
                    );
                }
                present
            })
            .cloned()
            .collect()
    }

    /// Install dependencies for a sub-root, retrying with backoff.
    ///
    /// The returned report is successful when one attempt passed; otherwise
    /// it carries the errors of the last attempt.
    pub async fn install(&self, sub_root: &str) -> Result<ValidationReport> {
        let max_attempts = self.config.max_install_retries.max(1);
        let mut last = ValidationReport::default();

        for attempt in 1..=max_attempts {
            info!("Installing dependencies in '{}' (attempt {})", display_root(sub_root), attempt);
            last = self.run_one(sub_root, ValidationPass::Install).await?;
            last.attempts = attempt;
            if last.success {
                return Ok(last);
            }
            if attempt < max_attempts {
                let delay = install_backoff(self.config.retry_backoff_ms, attempt);
                warn!(
                    "Install failed in '{}', retrying in {:?}",
                    display_root(sub_root),
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        let summary = last
            .errors
            .first()
            .map_or_else(|| "unknown failure".to_string(), |e| e.message.clone());
        let failure = FixloopError::InstallFailed {
            sub_root: display_root(sub_root).to_string(),
            attempts: max_attempts,
            message: summary,
        };
        warn!("{}", failure);
        last.logs.push(failure.to_string());
        Ok(last)
    }

    /// Run every check pass for the given sub-roots.
    pub async fn validate(&self, sub_roots: &[String]) -> Result<ValidationReport> {
        let mut report = ValidationReport {
            success: true,
            ..Default::default()
        };
        for sub_root in sub_roots {
            for pass in ValidationPass::CHECKS {
                let outcome = self.run_one(sub_root, pass).await?;
                report.merge(outcome);
            }
        }
        info!(
            "Validation finished: {} errors, {} warnings",
            report.errors.len(),
            report.warnings.len()
        );
        Ok(report)
    }

    /// Run one pass and convert its outcome.
    async fn run_one(&self, sub_root: &str, pass: ValidationPass) -> Result<ValidationReport> {
        let dir = if sub_root.is_empty() {
            self.tree.root().to_path_buf()
        } else {
            self.tree.resolve(sub_root)?
        };
        let label = format!("[{}] [{}]", display_root(sub_root), pass);

        let outcome = match self.oracle.run_pass(&dir, pass).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let err = match err.downcast::<FixloopError>() {
                    Ok(fixloop_err) if fixloop_err.is_fatal() => return Err(fixloop_err),
                    Ok(fixloop_err) => anyhow::Error::from(fixloop_err),
                    Err(other) => other,
                };
                warn!("{} could not run: {}", label, err);
                PassOutcome::failed([format!("{} pass could not run: {}", pass, err)])
            }
        };

        let mut report = ValidationReport::default();
        report
            .logs
            .extend(outcome.logs.iter().map(|log| format!("{} {}", label, log)));
        if outcome.timed_out {
            report.logs.push(format!("{} timed out", label));
        }

        let raw = RawDiagnostic::new(pass, sub_root, outcome.diagnostics.join("\n"));
        for mut error in parse_raw_diagnostic(&raw) {
            error.file = error
                .file
                .as_deref()
                .and_then(|file| self.reroot(sub_root, file));
            if error.is_error() {
                report.errors.push(error);
            } else {
                report.warnings.push(error);
            }
        }

        if !outcome.success && report.errors.is_empty() {
            let message = first_meaningful_line(&outcome.diagnostics).map_or_else(
                || {
                    if outcome.timed_out {
                        format!("{} pass timed out", pass)
                    } else {
                        format!("{} pass failed without diagnostics", pass)
                    }
                },
                str::to_string,
            );
            report.errors.push(BuildError::new(pass.error_kind(), message));
        }

        report.success = report.errors.is_empty();
        debug!(
            "{} {} errors, {} warnings",
            label,
            report.errors.len(),
            report.warnings.len()
        );
        Ok(report)
    }

    /// Convert a tool-reported path into a project-relative path.
    fn reroot(&self, sub_root: &str, reported: &str) -> Option<String> {
        if Path::new(reported).is_absolute() {
            return self.tree.relativize(reported);
        }
        let joined = join_relative(sub_root, reported)?;
        if !self.tree.exists(&joined) && self.tree.exists(reported) {
            return self.tree.relativize(reported);
        }
        Some(joined)
    }
}

fn display_root(sub_root: &str) -> &str {
    if sub_root.is_empty() {
        "."
    } else {
        sub_root
    }
}

/// First non-empty output line that is not decoration.
fn first_meaningful_line(diagnostics: &[String]) -> Option<&str> {
    diagnostics
        .iter()
        .flat_map(|chunk| chunk.lines())
        .map(str::trim)
        .find(|line| {
            !line.is_empty()
                && !line.starts_with('>')
                && line.chars().any(char::is_alphanumeric)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FileRole, ManifestEntry, SubRootManifest};
    use crate::testing::ScriptedValidationOracle;
    use tempfile::TempDir;

    fn project() -> (TempDir, ProjectTree) {
        let temp = TempDir::new().unwrap();
        let tree = ProjectTree::open(temp.path()).unwrap();
        tree.write("backend/package.json", "{}").unwrap();
        tree.write("backend/src/a.ts", "export const a = 1;\n").unwrap();
        (temp, tree)
    }

    #[test]
    fn test_install_backoff() {
        assert_eq!(install_backoff(2000, 1), Duration::from_millis(2000));
        assert_eq!(install_backoff(2000, 2), Duration::from_millis(4000));
        assert_eq!(install_backoff(2000, 10), Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(install_backoff(0, 3), Duration::ZERO);
    }

    #[test]
    fn test_buildable_sub_roots_require_descriptor() {
        let (_temp, tree) = project();
        let manifest = Manifest::from_sub_roots(vec![
            SubRootManifest::new("backend", vec![ManifestEntry::new("src/a.ts", FileRole::Util)]),
            SubRootManifest::new("frontend", vec![ManifestEntry::new("src/b.ts", FileRole::Util)]),
        ]);
        let oracle = ScriptedValidationOracle::clean();
        let config = FixloopConfig::default();
        let runner = ValidationRunner::new(&oracle, &tree, &config);
        assert_eq!(runner.buildable_sub_roots(&manifest), vec!["backend".to_string()]);
    }

    #[tokio::test]
    async fn test_errors_are_rerooted_and_split() {
        let (_temp, tree) = project();
        let oracle = ScriptedValidationOracle::new(|_, pass| match pass {
            ValidationPass::TypeCheck => PassOutcome::failed([
                "src/a.ts(1,14): error TS2322: Type 'string' is not assignable to type 'number'.",
            ]),
            ValidationPass::Lint => PassOutcome::passed()
                .with_log("lint ok"),
            _ => PassOutcome::passed(),
        });
        let config = FixloopConfig::default();
        let runner = ValidationRunner::new(&oracle, &tree, &config);

        let report = runner.validate(&["backend".to_string()]).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].file.as_deref(), Some("backend/src/a.ts"));
        assert!(report.logs.iter().any(|l| l.contains("[backend] [lint] lint ok")));
    }

    #[tokio::test]
    async fn test_failed_pass_without_diagnostics_yields_error() {
        let (_temp, tree) = project();
        let oracle = ScriptedValidationOracle::new(|_, pass| match pass {
            ValidationPass::Build => PassOutcome::failed(["", "> build", "Killed"]),
            ValidationPass::Test => PassOutcome::failed(Vec::<String>::new()).with_timeout(),
            _ => PassOutcome::passed(),
        });
        let config = FixloopConfig::default();
        let runner = ValidationRunner::new(&oracle, &tree, &config);

        let report = runner.validate(&["backend".to_string()]).await.unwrap();
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[0].message, "Killed");
        assert!(report.errors[0].file.is_none());
        assert_eq!(report.errors[1].message, "test pass timed out");
    }

    #[tokio::test]
    async fn test_warnings_do_not_block_success() {
        let (_temp, tree) = project();
        let oracle = ScriptedValidationOracle::new(|_, pass| match pass {
            ValidationPass::Lint => PassOutcome {
                success: true,
                diagnostics: vec!["src/a.ts:1:1: Unexpected console statement. [Warning/no-console]".into()],
                ..Default::default()
            },
            _ => PassOutcome::passed(),
        });
        let config = FixloopConfig::default();
        let runner = ValidationRunner::new(&oracle, &tree, &config);

        let report = runner.validate(&["backend".to_string()]).await.unwrap();
        assert!(report.success);
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_install_retries_then_reports() {
        let (_temp, tree) = project();
        let oracle = ScriptedValidationOracle::new(|_, pass| match pass {
            ValidationPass::Install => PassOutcome::failed(["npm ERR! network timeout"]),
            _ => PassOutcome::passed(),
        });
        let config = FixloopConfig::default().with_retry_backoff_ms(0);
        let runner = ValidationRunner::new(&oracle, &tree, &config);

        let report = runner.install("backend").await.unwrap();
        assert!(!report.success);
        assert_eq!(oracle.calls(ValidationPass::Install), 3);
        assert_eq!(report.attempts, 3);
        assert!(report.logs.iter().any(|l| l.contains("after 3 attempts")));
    }

    #[tokio::test]
    async fn test_missing_tool_is_fatal() {
        let (_temp, tree) = project();
        let oracle = ScriptedValidationOracle::failing(|pass| match pass {
            ValidationPass::TypeCheck => Some(FixloopError::MissingTool {
                tool: "npx".to_string(),
            }),
            _ => None,
        });
        let config = FixloopConfig::default();
        let runner = ValidationRunner::new(&oracle, &tree, &config);

        let err = runner.validate(&["backend".to_string()]).await.unwrap_err();
        assert!(matches!(err, FixloopError::MissingTool { .. }));
    }
}
