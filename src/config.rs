//! Configuration management for fixloop.
//!
//! Settings live in `<project>/.fixloop/settings.json`. Every field has a
//! default, so a missing file or a partial file is always usable.
//!
//! # Example settings.json
//!
//! ```json
//! {
//!   "maxRounds": 6,
//!   "maxFixAttemptsPerFile": 2,
//!   "passes": { "test": null },
//!   "oracle": { "command": ["node", "scripts/fix-oracle.js"] }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FixloopError, Result};
use crate::validation::ValidationPass;

/// Directory holding fixloop state inside a project.
pub const STATE_DIR: &str = ".fixloop";

/// Project configuration loaded from .fixloop/settings.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixloopConfig {
    /// Attempts for the dependency install pass before giving up.
    #[serde(default = "default_install_retries")]
    pub max_install_retries: u32,

    /// Validation/fix rounds before the session is exhausted.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Fix attempts allowed per file across the whole session.
    #[serde(default = "default_fix_attempts")]
    pub max_fix_attempts_per_file: u32,

    /// Base delay between install retries.
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Timeout applied to each validation pass.
    #[serde(default = "default_pass_timeout")]
    pub pass_timeout_secs: u64,

    /// Timeout applied to each fix oracle call.
    #[serde(default = "default_oracle_timeout")]
    pub oracle_timeout_secs: u64,

    /// Lines shown above and below a usage in targeted requests.
    #[serde(default = "default_context_radius")]
    pub context_radius: usize,

    /// Cap on single-line oracle requests per file per round.
    #[serde(default = "default_targeted_lines")]
    pub max_targeted_lines_per_file: usize,

    /// File whose presence marks a buildable sub-root.
    #[serde(default = "default_build_descriptor")]
    pub build_descriptor: String,

    /// Whether dependents are re-checked after a file changes.
    #[serde(default = "default_true")]
    pub propagation: bool,

    /// Whether the final report is written to `.fixloop/sessions/`.
    #[serde(default = "default_true")]
    pub persist_reports: bool,

    #[serde(default)]
    pub passes: PassCommands,

    #[serde(default)]
    pub oracle: OracleConfig,
}

fn default_install_retries() -> u32 {
    3
}

fn default_max_rounds() -> u32 {
    10
}

fn default_fix_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    2000
}

fn default_pass_timeout() -> u64 {
    300
}

fn default_oracle_timeout() -> u64 {
    120
}

fn default_context_radius() -> usize {
    3
}

fn default_targeted_lines() -> usize {
    5
}

fn default_build_descriptor() -> String {
    "package.json".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for FixloopConfig {
    fn default() -> Self {
        Self {
            max_install_retries: default_install_retries(),
            max_rounds: default_max_rounds(),
            max_fix_attempts_per_file: default_fix_attempts(),
            retry_backoff_ms: default_backoff_ms(),
            pass_timeout_secs: default_pass_timeout(),
            oracle_timeout_secs: default_oracle_timeout(),
            context_radius: default_context_radius(),
            max_targeted_lines_per_file: default_targeted_lines(),
            build_descriptor: default_build_descriptor(),
            propagation: true,
            persist_reports: true,
            passes: PassCommands::default(),
            oracle: OracleConfig::default(),
        }
    }
}

/// Command line (argv) for each validation pass. `None` disables the pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassCommands {
    #[serde(default = "default_install_cmd")]
    pub install: Option<Vec<String>>,
    #[serde(default = "default_typecheck_cmd")]
    pub typecheck: Option<Vec<String>>,
    #[serde(default = "default_lint_cmd")]
    pub lint: Option<Vec<String>>,
    #[serde(default = "default_build_cmd")]
    pub build: Option<Vec<String>>,
    #[serde(default = "default_test_cmd")]
    pub test: Option<Vec<String>>,
}

fn argv(parts: &[&str]) -> Option<Vec<String>> {
    Some(parts.iter().map(|s| (*s).to_string()).collect())
}

fn default_install_cmd() -> Option<Vec<String>> {
    argv(&["npm", "install", "--no-audit", "--no-fund"])
}

fn default_typecheck_cmd() -> Option<Vec<String>> {
    argv(&["npx", "tsc", "--noEmit", "--pretty", "false"])
}

fn default_lint_cmd() -> Option<Vec<String>> {
    argv(&["npx", "eslint", ".", "--format", "unix"])
}

fn default_build_cmd() -> Option<Vec<String>> {
    argv(&["npm", "run", "build", "--if-present"])
}

fn default_test_cmd() -> Option<Vec<String>> {
    argv(&["npm", "test", "--if-present"])
}

impl Default for PassCommands {
    fn default() -> Self {
        Self {
            install: default_install_cmd(),
            typecheck: default_typecheck_cmd(),
            lint: default_lint_cmd(),
            build: default_build_cmd(),
            test: default_test_cmd(),
        }
    }
}

impl PassCommands {
    /// Get the argv configured for a pass.
    #[must_use]
    pub fn for_pass(&self, pass: ValidationPass) -> Option<&[String]> {
        let cmd = match pass {
            ValidationPass::Install => &self.install,
            ValidationPass::TypeCheck => &self.typecheck,
            ValidationPass::Lint => &self.lint,
            ValidationPass::Build => &self.build,
            ValidationPass::Test => &self.test,
        };
        cmd.as_deref().filter(|argv| !argv.is_empty())
    }
}

/// External fix oracle settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleConfig {
    /// Command receiving the request prompt on stdin and answering on stdout.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

impl FixloopConfig {
    /// Load configuration from a project directory
    pub fn load(project_dir: &Path) -> Result<Self> {
        let settings_path = Self::settings_path(project_dir);

        if !settings_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&settings_path)?;
        let config: FixloopConfig = serde_json::from_str(&content).map_err(|e| {
            FixloopError::config_with_path(e.to_string(), settings_path.clone())
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the settings.json path for a project
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR).join("settings.json")
    }

    /// Get the manifest path for a project
    pub fn manifest_path(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR).join("manifest.json")
    }

    /// Get the directory where session reports are written
    pub fn sessions_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR).join("sessions")
    }

    /// Reject values that would make the session loop meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.max_rounds == 0 {
            return Err(FixloopError::invalid_config(
                "maxRounds",
                "must be at least 1",
            ));
        }
        if self.max_fix_attempts_per_file == 0 {
            return Err(FixloopError::invalid_config(
                "maxFixAttemptsPerFile",
                "must be at least 1",
            ));
        }
        if self.max_install_retries == 0 {
            return Err(FixloopError::invalid_config(
                "maxInstallRetries",
                "must be at least 1",
            ));
        }
        if self.pass_timeout_secs == 0 || self.oracle_timeout_secs == 0 {
            return Err(FixloopError::invalid_config(
                "timeouts",
                "pass and oracle timeouts must be positive",
            ));
        }
        if self.build_descriptor.trim().is_empty() {
            return Err(FixloopError::invalid_config(
                "buildDescriptor",
                "must name a file",
            ));
        }
        Ok(())
    }

    /// Set the maximum number of rounds.
    #[must_use]
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    /// Set the per-file attempt bound.
    #[must_use]
    pub fn with_max_fix_attempts(mut self, attempts: u32) -> Self {
        self.max_fix_attempts_per_file = attempts;
        self
    }

    /// Set the install retry backoff.
    #[must_use]
    pub fn with_retry_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.retry_backoff_ms = backoff_ms;
        self
    }

    /// Set the oracle command.
    #[must_use]
    pub fn with_oracle_command(mut self, command: Vec<String>) -> Self {
        self.oracle.command = Some(command);
        self
    }

    /// Enable or disable report persistence.
    #[must_use]
    pub fn with_persist_reports(mut self, persist: bool) -> Self {
        self.persist_reports = persist;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = FixloopConfig::default();
        assert_eq!(config.max_install_retries, 3);
        assert_eq!(config.max_rounds, 10);
        assert_eq!(config.build_descriptor, "package.json");
        assert!(config.propagation);
        assert!(config.oracle.command.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = FixloopConfig::load(temp.path()).unwrap();
        assert_eq!(config, FixloopConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(STATE_DIR)).unwrap();
        std::fs::write(
            FixloopConfig::settings_path(temp.path()),
            r#"{"maxRounds": 4, "passes": {"test": null, "lint": ["yarn", "lint"]}}"#,
        )
        .unwrap();

        let config = FixloopConfig::load(temp.path()).unwrap();
        assert_eq!(config.max_rounds, 4);
        assert_eq!(config.max_fix_attempts_per_file, 3);
        assert!(config.passes.for_pass(ValidationPass::Test).is_none());
        assert_eq!(
            config.passes.for_pass(ValidationPass::Lint).unwrap(),
            &["yarn".to_string(), "lint".to_string()]
        );
        assert!(config.passes.for_pass(ValidationPass::TypeCheck).is_some());
    }

    #[test]
    fn test_load_invalid_json() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(STATE_DIR)).unwrap();
        std::fs::write(FixloopConfig::settings_path(temp.path()), "{ nope").unwrap();

        let err = FixloopConfig::load(temp.path()).unwrap_err();
        assert!(matches!(err, FixloopError::Config { path: Some(_), .. }));
    }

    #[test]
    fn test_validate_rejects_zero_rounds() {
        let config = FixloopConfig::default().with_max_rounds(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("maxRounds"));
    }

    #[test]
    fn test_empty_argv_disables_pass() {
        let mut passes = PassCommands::default();
        passes.build = Some(Vec::new());
        assert!(passes.for_pass(ValidationPass::Build).is_none());
    }
}
