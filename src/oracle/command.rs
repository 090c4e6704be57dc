//! Command-backed fix oracle.
//!
//! The rendered prompt is written to the command's stdin and its stdout is
//! taken as the raw response, the same way a CLI model client is driven.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use super::{FixOracle, FixRequest};
use crate::config::FixloopConfig;
use crate::error::FixloopError;
use crate::validation::command::is_tool_available;

/// Runs an external command per request.
#[derive(Debug, Clone)]
pub struct CommandFixOracle {
    argv: Vec<String>,
    project_dir: PathBuf,
}

impl CommandFixOracle {
    pub fn new(argv: Vec<String>, project_dir: impl AsRef<Path>) -> Self {
        Self {
            argv,
            project_dir: project_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl FixOracle for CommandFixOracle {
    async fn invoke(&self, request: &FixRequest) -> anyhow::Result<String> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| FixloopError::config("oracle command is empty"))?;
        if !is_tool_available(program) {
            return Err(FixloopError::MissingTool {
                tool: program.clone(),
            }
            .into());
        }

        let prompt = request.prompt();
        debug!("Running {} ({} chars prompt)", program, prompt.len());

        let mut child = AsyncCommand::new(program)
            .args(args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FixloopError::oracle(program.as_str(), format!("failed to spawn: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| FixloopError::oracle(program.as_str(), format!("failed to write prompt: {}", e)))?;
            stdin.flush().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FixloopError::oracle(
                program.as_str(),
                format!("exited with {}: {}", output.status, stderr.trim()),
            )
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn name(&self) -> &str {
        self.argv.first().map_or("command", String::as_str)
    }
}

/// The oracle configured for a project, or [`UnavailableOracle`] when no
/// command is set.
#[must_use]
pub fn oracle_from_config(config: &FixloopConfig, project_dir: &Path) -> Box<dyn FixOracle> {
    match &config.oracle.command {
        Some(argv) if !argv.is_empty() => Box::new(CommandFixOracle::new(argv.clone(), project_dir)),
        _ => Box::new(UnavailableOracle),
    }
}

/// Stand-in used when no oracle is configured; every request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableOracle;

#[async_trait]
impl FixOracle for UnavailableOracle {
    async fn invoke(&self, _request: &FixRequest) -> anyhow::Result<String> {
        Err(FixloopError::oracle("unavailable", "no fix oracle configured").into())
    }

    fn name(&self) -> &str {
        "unavailable"
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::oracle::{FixScope, OracleOutcome};
    use crate::oracle::FixOracleAdapter;
    use std::time::Duration;
    use tempfile::TempDir;

    fn request() -> FixRequest {
        FixRequest {
            error_summary: "[ERROR] [type] x".to_string(),
            local_code: "let a = 1".to_string(),
            context: String::new(),
            manifest_context: String::new(),
            scope: FixScope::SingleLine {
                path: "src/a.ts".to_string(),
                line: 1,
            },
            clarification: None,
        }
    }

    #[tokio::test]
    async fn test_command_reads_prompt_from_stdin() {
        let temp = TempDir::new().unwrap();
        let oracle = CommandFixOracle::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"grep -q 'Line 1 of src/a.ts' && echo '{"success": true, "fixedLine": "let a = 2;"}'"#.to_string(),
            ],
            temp.path(),
        );
        let adapter = FixOracleAdapter::new(&oracle, Duration::from_secs(10));
        match adapter.request(&request()).await.unwrap() {
            OracleOutcome::Response(response) => {
                assert_eq!(response.single_line("src/a.ts").as_deref(), Some("let a = 2;"));
            }
            OracleOutcome::Failed(reason) => panic!("unexpected failure: {}", reason),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_per_request_failure() {
        let temp = TempDir::new().unwrap();
        let oracle = CommandFixOracle::new(
            vec!["sh".to_string(), "-c".to_string(), "cat >/dev/null; exit 3".to_string()],
            temp.path(),
        );
        let adapter = FixOracleAdapter::new(&oracle, Duration::from_secs(10));
        assert!(matches!(
            adapter.request(&request()).await.unwrap(),
            OracleOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_unavailable_oracle() {
        let oracle = UnavailableOracle;
        assert!(!oracle.is_available());
        assert!(oracle.invoke(&request()).await.is_err());
    }
}
