//! Validation oracle backed by external commands.
//!
//! Each pass runs its configured argv inside the sub-root directory. Output
//! is collected while the child runs, so a pass killed on timeout still
//! returns what it printed. On Unix the child leads its own process group
//! and a timeout kills the whole group.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as AsyncCommand};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PassOutcome, ValidationOracle, ValidationPass};
use crate::config::{FixloopConfig, PassCommands};
use crate::error::FixloopError;

/// How long output readers may keep draining once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Check whether a tool is on `PATH`.
#[must_use]
pub fn is_tool_available(tool_name: &str) -> bool {
    which::which(tool_name).is_ok()
}

/// Runs validation passes as child processes.
#[derive(Debug, Clone)]
pub struct CommandValidationOracle {
    passes: PassCommands,
    timeout: Duration,
}

impl CommandValidationOracle {
    pub fn new(passes: PassCommands, timeout: Duration) -> Self {
        Self { passes, timeout }
    }

    /// Build from project configuration.
    #[must_use]
    pub fn from_config(config: &FixloopConfig) -> Self {
        Self::new(
            config.passes.clone(),
            Duration::from_secs(config.pass_timeout_secs),
        )
    }
}

#[async_trait]
impl ValidationOracle for CommandValidationOracle {
    async fn run_pass(&self, sub_root: &Path, pass: ValidationPass) -> anyhow::Result<PassOutcome> {
        let Some(argv) = self.passes.for_pass(pass) else {
            debug!("{} pass disabled", pass);
            return Ok(PassOutcome::passed().with_log(format!("{} pass disabled", pass)));
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| FixloopError::config(format!("empty command for {} pass", pass)))?;

        if !is_tool_available(program) {
            return Err(FixloopError::MissingTool {
                tool: program.clone(),
            }
            .into());
        }

        debug!("Running {} in {}: {}", pass, sub_root.display(), argv.join(" "));
        let mut command = AsyncCommand::new(program);
        command
            .args(args)
            .current_dir(sub_root)
            .env("CI", "true")
            .env("FORCE_COLOR", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|e| FixloopError::oracle("validation", format!("failed to spawn {}: {}", program, e)))?;

        let stdout = OutputCapture::spawn(child.stdout.take());
        let stderr = OutputCapture::spawn(child.stderr.take());

        let (status, timeout) = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => (Some(status?), None),
            Err(_) => {
                let err = FixloopError::Timeout {
                    operation: format!("{} pass", pass),
                    timeout_secs: self.timeout.as_secs(),
                };
                warn!("{}, killing", err);
                if let Err(e) = kill_process_tree(&mut child).await {
                    warn!("Failed to kill {} pass: {}", pass, e);
                }
                (None, Some(err))
            }
        };

        let (stdout, stderr) = tokio::join!(stdout.finish(DRAIN_GRACE), stderr.finish(DRAIN_GRACE));

        let mut outcome = PassOutcome {
            success: status.is_some_and(|s| s.success()),
            diagnostics: [stdout, stderr]
                .into_iter()
                .filter(|chunk| !chunk.trim().is_empty())
                .collect(),
            logs: vec![format!("$ {}", argv.join(" "))],
            timed_out: false,
        };
        if let Some(status) = status {
            outcome.logs.push(format!("exited with {}", status));
        }
        if let Some(err) = timeout {
            outcome = outcome.with_timeout().with_log(err.to_string());
        }
        Ok(outcome)
    }

    fn name(&self) -> &str {
        "command"
    }
}

/// Kill the child's process group, then the child itself.
async fn kill_process_tree(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let group = format!("-{}", pid);
            match AsyncCommand::new("kill")
                .args(["-KILL", "--", &group])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
            {
                Ok(status) if !status.success() => debug!("kill {} exited with {}", group, status),
                Err(e) => debug!("Could not signal process group {}: {}", group, e),
                Ok(_) => {}
            }
        }
    }
    child.kill().await
}

/// Collects one output stream in the background.
///
/// Bytes land in a shared buffer as they arrive, so whatever was read
/// survives when the reader has to be abandoned.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl OutputCapture {
    fn spawn<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let task = tokio::spawn(async move {
            let Some(mut reader) = reader else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Ok(mut buf) = sink.lock() {
                            buf.extend_from_slice(&chunk[..n]);
                        }
                    }
                    Err(e) => {
                        debug!("Output stream ended early: {}", e);
                        break;
                    }
                }
            }
        });
        Self { buffer, task }
    }

    /// Wait up to `grace` for the stream to close, then return what was read.
    async fn finish(mut self, grace: Duration) -> String {
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            debug!("Output stream still open after {}ms, abandoning", grace.as_millis());
            self.task.abort();
        }
        self.buffer
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn oracle_with(pass_argv: Vec<&str>, timeout: Duration) -> CommandValidationOracle {
        let argv: Vec<String> = pass_argv.into_iter().map(str::to_string).collect();
        let passes = PassCommands {
            install: None,
            typecheck: Some(argv),
            lint: None,
            build: None,
            test: None,
        };
        CommandValidationOracle::new(passes, timeout)
    }

    #[tokio::test]
    async fn test_disabled_pass_succeeds() {
        let temp = TempDir::new().unwrap();
        let oracle = oracle_with(vec!["true"], Duration::from_secs(5));
        let outcome = oracle.run_pass(temp.path(), ValidationPass::Lint).await.unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_failing_command_collects_output() {
        let temp = TempDir::new().unwrap();
        let oracle = oracle_with(
            vec!["sh", "-c", "echo 'src/a.ts(1,1): error TS1005: x'; exit 2"],
            Duration::from_secs(5),
        );
        let outcome = oracle
            .run_pass(temp.path(), ValidationPass::TypeCheck)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.diagnostics[0].contains("TS1005"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let temp = TempDir::new().unwrap();
        let oracle = oracle_with(
            vec!["sh", "-c", "echo partial; exec sleep 5"],
            Duration::from_millis(500),
        );
        let outcome = oracle
            .run_pass(temp.path(), ValidationPass::TypeCheck)
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success);
        assert!(outcome.diagnostics.iter().any(|d| d.contains("partial")));
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let temp = TempDir::new().unwrap();
        let oracle = oracle_with(
            vec!["sh", "-c", "echo partial; sleep 6"],
            Duration::from_millis(500),
        );
        let started = std::time::Instant::now();
        let outcome = oracle
            .run_pass(temp.path(), ValidationPass::TypeCheck)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(outcome.timed_out);
        assert!(outcome.diagnostics.iter().any(|d| d.contains("partial")));
        assert!(outcome.logs.iter().any(|l| l.contains("timed out after 0s")));
    }

    #[tokio::test]
    async fn test_lingering_background_writer_does_not_block() {
        let temp = TempDir::new().unwrap();
        let oracle = oracle_with(
            vec!["sh", "-c", "echo done; sleep 6 & exit 1"],
            Duration::from_secs(5),
        );
        let started = std::time::Instant::now();
        let outcome = oracle
            .run_pass(temp.path(), ValidationPass::TypeCheck)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!outcome.timed_out);
        assert!(!outcome.success);
        assert!(outcome.diagnostics.iter().any(|d| d.contains("done")));
    }

    #[tokio::test]
    async fn test_missing_tool_is_reported() {
        let temp = TempDir::new().unwrap();
        let oracle = oracle_with(vec!["definitely-not-a-real-tool-xyz"], Duration::from_secs(5));
        let err = oracle
            .run_pass(temp.path(), ValidationPass::TypeCheck)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FixloopError>(),
            Some(FixloopError::MissingTool { .. })
        ));
    }
}
