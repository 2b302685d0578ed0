use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use pipesync_core::config::EngineConfig;
use pipesync_core::error::{PipesyncError, Result};
use pipesync_core::traits::{ExecutionEngine, SyncOutcome};
use pipesync_core::types::{Run, RunStatus};

/// Exit code a precheck command uses to say "not ready yet".
pub const NOT_READY_EXIT_CODE: i32 = 3;

/// Execution engine backed by shell commands.
///
/// Each operation runs `sh -c <command>` with the run as JSON on stdin.
/// The child is killed if it outlives `timeout_secs`.
pub struct CommandEngine {
    config: EngineConfig,
}

/// What a sync command prints on stdout.
#[derive(Debug, Deserialize)]
struct SyncReport {
    changed: bool,
    #[serde(default)]
    status: Option<RunStatus>,
}

struct CommandOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn failure(&self, op: &str) -> PipesyncError {
        let code = self
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            PipesyncError::Engine(format!("{op} command exited with {code}"))
        } else {
            PipesyncError::Engine(format!("{op} command exited with {code}: {stderr}"))
        }
    }
}

impl CommandEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    async fn exec(&self, op: &'static str, command: &str, run: &Run) -> Result<CommandOutput> {
        let input = serde_json::to_vec(run)?;
        let mut child = Command::new("sh")
            .args(["-c", command])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipesyncError::Engine(format!("{op} command has no stdin")))?;

        let feed = async move {
            // Commands that ignore their input close the pipe early.
            match stdin.write_all(&input).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };

        let timeout_secs = self.config.timeout_secs;
        let (fed, output) = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            tokio::join!(feed, child.wait_with_output())
        })
        .await
        .map_err(|_| PipesyncError::EngineTimeout { op, timeout_secs })?;
        fed?;
        let output = output?;

        let out = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(op, run = %run.id(), code = ?out.code, "Engine command finished");
        Ok(out)
    }
}

impl ExecutionEngine for CommandEngine {
    fn precheck<'a>(&'a self, run: &'a Run) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let out = self
                .exec("precheck", &self.config.precheck_command, run)
                .await?;
            match out.code {
                Some(0) => Ok(true),
                Some(NOT_READY_EXIT_CODE) => Ok(false),
                _ => Err(out.failure("precheck")),
            }
        })
    }

    fn launch<'a>(&'a self, run: &'a Run) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let out = self.exec("launch", &self.config.launch_command, run).await?;
            match out.code {
                Some(0) => Ok(()),
                _ => Err(out.failure("launch")),
            }
        })
    }

    fn sync_progress<'a>(&'a self, run: &'a Run) -> BoxFuture<'a, Result<SyncOutcome>> {
        Box::pin(async move {
            let out = self.exec("sync", &self.config.sync_command, run).await?;
            if out.code != Some(0) {
                return Err(out.failure("sync"));
            }

            let report: SyncReport = serde_json::from_str(out.stdout.trim())?;
            let mut next = run.clone();
            if report.changed {
                next.status = report.status.ok_or_else(|| {
                    PipesyncError::Engine("sync reported a change without a status".to_string())
                })?;
            }
            Ok(SyncOutcome {
                run: next,
                changed: report.changed,
            })
        })
    }
}
