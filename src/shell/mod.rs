//! Shell-command adapters so a run definition can drive real work from the CLI.
//!
//! - `ShellExecutor` runs a work item's `payload.command`
//! - `CommandScorer` runs a rubric gate's `scorer` command
//! - `run_shell` backs the `command` gate check
//!
//! Commands run under `sh -c` with the work context as JSON on stdin.

mod http;

pub use http::HttpVerifier;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::providers::{
    ExecutionContext, ExecutionResult, Executor, RubricRequest, RubricScorer, RubricScores,
    WorkerError,
};
use crate::rollback::compensation;
use crate::work_item::WorkItem;

/// Exit code conventionally used for "temporary failure, try again" (EX_TEMPFAIL).
pub const EX_TEMPFAIL: i32 = 75;

#[derive(Debug, Clone, PartialEq)]
pub struct ShellSettings {
    /// Working directory for every command
    pub working_dir: PathBuf,
    /// Exit codes that mark a transient failure; anything else non-zero is permanent
    pub transient_exit_codes: Vec<i32>,
    /// Timeout for gate and scorer commands
    pub timeout: Option<Duration>,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            transient_exit_codes: vec![EX_TEMPFAIL],
            timeout: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShellOutput {
    /// -1 when the process was killed by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stderr if present, else stdout, else the exit code.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else if !stdout.is_empty() {
            stdout.to_string()
        } else {
            format!("exited with code {}", self.exit_code)
        }
    }
}

/// Run `command` under `sh -c`, writing `stdin` to it and collecting output.
///
/// The child is killed if the returned future is dropped.
pub async fn run_shell(
    command: &str,
    stdin: &str,
    settings: &ShellSettings,
    env: &[(&str, String)],
) -> Result<ShellOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(&settings.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    debug!(command, dir = %settings.working_dir.display(), "spawning shell command");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn command: {}", command))?;

    if let Some(mut pipe) = child.stdin.take() {
        // A command that never reads stdin closes the pipe early; that is fine.
        if let Err(e) = pipe.write_all(stdin.as_bytes()).await
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e).context("Failed to write command stdin");
        }
    }

    let output = child
        .wait_with_output()
        .await
        .context("Failed to wait for command")?;
    Ok(ShellOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// `run_shell` bounded by the settings' timeout.
pub async fn run_shell_with_timeout(
    command: &str,
    stdin: &str,
    settings: &ShellSettings,
    env: &[(&str, String)],
) -> Result<ShellOutput> {
    match settings.timeout {
        Some(limit) => tokio::time::timeout(limit, run_shell(command, stdin, settings, env))
            .await
            .map_err(|_| anyhow::anyhow!("Command timed out after {}s: {}", limit.as_secs(), command))?,
        None => run_shell(command, stdin, settings, env).await,
    }
}

/// Work item payload understood by `ShellExecutor`.
#[derive(Debug, Clone, Deserialize)]
struct ShellPayload {
    command: String,
    /// Command that undoes the item's effect, registered as a compensation
    #[serde(default)]
    undo: Option<String>,
}

/// Stdout a command may print to report more than plain output.
#[derive(Debug, Deserialize)]
struct ReportedResult {
    #[serde(default)]
    output: Value,
    #[serde(default)]
    cost: Option<u64>,
    #[serde(default)]
    diff: Option<String>,
}

/// Executor that runs each work item's `payload.command`.
pub struct ShellExecutor {
    settings: Arc<ShellSettings>,
}

impl ShellExecutor {
    pub fn new(settings: ShellSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    fn env(item: &WorkItem, ctx: &ExecutionContext) -> Vec<(&'static str, String)> {
        vec![
            ("WAYPOINT_RUN_ID", ctx.run_id.clone()),
            ("WAYPOINT_PHASE", ctx.phase_id.clone()),
            ("WAYPOINT_ITEM", item.id.clone()),
            ("WAYPOINT_ATTEMPT", ctx.attempt.to_string()),
            (
                "WAYPOINT_FEEDBACK",
                item.feedback.clone().unwrap_or_default(),
            ),
        ]
    }

    fn parse_success(stdout: &str) -> ExecutionResult {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return ExecutionResult::default();
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value @ Value::Object(_))
                if ["output", "cost", "diff"]
                    .iter()
                    .any(|k| value.get(k).is_some()) =>
            {
                match serde_json::from_value::<ReportedResult>(value.clone()) {
                    Ok(reported) => ExecutionResult {
                        output: reported.output,
                        cost: reported.cost,
                        diff: reported.diff,
                    },
                    Err(_) => ExecutionResult::new(value),
                }
            }
            Ok(value) => ExecutionResult::new(value),
            Err(_) => ExecutionResult::new(Value::String(trimmed.to_string())),
        }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(
        &self,
        item: &WorkItem,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult, WorkerError> {
        ctx.checkpoint()?;
        let payload: ShellPayload = serde_json::from_value(item.payload.clone()).map_err(|e| {
            WorkerError::Permanent(format!("payload needs a \"command\" string: {}", e))
        })?;
        let stdin = serde_json::to_string(item)
            .map_err(|e| WorkerError::Permanent(format!("cannot encode work item: {}", e)))?;
        let env = Self::env(item, ctx);

        let output = tokio::select! {
            output = run_shell(&payload.command, &stdin, &self.settings, &env) => output,
            _ = ctx.cancelled() => return Err(WorkerError::Cancelled),
        }
        .map_err(|e| WorkerError::Permanent(format!("{:#}", e)))?;

        if !output.success() {
            let message = output.failure_message();
            return if self.settings.transient_exit_codes.contains(&output.exit_code) {
                Err(WorkerError::Transient(message))
            } else {
                Err(WorkerError::Permanent(message))
            };
        }

        if let Some(undo) = payload.undo {
            let settings = self.settings.clone();
            ctx.register_compensation(
                &format!("undo {}", item.id),
                compensation(move || async move {
                    let output = run_shell_with_timeout(&undo, "", &settings, &env).await?;
                    if !output.success() {
                        anyhow::bail!("undo command failed: {}", output.failure_message());
                    }
                    Ok(())
                }),
            );
        }

        Ok(Self::parse_success(&output.stdout))
    }
}

/// Rubric scorer that runs the gate's `scorer` command.
///
/// The command receives `{phase, gate_id, dimensions, items}` on stdin and
/// prints `{"scores": {...}, "flagged_items": [...], "notes": "..."}`.
pub struct CommandScorer {
    settings: ShellSettings,
}

impl CommandScorer {
    pub fn new(settings: ShellSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl RubricScorer for CommandScorer {
    async fn score(&self, request: &RubricRequest<'_>) -> Result<RubricScores> {
        let command = request
            .scorer
            .with_context(|| format!("Gate '{}' has no scorer command", request.gate_id))?;
        let stdin = serde_json::to_string(&json!({
            "phase": request.phase.id,
            "gate_id": request.gate_id,
            "dimensions": request.dimensions,
            "items": request.items,
        }))
        .context("Failed to encode scorer input")?;
        let env = [
            ("WAYPOINT_PHASE", request.phase.id.clone()),
            ("WAYPOINT_GATE", request.gate_id.to_string()),
        ];
        let output = run_shell_with_timeout(command, &stdin, &self.settings, &env).await?;
        if !output.success() {
            anyhow::bail!("Scorer command failed: {}", output.failure_message());
        }
        serde_json::from_str(output.stdout.trim())
            .with_context(|| format!("Scorer printed invalid scores: {}", output.stdout.trim()))
    }
}

/// Exit status of a gate `command` check, with a note on failure.
pub async fn command_check(command: &str, settings: &ShellSettings) -> (bool, Option<String>) {
    match run_shell_with_timeout(command, "", settings, &[]).await {
        Ok(output) if output.success() => (true, None),
        Ok(output) => (
            false,
            Some(format!("`{}` failed: {}", command, output.failure_message())),
        ),
        Err(e) => {
            warn!(command, error = %e, "gate command did not run");
            (false, Some(format!("`{}` did not run: {:#}", command, e)))
        }
    }
}
