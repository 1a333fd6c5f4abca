//! Process-hosted Agent Driver.
//!
//! Spawns the configured backend command per run and speaks newline-delimited
//! JSON over its stdio: one request line in, [`AgentEvent`] lines out.
//! Permission requests arrive as `permission_request` lines and their
//! decisions are written back to the child's stdin. On cancel the driver
//! writes a `cancel` line, waits out the grace window, then kills the child.

use super::{AgentDriver, AgentEvent, DriverError, PermissionRequest, RunOptions};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long the child gets between the cancel line and a kill.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Request line written to the child at run start.
#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    op: &'static str,
    prompt: &'a str,
    project_root: String,
    permission_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    allowed_tools: Vec<String>,
}

/// Permission request line read from the child.
#[derive(Debug, Deserialize)]
struct ChildPermissionRequest {
    request_id: String,
    #[serde(flatten)]
    request: PermissionRequest,
}

/// Decision line written back to the child.
#[derive(Debug, Serialize)]
struct ChildPermissionResponse<'a> {
    op: &'static str,
    request_id: &'a str,
    approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    modified_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    answers: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

pub struct ProcessDriver {
    program: String,
    args: Vec<String>,
}

impl ProcessDriver {
    /// `command` is a whitespace-separated program + arguments line.
    pub fn new(command: &str) -> Self {
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts.next().unwrap_or_else(|| "agent-backend".to_string());
        Self {
            program,
            args: parts.collect(),
        }
    }

    fn spawn(&self, options: &RunOptions) -> Result<Child, DriverError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&options.project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        tracing::debug!(
            program = %self.program,
            pid = child.id().unwrap_or(0),
            "Spawned agent backend"
        );
        Ok(child)
    }
}

#[async_trait]
impl AgentDriver for ProcessDriver {
    async fn run(
        &self,
        prompt: &str,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentEvent>, DriverError> {
        let mut child = self.spawn(&options)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::Unavailable("child stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Unavailable("child stdout not piped".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "tabbridge::agent_backend", "{line}");
                }
            });
        }

        let request = RunRequest {
            op: "run",
            prompt,
            project_root: options.project_root.to_string_lossy().into_owned(),
            permission_mode: options.permission_mode.to_string(),
            conversation_id: options.agent_conversation_id.clone(),
            allowed_tools: options.allowed_tools.clone(),
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| DriverError::Protocol(e.to_string()))?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_loop(child, stdin, stdout, options, cancel, tx));
        Ok(rx)
    }
}

/// Relay child stdout lines until the run ends, the receiver drops, or a
/// cancel outlives the grace window.
async fn run_loop(
    mut child: Child,
    mut stdin: ChildStdin,
    stdout: tokio::process::ChildStdout,
    options: RunOptions,
    cancel: CancellationToken,
    tx: mpsc::Sender<AgentEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut saw_result = false;
    let mut cancel_sent = false;

    loop {
        let next = if cancel_sent {
            // Post-cancel: the child gets the grace window to finish up.
            match tokio::time::timeout(CANCEL_GRACE, lines.next_line()).await {
                Ok(read) => read,
                Err(_) => {
                    tracing::warn!("Agent backend ignored cancel, killing");
                    let _ = child.start_kill();
                    break;
                }
            }
        } else {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = stdin.write_all(b"{\"op\":\"cancel\"}\n").await;
                    let _ = stdin.flush().await;
                    cancel_sent = true;
                    continue;
                }
                read = lines.next_line() => read,
            }
        };

        match next {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match handle_line(line, &mut stdin, &options, &tx).await {
                    LineOutcome::Continue => {}
                    LineOutcome::SawResult => saw_result = true,
                    LineOutcome::ReceiverGone => {
                        let _ = child.start_kill();
                        break;
                    }
                }
            }
            Ok(None) => break, // EOF: child closed stdout
            Err(e) => {
                tracing::warn!(error = %e, "Error reading agent backend stdout");
                break;
            }
        }
    }

    if !saw_result && !cancel_sent {
        // Abnormal exit without a terminal event
        let _ = tx
            .send(AgentEvent::Result {
                ok: false,
                error: Some("agent backend exited unexpectedly".to_string()),
            })
            .await;
    }

    match tokio::time::timeout(CANCEL_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(?status, "Agent backend exited"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Error waiting for agent backend"),
        Err(_) => {
            let _ = child.start_kill();
        }
    }
}

enum LineOutcome {
    Continue,
    SawResult,
    ReceiverGone,
}

async fn handle_line(
    line: &str,
    stdin: &mut ChildStdin,
    options: &RunOptions,
    tx: &mpsc::Sender<AgentEvent>,
) -> LineOutcome {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable line from agent backend");
            return LineOutcome::Continue;
        }
    };

    if value.get("type").and_then(Value::as_str) == Some("permission_request") {
        let request: ChildPermissionRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed permission request from agent backend");
                return LineOutcome::Continue;
            }
        };
        // Blocks until the decision exists - the backend is waiting on stdin.
        let decision = options.permissions.request(request.request).await;
        let response = match &decision {
            super::PermissionDecision::Approved {
                modified_input,
                answers,
            } => ChildPermissionResponse {
                op: "permission_response",
                request_id: &request.request_id,
                approved: true,
                modified_input: modified_input.clone(),
                answers: answers
                    .as_ref()
                    .and_then(|a| serde_json::to_value(a).ok()),
                reason: None,
            },
            super::PermissionDecision::Denied { reason } => ChildPermissionResponse {
                op: "permission_response",
                request_id: &request.request_id,
                approved: false,
                modified_input: None,
                answers: None,
                reason: Some(reason.to_string()),
            },
        };
        if let Ok(mut line) = serde_json::to_string(&response) {
            line.push('\n');
            if stdin.write_all(line.as_bytes()).await.is_err() {
                tracing::warn!("Agent backend stdin closed mid-prompt");
            }
            let _ = stdin.flush().await;
        }
        return LineOutcome::Continue;
    }

    match serde_json::from_value::<AgentEvent>(value) {
        Ok(event) => {
            let is_result = matches!(event, AgentEvent::Result { .. });
            if tx.send(event).await.is_err() {
                return LineOutcome::ReceiverGone;
            }
            if is_result {
                LineOutcome::SawResult
            } else {
                LineOutcome::Continue
            }
        }
        Err(e) => {
            // Unknown event types are tolerated for forward compatibility
            tracing::warn!(error = %e, "Unknown event from agent backend");
            LineOutcome::Continue
        }
    }
}
