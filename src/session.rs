//! Per-tab session actor.
//!
//! One session owns one Agent Driver, one permission mode, at most one
//! in-flight run, and at most one pending permission prompt. All of that
//! state is mutated only inside the actor loop; everything else reaches it
//! through the command queue.

pub mod manager;
mod prompt;

pub use prompt::{build_prompt, PLAN_CONTINUATION_PROMPT};

use crate::connection::{ConnId, ConnectionManager};
use crate::config::PermissionTimeouts;
use crate::driver::{
    AgentDriver, AgentEvent, DenyReason, PermissionDecision, PermissionRequest, RunOptions,
};
use crate::permission::{timeout_seconds, PendingPrompt, SessionPermissionHandler};
use crate::protocol::{
    error_code, ElementContext, PermissionKind, PermissionMode, QuestionAnswer, ServerFrame,
    StreamAction, ToolStatus,
};
use crate::store::{screenshots::ScreenshotStore, MessageRole, Store};
use crate::stream::{StreamController, StreamHandle, StreamOutcome};
use base64::Engine as _;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Window the driver gets to wind down after a cancel.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Commands routed to a session actor.
pub enum SessionCommand {
    Chat {
        message: String,
        element_context: Option<ElementContext>,
        selected_text: Option<String>,
    },
    Cancel,
    SetPermissionMode {
        mode: PermissionMode,
    },
    PermissionResponse {
        request_id: String,
        approved: bool,
        modified_input: Option<Value>,
        answers: Option<Vec<QuestionAnswer>>,
    },
    ClearSession,
    SwitchConversation {
        agent_conversation_id: String,
        reply: oneshot::Sender<()>,
    },
    /// A later handshake for the same tab picked this session back up.
    Rebind {
        conn_id: ConnId,
    },
    ConnectionLost {
        conn_id: ConnId,
    },
    /// Raised by the permission handler on behalf of the driver.
    InstallPrompt {
        request: PermissionRequest,
        stream_id: String,
        reply: oneshot::Sender<PermissionDecision>,
    },
    PromptTimeout {
        request_id: String,
    },
    /// Driver event relayed by the run forwarder.
    StreamEvent {
        stream_id: String,
        event: AgentEvent,
    },
    RunFinished {
        stream_id: String,
        outcome: RunOutcome,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Terminal report from the run forwarder.
pub struct RunOutcome {
    pub disposition: StreamOutcome,
    pub error: Option<String>,
}

/// Dependencies shared by every session of the process.
pub struct SessionShared {
    pub store: Store,
    pub screenshots: ScreenshotStore,
    pub streams: Arc<StreamController>,
    pub connections: Arc<ConnectionManager>,
    pub timeouts: PermissionTimeouts,
    pub clear_purges_messages: bool,
    pub driver_factory: DriverFactory,
}

pub type DriverFactory = Arc<dyn Fn() -> Arc<dyn AgentDriver> + Send + Sync>;

/// Immutable identity a session is born with.
pub struct SessionSeed {
    pub session_id: String,
    pub tab_id: String,
    pub page_url: String,
    pub project_root: PathBuf,
    pub permission_mode: PermissionMode,
    pub agent_conversation_id: Option<String>,
}

/// Cheap handle to a live session actor.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub tab_id: String,
    pub cmd_tx: mpsc::Sender<SessionCommand>,
    last_activity: Arc<AtomicI64>,
}

impl SessionHandle {
    pub fn last_activity_epoch(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Fire-and-forget command delivery. A closed queue means the actor is
    /// gone; callers treat that like a missing session.
    pub async fn send(&self, cmd: SessionCommand) -> bool {
        self.cmd_tx.send(cmd).await.is_ok()
    }
}

struct CurrentStream {
    stream_id: String,
    run_task: JoinHandle<()>,
}

pub struct Session {
    id: String,
    tab_id: String,
    page_url: String,
    project_root: PathBuf,
    permission_mode: PermissionMode,
    agent_conversation_id: Option<String>,
    driver: Option<Arc<dyn AgentDriver>>,
    conn_id: Option<ConnId>,
    current_stream: Option<CurrentStream>,
    pending_prompt: Option<PendingPrompt>,
    /// User message of the in-flight run, persisted at termination.
    pending_user_message: Option<String>,
    /// Assistant text accumulated over the in-flight run.
    run_text: String,
    /// tool_id -> tool name, so `tool_end` frames can name the tool.
    tool_names: HashMap<String, String>,
    /// Plan was approved in plan mode; continue once the run terminates.
    auto_continue_pending: bool,
    /// Messages the store refused twice, kept in order for a later flush.
    unflushed: Vec<(MessageRole, Value)>,
    shared: Arc<SessionShared>,
    last_activity: Arc<AtomicI64>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
}

impl Session {
    /// Start the actor and hand back its handle.
    pub fn spawn(
        seed: SessionSeed,
        shared: Arc<SessionShared>,
        conn_id: Option<ConnId>,
    ) -> SessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let last_activity = Arc::new(AtomicI64::new(chrono::Utc::now().timestamp()));

        let handle = SessionHandle {
            session_id: seed.session_id.clone(),
            tab_id: seed.tab_id.clone(),
            cmd_tx: cmd_tx.clone(),
            last_activity: Arc::clone(&last_activity),
        };

        let session = Session {
            id: seed.session_id,
            tab_id: seed.tab_id,
            page_url: seed.page_url,
            project_root: seed.project_root,
            permission_mode: seed.permission_mode,
            agent_conversation_id: seed.agent_conversation_id,
            driver: None,
            conn_id,
            current_stream: None,
            pending_prompt: None,
            pending_user_message: None,
            run_text: String::new(),
            tool_names: HashMap::new(),
            auto_continue_pending: false,
            unflushed: Vec::new(),
            shared,
            last_activity,
            cmd_tx,
            cmd_rx,
        };
        tokio::spawn(session.run());
        handle
    }

    async fn run(mut self) {
        tracing::info!(
            session_id = %self.id,
            tab_id = %self.tab_id,
            page_url = %self.page_url,
            "Session started"
        );
        while let Some(cmd) = self.cmd_rx.recv().await {
            if self.handle_command(cmd).await {
                break;
            }
        }
        tracing::info!(session_id = %self.id, "Session stopped");
    }

    /// Returns true when the actor should stop.
    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Chat {
                message,
                element_context,
                selected_text,
            } => self.handle_chat(message, element_context, selected_text).await,
            SessionCommand::Cancel => self.cancel_current_stream("user"),
            SessionCommand::SetPermissionMode { mode } => self.handle_set_mode(mode).await,
            SessionCommand::PermissionResponse {
                request_id,
                approved,
                modified_input,
                answers,
            } => {
                self.handle_permission_response(request_id, approved, modified_input, answers)
                    .await;
            }
            SessionCommand::ClearSession => self.handle_clear_session().await,
            SessionCommand::SwitchConversation {
                agent_conversation_id,
                reply,
            } => {
                self.handle_switch_conversation(agent_conversation_id).await;
                let _ = reply.send(());
            }
            SessionCommand::Rebind { conn_id } => self.handle_rebind(conn_id).await,
            SessionCommand::ConnectionLost { conn_id } => {
                if self.conn_id.as_deref() == Some(conn_id.as_str()) {
                    self.conn_id = None;
                    self.cancel_current_stream("peer_gone");
                }
            }
            SessionCommand::InstallPrompt {
                request,
                stream_id,
                reply,
            } => self.handle_install_prompt(request, stream_id, reply).await,
            SessionCommand::PromptTimeout { request_id } => {
                self.handle_prompt_timeout(request_id).await;
            }
            SessionCommand::StreamEvent { stream_id, event } => {
                self.handle_stream_event(stream_id, event).await;
            }
            SessionCommand::RunFinished { stream_id, outcome } => {
                self.handle_run_finished(stream_id, outcome).await;
            }
            SessionCommand::Shutdown { done } => {
                self.handle_shutdown().await;
                let _ = done.send(());
                return true;
            }
        }
        false
    }

    // ==================== Chat / Runs ====================

    async fn handle_chat(
        &mut self,
        message: String,
        element_context: Option<ElementContext>,
        selected_text: Option<String>,
    ) {
        if self.current_stream.is_some() {
            self.send_frame(ServerFrame::error(
                error_code::BUSY,
                "an agent run is already in progress",
            ))
            .await;
            return;
        }
        self.touch();

        if let Some(context) = &element_context {
            self.save_screenshot(context);
        }

        let prompt = build_prompt(&message, element_context.as_ref(), selected_text.as_deref());
        self.pending_user_message = Some(message);
        self.start_run(prompt).await;
    }

    async fn start_run(&mut self, prompt: String) {
        let driver = match &self.driver {
            Some(driver) => Arc::clone(driver),
            None => {
                let driver = (self.shared.driver_factory)();
                self.driver = Some(Arc::clone(&driver));
                driver
            }
        };

        let handle = self.shared.streams.begin(&self.id);
        let options = RunOptions {
            project_root: self.project_root.clone(),
            permission_mode: self.permission_mode,
            agent_conversation_id: self.agent_conversation_id.clone(),
            allowed_tools: Vec::new(),
            permissions: Arc::new(SessionPermissionHandler::new(
                self.cmd_tx.clone(),
                handle.stream_id.clone(),
            )),
        };

        self.run_text.clear();
        self.tool_names.clear();

        // `started` goes out before the forwarder can enqueue any data frame.
        self.send_frame(ServerFrame::StreamControl {
            action: StreamAction::Started,
            stream_id: handle.stream_id.clone(),
            metadata: None,
        })
        .await;

        let run_task = tokio::spawn(run_stream(
            driver,
            prompt,
            options,
            handle.clone(),
            self.cmd_tx.clone(),
        ));
        self.current_stream = Some(CurrentStream {
            stream_id: handle.stream_id,
            run_task,
        });
    }

    async fn handle_stream_event(&mut self, stream_id: String, event: AgentEvent) {
        let live = self
            .current_stream
            .as_ref()
            .is_some_and(|c| c.stream_id == stream_id);
        if !live {
            return; // stale event from a terminated run
        }
        self.shared.streams.record_event(&stream_id, &event);

        match event {
            AgentEvent::SessionEstablished {
                agent_conversation_id,
            } => {
                if let Some(expected) = &self.agent_conversation_id {
                    if *expected != agent_conversation_id {
                        tracing::info!(
                            session_id = %self.id,
                            expected = %expected,
                            got = %agent_conversation_id,
                            "Requested conversation unavailable, backend started a fresh one"
                        );
                        self.send_frame(ServerFrame::status(
                            error_code::RESUME_UNAVAILABLE,
                            Some("previous conversation unavailable, started fresh".to_string()),
                        ))
                        .await;
                    }
                }
                self.agent_conversation_id = Some(agent_conversation_id.clone());
                if let Err(e) = self
                    .shared
                    .store
                    .set_agent_conversation_id(&self.id, Some(&agent_conversation_id))
                {
                    tracing::warn!(error = %e, "Failed to persist agent conversation id");
                }
            }
            AgentEvent::Text { delta } => {
                self.run_text.push_str(&delta);
                self.send_frame(ServerFrame::ResponseChunk {
                    content: delta,
                    done: false,
                })
                .await;
            }
            AgentEvent::Thinking { delta, done } => {
                self.send_frame(ServerFrame::Thinking {
                    content: delta,
                    signature: None,
                    done,
                })
                .await;
            }
            AgentEvent::ToolStart {
                tool_id,
                name,
                input,
            } => {
                self.tool_names.insert(tool_id.clone(), name.clone());
                self.send_frame(ServerFrame::ToolActivity {
                    tool_id,
                    input_summary: summarize_tool_input(&name, &input),
                    tool_name: name,
                    status: ToolStatus::Executing,
                    input: Some(input),
                    output_summary: None,
                    output: None,
                    duration_ms: None,
                })
                .await;
            }
            AgentEvent::ToolEnd {
                tool_id,
                output_summary,
                duration_ms,
                ok,
            } => {
                let tool_name = self.tool_names.remove(&tool_id).unwrap_or_default();
                self.send_frame(ServerFrame::ToolActivity {
                    tool_id,
                    tool_name,
                    status: if ok {
                        ToolStatus::Completed
                    } else {
                        ToolStatus::Failed
                    },
                    input_summary: None,
                    input: None,
                    output_summary,
                    output: None,
                    duration_ms: Some(duration_ms),
                })
                .await;
            }
            AgentEvent::Result { ok, error } => {
                if !ok {
                    let cause = error.as_deref().unwrap_or("agent run failed");
                    self.send_frame(ServerFrame::error(
                        error_code::DRIVER_FAILURE,
                        redact_error(cause),
                    ))
                    .await;
                }
                self.send_frame(ServerFrame::ResponseChunk {
                    content: String::new(),
                    done: true,
                })
                .await;
            }
        }
    }

    async fn handle_run_finished(&mut self, stream_id: String, outcome: RunOutcome) {
        let matches = self
            .current_stream
            .as_ref()
            .is_some_and(|c| c.stream_id == stream_id);
        if !matches {
            return;
        }
        self.current_stream = None;

        // A prompt still waiting at termination can never be answered.
        self.resolve_prompt_for_stream(&stream_id, DenyReason::Cancelled);

        if let Some(metadata) = self.shared.streams.finish(
            &stream_id,
            outcome.disposition,
            self.agent_conversation_id.clone(),
        ) {
            let action = match outcome.disposition {
                StreamOutcome::Cancelled => StreamAction::Cancelled,
                StreamOutcome::Completed | StreamOutcome::Failed => StreamAction::Completed,
            };
            self.send_frame(ServerFrame::StreamControl {
                action,
                stream_id: stream_id.clone(),
                metadata: Some(metadata),
            })
            .await;
        }

        if let Some(error) = &outcome.error {
            tracing::warn!(session_id = %self.id, stream_id = %stream_id, error = %error, "Run ended with error");
        }

        // Persist the turn with the next sequence numbers.
        if let Some(user_message) = self.pending_user_message.take() {
            self.persist_message(MessageRole::User, Value::String(user_message))
                .await;
        }
        let text = std::mem::take(&mut self.run_text);
        if !text.is_empty() {
            self.persist_message(MessageRole::Assistant, Value::String(text))
                .await;
        }
        self.touch();

        if self.auto_continue_pending && outcome.disposition == StreamOutcome::Completed {
            self.auto_continue_pending = false;
            tracing::info!(session_id = %self.id, "Plan approved, issuing continuation run");
            self.pending_user_message = Some(PLAN_CONTINUATION_PROMPT.to_string());
            self.start_run(PLAN_CONTINUATION_PROMPT.to_string()).await;
        }
    }

    /// Raise cancel on the in-flight run, if any. Idempotent; repeated or
    /// late cancels fall out of the stream registry as no-ops.
    fn cancel_current_stream(&mut self, cause: &str) {
        let Some(current) = &self.current_stream else {
            return;
        };
        let stream_id = current.stream_id.clone();
        if self.shared.streams.request_cancel(&stream_id) {
            tracing::info!(session_id = %self.id, stream_id = %stream_id, cause, "Cancel requested");
        }
        self.resolve_prompt_for_stream(&stream_id, DenyReason::Cancelled);
    }

    // ==================== Permission prompts ====================

    async fn handle_install_prompt(
        &mut self,
        request: PermissionRequest,
        stream_id: String,
        reply: oneshot::Sender<PermissionDecision>,
    ) {
        let stream_live = self
            .current_stream
            .as_ref()
            .is_some_and(|c| c.stream_id == stream_id);
        if !stream_live {
            let _ = reply.send(PermissionDecision::denied(DenyReason::Cancelled));
            return;
        }
        if self.pending_prompt.is_some() {
            tracing::warn!(session_id = %self.id, "Driver opened a second prompt, auto-denying");
            let _ = reply.send(PermissionDecision::denied(DenyReason::PromptBusy));
            return;
        }

        // Core-level policy: bypassPermissions auto-approves tool use. The
        // mode is read here, at install time, so a mid-stream mode change
        // affects the next prompt and never an already-emitted one.
        if self.permission_mode == PermissionMode::BypassPermissions
            && request.kind == PermissionKind::ToolUse
        {
            let _ = reply.send(PermissionDecision::Approved {
                modified_input: None,
                answers: None,
            });
            return;
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let deadline = timeout_seconds(request.kind, &self.shared.timeouts);

        let timer = {
            let cmd_tx = self.cmd_tx.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(deadline)).await;
                let _ = cmd_tx
                    .send(SessionCommand::PromptTimeout { request_id })
                    .await;
            })
        };

        self.pending_prompt = Some(PendingPrompt::new(
            request_id.clone(),
            stream_id,
            request.kind,
            reply,
            timer,
        ));

        self.send_frame(ServerFrame::PermissionRequest {
            request_id,
            request_type: request.kind,
            tool_name: request.tool_name,
            input_data: request.input,
            plan: request.plan,
            questions: request.questions,
            timeout_seconds: deadline,
        })
        .await;
    }

    async fn handle_permission_response(
        &mut self,
        request_id: String,
        approved: bool,
        modified_input: Option<Value>,
        answers: Option<Vec<QuestionAnswer>>,
    ) {
        let prompt = match self.pending_prompt.take() {
            Some(prompt) if prompt.request_id == request_id => prompt,
            other => {
                self.pending_prompt = other;
                tracing::warn!(
                    session_id = %self.id,
                    request_id = %request_id,
                    "Stray permission response, ignoring"
                );
                return;
            }
        };
        self.touch();

        if approved && prompt.kind == PermissionKind::PlanApproval
            && self.permission_mode == PermissionMode::Plan
        {
            // Approved plan: switch to acceptEdits and queue the follow-up
            // run for when the current one terminates.
            self.permission_mode = PermissionMode::AcceptEdits;
            self.auto_continue_pending = true;
            if let Err(e) = self
                .shared
                .store
                .update_permission_mode(&self.id, self.permission_mode)
            {
                tracing::warn!(error = %e, "Failed to persist permission mode");
            }
            self.send_frame(ServerFrame::PermissionModeUpdated {
                mode: self.permission_mode,
            })
            .await;
        }

        let decision = if approved {
            PermissionDecision::Approved {
                modified_input,
                answers,
            }
        } else {
            PermissionDecision::denied(DenyReason::UserDenied)
        };
        prompt.resolve(decision);
    }

    async fn handle_prompt_timeout(&mut self, request_id: String) {
        let prompt = match self.pending_prompt.take() {
            Some(prompt) if prompt.request_id == request_id => prompt,
            other => {
                self.pending_prompt = other;
                return; // already resolved
            }
        };
        tracing::info!(
            session_id = %self.id,
            request_id = %prompt.request_id,
            kind = %prompt.kind,
            "Permission prompt expired, auto-denying"
        );
        prompt.resolve(PermissionDecision::denied(DenyReason::Timeout));
        self.send_frame(ServerFrame::status(
            "permission_timeout",
            Some("permission timeout".to_string()),
        ))
        .await;
    }

    fn resolve_prompt_for_stream(&mut self, stream_id: &str, reason: DenyReason) {
        let belongs = self
            .pending_prompt
            .as_ref()
            .is_some_and(|p| p.stream_id == stream_id);
        if belongs {
            if let Some(prompt) = self.pending_prompt.take() {
                prompt.resolve(PermissionDecision::denied(reason));
            }
        }
    }

    // ==================== Mode / conversation management ====================

    async fn handle_set_mode(&mut self, mode: PermissionMode) {
        self.permission_mode = mode;
        self.touch();
        if let Err(e) = self.shared.store.update_permission_mode(&self.id, mode) {
            tracing::warn!(error = %e, "Failed to persist permission mode");
        }
        self.send_frame(ServerFrame::PermissionModeUpdated { mode })
            .await;
    }

    async fn handle_clear_session(&mut self) {
        self.cancel_current_stream("session_cleared");
        self.driver = None;
        self.auto_continue_pending = false;

        let new_conversation_id = uuid::Uuid::new_v4().to_string();
        self.agent_conversation_id = Some(new_conversation_id.clone());
        if let Err(e) = self
            .shared
            .store
            .set_agent_conversation_id(&self.id, Some(&new_conversation_id))
        {
            tracing::warn!(error = %e, "Failed to persist cleared conversation id");
        }
        if self.shared.clear_purges_messages {
            if let Err(e) = self.shared.store.clear_messages(&self.id) {
                tracing::warn!(error = %e, "Failed to purge message log");
            }
        }
        self.touch();

        self.send_frame(ServerFrame::SessionCleared {
            agent_conversation_id: new_conversation_id,
            message: "conversation cleared".to_string(),
        })
        .await;
    }

    async fn handle_switch_conversation(&mut self, agent_conversation_id: String) {
        self.cancel_current_stream("conversation_switched");
        // Recreate the driver so the next run opens the chosen conversation.
        self.driver = None;
        self.agent_conversation_id = Some(agent_conversation_id.clone());
        if let Err(e) = self
            .shared
            .store
            .set_agent_conversation_id(&self.id, Some(&agent_conversation_id))
        {
            tracing::warn!(error = %e, "Failed to persist switched conversation id");
        }
        self.touch();
        self.send_frame(ServerFrame::status(
            "conversation_switched",
            Some(agent_conversation_id),
        ))
        .await;
    }

    async fn handle_rebind(&mut self, conn_id: ConnId) {
        self.conn_id = Some(conn_id);
        self.touch();
        if let Err(e) = self
            .shared
            .store
            .update_status(&self.id, crate::store::SessionStatus::Active)
        {
            tracing::warn!(error = %e, "Failed to persist session status");
        }
    }

    async fn handle_shutdown(&mut self) {
        self.cancel_current_stream("shutdown");
        if let Some(current) = self.current_stream.take() {
            // Bounded wait for the forwarder; its RunFinished may be queued.
            let _ = tokio::time::timeout(CANCEL_GRACE + Duration::from_secs(1), current.run_task)
                .await;
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                if let SessionCommand::RunFinished { stream_id, outcome } = cmd {
                    self.handle_run_finished(stream_id, outcome).await;
                }
            }
        }
        self.flush_unflushed();
        if let Err(e) = self
            .shared
            .store
            .update_status(&self.id, crate::store::SessionStatus::Closed)
        {
            tracing::warn!(error = %e, "Failed to persist closed status");
        }
    }

    // ==================== Plumbing ====================

    async fn send_frame(&mut self, frame: ServerFrame) {
        let Some(conn_id) = self.conn_id.clone() else {
            return; // no transport attached; session lives on regardless
        };
        if let Err(e) = self.shared.connections.send(&conn_id, frame).await {
            tracing::warn!(
                session_id = %self.id,
                conn_id = %conn_id,
                error = %e,
                "Outbound send failed, treating peer as gone"
            );
            self.conn_id = None;
            self.cancel_current_stream("peer_gone");
        }
    }

    /// Append with retry-once; a second failure keeps the message in memory
    /// and degrades gracefully rather than dropping the turn.
    async fn persist_message(&mut self, role: MessageRole, content: Value) {
        self.flush_unflushed();
        if !self.unflushed.is_empty() {
            self.unflushed.push((role, content));
            return;
        }
        if let Err(first) = self.shared.store.append_message(&self.id, role, &content) {
            tracing::warn!(error = %first, "Store write failed, retrying once");
            if let Err(second) = self.shared.store.append_message(&self.id, role, &content) {
                tracing::error!(error = %second, "Store write failed twice, keeping message in memory");
                self.unflushed.push((role, content));
                self.send_frame(ServerFrame::status(
                    "store_degraded",
                    Some(format!("message retained in memory: {second}")),
                ))
                .await;
            }
        }
    }

    fn flush_unflushed(&mut self) {
        while !self.unflushed.is_empty() {
            let (role, content) = self.unflushed[0].clone();
            if self
                .shared
                .store
                .append_message(&self.id, role, &content)
                .is_err()
            {
                break;
            }
            self.unflushed.remove(0);
        }
    }

    fn save_screenshot(&self, context: &ElementContext) {
        let Some(encoded) = &context.screenshot_base64 else {
            return;
        };
        match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(bytes) => {
                let capture_id = uuid::Uuid::new_v4().to_string();
                if let Err(e) = self.shared.screenshots.save(&self.id, &capture_id, &bytes) {
                    tracing::warn!(error = %e, "Failed to save screenshot");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Undecodable screenshot payload"),
        }
    }

    fn touch(&self) {
        let now = chrono::Utc::now();
        self.last_activity.store(now.timestamp(), Ordering::Relaxed);
        if let Err(e) = self.shared.store.touch_activity(&self.id, now) {
            tracing::debug!(error = %e, "Failed to persist activity timestamp");
        }
    }
}

/// Forward driver events into the session's command queue until the run
/// terminates. Events produced after a cancel are dropped silently.
async fn run_stream(
    driver: Arc<dyn AgentDriver>,
    prompt: String,
    options: RunOptions,
    handle: StreamHandle,
    cmd_tx: mpsc::Sender<SessionCommand>,
) {
    let stream_id = handle.stream_id.clone();
    let cancel: CancellationToken = handle.cancel;

    let mut rx = match driver.run(&prompt, options, cancel.child_token()).await {
        Ok(rx) => rx,
        Err(e) => {
            let _ = cmd_tx
                .send(SessionCommand::RunFinished {
                    stream_id,
                    outcome: RunOutcome {
                        disposition: StreamOutcome::Failed,
                        error: Some(e.to_string()),
                    },
                })
                .await;
            return;
        }
    };

    let mut disposition = None;
    let mut error = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                // Grace drain: wait for the driver to close the stream,
                // dropping whatever it still produces.
                let deadline = tokio::time::Instant::now() + CANCEL_GRACE;
                loop {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(_) => {
                            tracing::warn!(stream_id = %stream_id, "Driver exceeded cancel grace window");
                            break;
                        }
                    }
                }
                disposition = Some(StreamOutcome::Cancelled);
                break;
            }
            event = rx.recv() => match event {
                Some(event) => {
                    if let AgentEvent::Result { ok, error: run_error } = &event {
                        disposition = Some(if *ok {
                            StreamOutcome::Completed
                        } else {
                            StreamOutcome::Failed
                        });
                        error = run_error.clone();
                    }
                    if cmd_tx
                        .send(SessionCommand::StreamEvent {
                            stream_id: stream_id.clone(),
                            event,
                        })
                        .await
                        .is_err()
                    {
                        return; // session is gone
                    }
                }
                None => break,
            }
        }
    }

    // A stream that closed without a result right as the cancel fired is a
    // cancellation, not a driver failure.
    let disposition = disposition.unwrap_or_else(|| {
        if cancel.is_cancelled() {
            StreamOutcome::Cancelled
        } else {
            StreamOutcome::Failed
        }
    });
    if disposition == StreamOutcome::Failed && error.is_none() {
        error = Some("agent run ended without a result".to_string());
    }
    let _ = cmd_tx
        .send(SessionCommand::RunFinished {
            stream_id,
            outcome: RunOutcome { disposition, error },
        })
        .await;
}

/// One-line preview of a tool invocation for the activity feed.
fn summarize_tool_input(tool_name: &str, input: &Value) -> Option<String> {
    let field = match tool_name {
        "bash" | "shell" => "command",
        "read_file" | "write_file" | "patch" => "path",
        "search" | "keyword_search" => "query",
        "fetch" | "browser_navigate" => "url",
        _ => return None,
    };
    input
        .get(field)
        .and_then(Value::as_str)
        .map(|s| truncate_line(s, 80))
}

fn truncate_line(s: &str, max: usize) -> String {
    let first = s.lines().next().unwrap_or(s).trim();
    if first.len() <= max {
        first.to_string()
    } else {
        let mut end = max;
        while end > 0 && !first.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &first[..end])
    }
}

/// Driver failures reach the client with a single-line, bounded cause.
fn redact_error(message: &str) -> String {
    truncate_line(message, 200)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OUTBOUND_QUEUE;
    use crate::driver::testing::{ScriptStep, ScriptedDriver};
    use crate::store::{SessionRecord, SessionStatus};
    use chrono::Utc;

    struct Harness {
        handle: SessionHandle,
        frames: mpsc::Receiver<ServerFrame>,
        driver: Arc<ScriptedDriver>,
        store: Store,
        conn_id: ConnId,
        connections: Arc<ConnectionManager>,
        _shots: tempfile::TempDir,
    }

    async fn harness(mode: PermissionMode, timeouts: PermissionTimeouts) -> Harness {
        let driver = Arc::new(ScriptedDriver::new());
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .create_session(&SessionRecord {
                session_id: "s1".to_string(),
                agent_conversation_id: None,
                project_root: "/proj".to_string(),
                tab_id: "t1".to_string(),
                page_url: "https://x/".to_string(),
                permission_mode: mode,
                status: SessionStatus::Active,
                created_at: now,
                last_activity: now,
            })
            .unwrap();

        let connections = Arc::new(ConnectionManager::new(8));
        let (frame_tx, frames) = mpsc::channel(OUTBOUND_QUEUE);
        let conn_id = connections.try_register(frame_tx).await.unwrap();

        let shots = tempfile::tempdir().unwrap();
        let factory_driver = Arc::clone(&driver);
        let shared = Arc::new(SessionShared {
            store: store.clone(),
            screenshots: ScreenshotStore::new(shots.path().to_path_buf()),
            streams: Arc::new(StreamController::new()),
            connections: Arc::clone(&connections),
            timeouts,
            clear_purges_messages: false,
            driver_factory: Arc::new(move || {
                Arc::clone(&factory_driver) as Arc<dyn AgentDriver>
            }),
        });

        let handle = Session::spawn(
            SessionSeed {
                session_id: "s1".to_string(),
                tab_id: "t1".to_string(),
                page_url: "https://x/".to_string(),
                project_root: PathBuf::from("/proj"),
                permission_mode: mode,
                agent_conversation_id: None,
            },
            shared,
            Some(conn_id.clone()),
        );

        Harness {
            handle,
            frames,
            driver,
            store,
            conn_id,
            connections,
            _shots: shots,
        }
    }

    async fn next_frame(h: &mut Harness) -> ServerFrame {
        tokio::time::timeout(Duration::from_secs(3), h.frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("frame channel closed")
    }

    async fn chat(h: &Harness, message: &str) {
        assert!(
            h.handle
                .send(SessionCommand::Chat {
                    message: message.to_string(),
                    element_context: None,
                    selected_text: None,
                })
                .await
        );
    }

    #[tokio::test]
    async fn happy_path_streams_and_persists() {
        let mut h = harness(PermissionMode::Plan, PermissionTimeouts::default()).await;
        h.driver.push_simple_run("c1", "Hello");
        chat(&h, "hi").await;

        let ServerFrame::StreamControl { action: StreamAction::Started, stream_id, .. } =
            next_frame(&mut h).await
        else {
            panic!("expected started first");
        };

        match next_frame(&mut h).await {
            ServerFrame::ResponseChunk { content, done } => {
                assert_eq!(content, "Hello");
                assert!(!done);
            }
            other => panic!("expected chunk, got {other:?}"),
        }
        match next_frame(&mut h).await {
            ServerFrame::ResponseChunk { content, done } => {
                assert_eq!(content, "");
                assert!(done);
            }
            other => panic!("expected terminal chunk, got {other:?}"),
        }
        match next_frame(&mut h).await {
            ServerFrame::StreamControl {
                action: StreamAction::Completed,
                stream_id: terminated,
                metadata,
            } => {
                assert_eq!(terminated, stream_id);
                let metadata = metadata.expect("terminator carries metadata");
                assert_eq!(metadata.tool_count, 0);
                assert_eq!(metadata.agent_conversation_id.as_deref(), Some("c1"));
            }
            other => panic!("expected completed, got {other:?}"),
        }

        // Wait for persistence to land, then assert the turn was stored.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let messages = h.store.get_messages("s1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].seq, 1);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].seq, 2);
        assert_eq!(
            h.store.get_session("s1").unwrap().agent_conversation_id.as_deref(),
            Some("c1")
        );
    }

    #[tokio::test]
    async fn second_chat_is_busy() {
        let mut h = harness(PermissionMode::Plan, PermissionTimeouts::default()).await;
        h.driver.push_run(vec![
            ScriptStep::Sleep(Duration::from_millis(300)),
            ScriptStep::Emit(AgentEvent::Result { ok: true, error: None }),
        ]);
        chat(&h, "first").await;
        chat(&h, "second").await;

        let mut saw_busy = false;
        let mut saw_completed = false;
        for _ in 0..6 {
            match next_frame(&mut h).await {
                ServerFrame::Error { code, .. } if code == error_code::BUSY => saw_busy = true,
                ServerFrame::StreamControl {
                    action: StreamAction::Completed,
                    ..
                } => {
                    saw_completed = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_busy, "second chat must be rejected with busy");
        assert!(saw_completed, "first run must complete unaffected");
    }

    #[tokio::test]
    async fn cancel_terminates_within_grace() {
        let mut h = harness(PermissionMode::Plan, PermissionTimeouts::default()).await;
        h.driver.push_run(vec![
            ScriptStep::Emit(AgentEvent::Text {
                delta: "partial".to_string(),
            }),
            ScriptStep::WaitForCancel,
        ]);
        chat(&h, "long").await;

        // started + first chunk
        let _ = next_frame(&mut h).await;
        let _ = next_frame(&mut h).await;

        let cancelled_at = std::time::Instant::now();
        assert!(h.handle.send(SessionCommand::Cancel).await);

        match next_frame(&mut h).await {
            ServerFrame::StreamControl {
                action: StreamAction::Cancelled,
                ..
            } => {}
            other => panic!("expected cancelled terminator, got {other:?}"),
        }
        assert!(cancelled_at.elapsed() < CANCEL_GRACE + Duration::from_secs(1));

        // No data frames after the terminator.
        assert!(
            tokio::time::timeout(Duration::from_millis(200), h.frames.recv())
                .await
                .is_err(),
            "no frames may follow the terminator"
        );
    }

    #[tokio::test]
    async fn permission_timeout_auto_denies_and_session_survives() {
        let timeouts = PermissionTimeouts {
            tool_use: 0, // expire immediately
            plan_approval: 300,
            question: 60,
        };
        let mut h = harness(PermissionMode::Plan, timeouts).await;
        h.driver.push_run(vec![
            ScriptStep::Permission(PermissionRequest {
                kind: PermissionKind::ToolUse,
                tool_name: Some("bash".to_string()),
                input: Some(serde_json::json!({"command": "rm -rf /"})),
                plan: None,
                questions: None,
            }),
            ScriptStep::Emit(AgentEvent::Result { ok: true, error: None }),
        ]);
        chat(&h, "do something").await;

        let mut saw_request = false;
        let mut saw_timeout_status = false;
        loop {
            match next_frame(&mut h).await {
                ServerFrame::PermissionRequest { request_type, .. } => {
                    assert_eq!(request_type, PermissionKind::ToolUse);
                    saw_request = true;
                }
                ServerFrame::Status { status, .. } if status == "permission_timeout" => {
                    saw_timeout_status = true;
                }
                ServerFrame::StreamControl {
                    action: StreamAction::Completed,
                    ..
                } => break,
                _ => {}
            }
        }
        assert!(saw_request);
        assert!(saw_timeout_status);

        let decisions = h.driver.decisions_snapshot();
        assert_eq!(decisions.len(), 1);
        assert!(matches!(
            decisions[0],
            PermissionDecision::Denied {
                reason: DenyReason::Timeout
            }
        ));

        // The session stays usable.
        h.driver.push_simple_run("c1", "ok");
        chat(&h, "again").await;
        loop {
            if let ServerFrame::StreamControl {
                action: StreamAction::Completed,
                ..
            } = next_frame(&mut h).await
            {
                break;
            }
        }
    }

    #[tokio::test]
    async fn mode_change_applies_to_next_prompt_only() {
        let mut h = harness(PermissionMode::Plan, PermissionTimeouts::default()).await;
        h.driver.push_run(vec![
            ScriptStep::Permission(PermissionRequest {
                kind: PermissionKind::ToolUse,
                tool_name: Some("bash".to_string()),
                input: None,
                plan: None,
                questions: None,
            }),
            ScriptStep::Permission(PermissionRequest {
                kind: PermissionKind::ToolUse,
                tool_name: Some("bash".to_string()),
                input: None,
                plan: None,
                questions: None,
            }),
            ScriptStep::Emit(AgentEvent::Result { ok: true, error: None }),
        ]);
        chat(&h, "two tools").await;

        let _started = next_frame(&mut h).await;
        let first_request = match next_frame(&mut h).await {
            ServerFrame::PermissionRequest { request_id, .. } => request_id,
            other => panic!("expected permission request, got {other:?}"),
        };

        // Flip to bypass while the first prompt is still outstanding.
        assert!(
            h.handle
                .send(SessionCommand::SetPermissionMode {
                    mode: PermissionMode::BypassPermissions
                })
                .await
        );
        match next_frame(&mut h).await {
            ServerFrame::PermissionModeUpdated { mode } => {
                assert_eq!(mode, PermissionMode::BypassPermissions);
            }
            other => panic!("expected mode ack, got {other:?}"),
        }

        // The already-emitted prompt still needs a reply.
        assert!(
            h.handle
                .send(SessionCommand::PermissionResponse {
                    request_id: first_request,
                    approved: true,
                    modified_input: None,
                    answers: None,
                })
                .await
        );

        // The second prompt is auto-approved: no further permission_request
        // frame, just the terminal chunk + terminator.
        loop {
            match next_frame(&mut h).await {
                ServerFrame::PermissionRequest { .. } => {
                    panic!("second prompt must be auto-approved in bypass mode")
                }
                ServerFrame::StreamControl {
                    action: StreamAction::Completed,
                    ..
                } => break,
                _ => {}
            }
        }

        let decisions = h.driver.decisions_snapshot();
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(PermissionDecision::is_approved));
    }

    #[tokio::test]
    async fn approved_plan_switches_mode_and_continues() {
        let mut h = harness(PermissionMode::Plan, PermissionTimeouts::default()).await;
        h.driver.push_run(vec![
            ScriptStep::Emit(AgentEvent::SessionEstablished {
                agent_conversation_id: "c1".to_string(),
            }),
            ScriptStep::Permission(PermissionRequest {
                kind: PermissionKind::PlanApproval,
                tool_name: None,
                input: None,
                plan: Some("1. do the thing".to_string()),
                questions: None,
            }),
            ScriptStep::Emit(AgentEvent::Result { ok: true, error: None }),
        ]);
        h.driver.push_simple_run("c1", "done");
        chat(&h, "plan something").await;

        let first_stream = match next_frame(&mut h).await {
            ServerFrame::StreamControl { action: StreamAction::Started, stream_id, .. } => stream_id,
            other => panic!("expected started, got {other:?}"),
        };
        let request_id = loop {
            if let ServerFrame::PermissionRequest { request_id, request_type, .. } =
                next_frame(&mut h).await
            {
                assert_eq!(request_type, PermissionKind::PlanApproval);
                break request_id;
            }
        };

        assert!(
            h.handle
                .send(SessionCommand::PermissionResponse {
                    request_id,
                    approved: true,
                    modified_input: None,
                    answers: None,
                })
                .await
        );

        let mut saw_mode_switch = false;
        let second_stream = loop {
            match next_frame(&mut h).await {
                ServerFrame::PermissionModeUpdated { mode } => {
                    assert_eq!(mode, PermissionMode::AcceptEdits);
                    saw_mode_switch = true;
                }
                ServerFrame::StreamControl {
                    action: StreamAction::Started,
                    stream_id,
                    ..
                } => break stream_id,
                _ => {}
            }
        };
        assert!(saw_mode_switch);
        assert_ne!(first_stream, second_stream, "continuation gets a fresh stream id");

        loop {
            if let ServerFrame::StreamControl {
                action: StreamAction::Completed,
                ..
            } = next_frame(&mut h).await
            {
                break;
            }
        }

        let runs = h.driver.seen_runs.lock().unwrap().clone();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].prompt, PLAN_CONTINUATION_PROMPT);
        assert_eq!(runs[1].permission_mode, PermissionMode::AcceptEdits);
        // The continuation reuses the established conversation.
        assert_eq!(runs[1].agent_conversation_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn connection_loss_cancels_but_keeps_session() {
        let mut h = harness(PermissionMode::Plan, PermissionTimeouts::default()).await;
        h.driver.push_run(vec![
            ScriptStep::Emit(AgentEvent::Text {
                delta: "partial".to_string(),
            }),
            ScriptStep::WaitForCancel,
        ]);
        chat(&h, "long").await;
        let _started = next_frame(&mut h).await;
        let _chunk = next_frame(&mut h).await;

        assert!(
            h.handle
                .send(SessionCommand::ConnectionLost {
                    conn_id: h.conn_id.clone()
                })
                .await
        );
        // Give the cancelled run time to wind down before the next chat.
        tokio::time::sleep(Duration::from_millis(500)).await;

        // The driver observed the cancel and the session is still alive:
        // a rebind plus a fresh run works on the same actor.
        let (frame_tx, mut frames2) = mpsc::channel(OUTBOUND_QUEUE);
        let new_conn = h.connections.try_register(frame_tx).await.unwrap();
        assert!(h.handle.send(SessionCommand::Rebind { conn_id: new_conn }).await);

        h.driver.push_simple_run("c2", "back");
        chat(&h, "hello again").await;
        let frame = tokio::time::timeout(Duration::from_secs(3), frames2.recv())
            .await
            .expect("session must serve the rebound connection")
            .expect("channel open");
        assert!(matches!(
            frame,
            ServerFrame::StreamControl {
                action: StreamAction::Started,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn clear_session_detaches_conversation() {
        let mut h = harness(PermissionMode::Plan, PermissionTimeouts::default()).await;
        h.driver.push_simple_run("c1", "Hello");
        chat(&h, "hi").await;
        loop {
            if let ServerFrame::StreamControl {
                action: StreamAction::Completed,
                ..
            } = next_frame(&mut h).await
            {
                break;
            }
        }

        assert!(h.handle.send(SessionCommand::ClearSession).await);
        let new_id = loop {
            if let ServerFrame::SessionCleared {
                agent_conversation_id,
                ..
            } = next_frame(&mut h).await
            {
                break agent_conversation_id;
            }
        };
        assert_ne!(new_id, "c1");

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Detach-only default: the log survives, the conversation id moved on.
        assert_eq!(h.store.message_count("s1").unwrap(), 2);
        assert_eq!(
            h.store.get_session("s1").unwrap().agent_conversation_id,
            Some(new_id)
        );
    }

    #[tokio::test]
    async fn stray_permission_response_is_ignored() {
        let mut h = harness(PermissionMode::Plan, PermissionTimeouts::default()).await;
        h.driver.push_run(vec![
            ScriptStep::Permission(PermissionRequest {
                kind: PermissionKind::ToolUse,
                tool_name: Some("bash".to_string()),
                input: None,
                plan: None,
                questions: None,
            }),
            ScriptStep::Emit(AgentEvent::Result { ok: true, error: None }),
        ]);
        chat(&h, "tool").await;

        let _started = next_frame(&mut h).await;
        let request_id = loop {
            if let ServerFrame::PermissionRequest { request_id, .. } = next_frame(&mut h).await {
                break request_id;
            }
        };

        // Mismatched id: logged and ignored, the prompt stays pending.
        assert!(
            h.handle
                .send(SessionCommand::PermissionResponse {
                    request_id: "wrong".to_string(),
                    approved: true,
                    modified_input: None,
                    answers: None,
                })
                .await
        );
        // The real reply still resolves it.
        assert!(
            h.handle
                .send(SessionCommand::PermissionResponse {
                    request_id,
                    approved: false,
                    modified_input: None,
                    answers: None,
                })
                .await
        );

        loop {
            if let ServerFrame::StreamControl {
                action: StreamAction::Completed,
                ..
            } = next_frame(&mut h).await
            {
                break;
            }
        }
        let decisions = h.driver.decisions_snapshot();
        assert_eq!(decisions.len(), 1);
        assert!(matches!(
            decisions[0],
            PermissionDecision::Denied {
                reason: DenyReason::UserDenied
            }
        ));
    }
}
