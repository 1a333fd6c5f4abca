//! Interactive permission prompts.
//!
//! A driver blocks on its `on_permission_request` hook until a decision
//! exists. The handler here funnels each request into the owning session's
//! command queue; the session installs it as the (single) pending prompt and
//! resolves it from exactly one of: the extension's reply, the deadline
//! timer, or stream cancellation.

use crate::config::PermissionTimeouts;
use crate::driver::{DenyReason, PermissionDecision, PermissionHandler, PermissionRequest};
use crate::protocol::PermissionKind;
use crate::session::SessionCommand;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Deadline in seconds for a prompt of the given kind.
pub fn timeout_seconds(kind: PermissionKind, timeouts: &PermissionTimeouts) -> u64 {
    match kind {
        PermissionKind::ToolUse => timeouts.tool_use,
        PermissionKind::PlanApproval => timeouts.plan_approval,
        PermissionKind::AskUserQuestion => timeouts.question,
    }
}

/// The one outstanding prompt a session may hold.
pub struct PendingPrompt {
    pub request_id: String,
    pub stream_id: String,
    pub kind: PermissionKind,
    reply: oneshot::Sender<PermissionDecision>,
    timer: JoinHandle<()>,
}

impl PendingPrompt {
    pub fn new(
        request_id: String,
        stream_id: String,
        kind: PermissionKind,
        reply: oneshot::Sender<PermissionDecision>,
        timer: JoinHandle<()>,
    ) -> Self {
        Self {
            request_id,
            stream_id,
            kind,
            reply,
            timer,
        }
    }

    /// Deliver the decision and stop the deadline timer. Consumes the slot;
    /// a prompt resolves exactly once.
    pub fn resolve(self, decision: PermissionDecision) {
        self.timer.abort();
        // The hook may have given up (cancelled run); nothing to do then.
        let _ = self.reply.send(decision);
    }
}

/// [`PermissionHandler`] wired to one session's command queue.
pub struct SessionPermissionHandler {
    cmd_tx: mpsc::Sender<SessionCommand>,
    stream_id: String,
}

impl SessionPermissionHandler {
    pub fn new(cmd_tx: mpsc::Sender<SessionCommand>, stream_id: String) -> Self {
        Self { cmd_tx, stream_id }
    }
}

#[async_trait]
impl PermissionHandler for SessionPermissionHandler {
    async fn request(&self, request: PermissionRequest) -> PermissionDecision {
        let (reply_tx, reply_rx) = oneshot::channel();
        let installed = self
            .cmd_tx
            .send(SessionCommand::InstallPrompt {
                request,
                stream_id: self.stream_id.clone(),
                reply: reply_tx,
            })
            .await;
        if installed.is_err() {
            // Session is gone; the run is being torn down.
            return PermissionDecision::denied(DenyReason::Cancelled);
        }
        reply_rx
            .await
            .unwrap_or(PermissionDecision::denied(DenyReason::Cancelled))
    }
}
