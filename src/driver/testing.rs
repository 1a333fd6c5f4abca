//! Scripted driver for tests.
//!
//! Each call to `run` pops the next scripted run and replays its steps.
//! Permission decisions handed back by the core are recorded for assertions.

use super::{
    AgentDriver, AgentEvent, DriverError, PermissionDecision, PermissionRequest, RunOptions,
};
use crate::protocol::PermissionMode;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One step of a scripted run.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit an event to the stream.
    Emit(AgentEvent),
    /// Raise a permission request and block on the core's decision.
    Permission(PermissionRequest),
    /// Sleep, ending the stream early if cancelled meanwhile.
    Sleep(Duration),
    /// Park until the cancel signal fires, then end the stream.
    WaitForCancel,
}

/// Options observed at each `run` call.
#[derive(Debug, Clone)]
pub struct SeenRun {
    pub prompt: String,
    pub permission_mode: PermissionMode,
    pub agent_conversation_id: Option<String>,
}

#[derive(Default)]
pub struct ScriptedDriver {
    runs: Mutex<VecDeque<Vec<ScriptStep>>>,
    pub decisions: Arc<Mutex<Vec<PermissionDecision>>>,
    pub seen_runs: Arc<Mutex<Vec<SeenRun>>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the steps for the next run.
    pub fn push_run(&self, steps: Vec<ScriptStep>) {
        self.runs.lock().unwrap().push_back(steps);
    }

    /// Convenience: a run that streams `text` then completes.
    pub fn push_simple_run(&self, conversation_id: &str, text: &str) {
        self.push_run(vec![
            ScriptStep::Emit(AgentEvent::SessionEstablished {
                agent_conversation_id: conversation_id.to_string(),
            }),
            ScriptStep::Emit(AgentEvent::Text {
                delta: text.to_string(),
            }),
            ScriptStep::Emit(AgentEvent::Result { ok: true, error: None }),
        ]);
    }

    pub fn decisions_snapshot(&self) -> Vec<PermissionDecision> {
        self.decisions.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentDriver for ScriptedDriver {
    async fn run(
        &self,
        prompt: &str,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentEvent>, DriverError> {
        self.seen_runs.lock().unwrap().push(SeenRun {
            prompt: prompt.to_string(),
            permission_mode: options.permission_mode,
            agent_conversation_id: options.agent_conversation_id.clone(),
        });

        let steps = self
            .runs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![ScriptStep::Emit(AgentEvent::Result { ok: true, error: None })]);

        let decisions = Arc::clone(&self.decisions);
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            for step in steps {
                match step {
                    ScriptStep::Emit(event) => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::Permission(request) => {
                        let decision = options.permissions.request(request).await;
                        decisions.lock().unwrap().push(decision);
                    }
                    ScriptStep::Sleep(duration) => {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(duration) => {}
                        }
                    }
                    ScriptStep::WaitForCancel => {
                        cancel.cancelled().await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
