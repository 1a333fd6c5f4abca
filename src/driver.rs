//! Agent Driver contract.
//!
//! A driver turns one prompt into a stream of [`AgentEvent`]s. Two
//! implementations ship: a process-hosted driver speaking NDJSON over a
//! child's stdio, and an in-process driver calling the model API directly.
//! Nothing outside this module depends on which one is active.

mod inproc;
mod process;

#[cfg(test)]
pub mod testing;

pub use inproc::InprocDriver;
pub use process::ProcessDriver;

use crate::config::{Config, DriverKind};
use crate::protocol::{PermissionKind, PermissionMode, QuestionAnswer, UserQuestion};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("failed to start agent backend: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("agent backend protocol error: {0}")]
    Protocol(String),
    #[error("agent backend unavailable: {0}")]
    Unavailable(String),
}

/// Events produced by a driver during one run.
///
/// The tag spellings double as the NDJSON line format of the process driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The backend announced (or confirmed) the conversation id for this
    /// session. Emitted at most once per run, before any text.
    SessionEstablished { agent_conversation_id: String },
    Text {
        delta: String,
    },
    Thinking {
        delta: String,
        #[serde(default)]
        done: bool,
    },
    ToolStart {
        tool_id: String,
        name: String,
        input: Value,
    },
    ToolEnd {
        tool_id: String,
        #[serde(default)]
        output_summary: Option<String>,
        duration_ms: u64,
        ok: bool,
    },
    Result {
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
}

/// A decision request raised by the driver mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub kind: PermissionKind,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub questions: Option<Vec<UserQuestion>>,
}

/// Why a prompt was denied without user approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    UserDenied,
    Timeout,
    Cancelled,
    PromptBusy,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::UserDenied => write!(f, "user_denied"),
            DenyReason::Timeout => write!(f, "timeout"),
            DenyReason::Cancelled => write!(f, "cancelled"),
            DenyReason::PromptBusy => write!(f, "prompt_busy"),
        }
    }
}

/// The outcome handed back to a waiting driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionDecision {
    Approved {
        #[serde(default)]
        modified_input: Option<Value>,
        #[serde(default)]
        answers: Option<Vec<QuestionAnswer>>,
    },
    Denied {
        reason: DenyReason,
    },
}

impl PermissionDecision {
    pub fn denied(reason: DenyReason) -> Self {
        PermissionDecision::Denied { reason }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, PermissionDecision::Approved { .. })
    }
}

/// Hook through which a driver obtains permission decisions. The call blocks
/// (from the driver's perspective) until the decision exists.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn request(&self, request: PermissionRequest) -> PermissionDecision;
}

/// Per-run options handed to [`AgentDriver::run`].
#[derive(Clone)]
pub struct RunOptions {
    pub project_root: PathBuf,
    pub permission_mode: PermissionMode,
    /// Conversation to resume; `None` lets the backend mint one.
    pub agent_conversation_id: Option<String>,
    pub allowed_tools: Vec<String>,
    pub permissions: Arc<dyn PermissionHandler>,
}

/// The pluggable backend behind one streaming operation.
///
/// Contract: the returned channel yields events in production order and
/// closes when the run ends. When `cancel` fires the driver stops producing
/// events and ends the stream promptly (target under the grace window).
#[async_trait]
pub trait AgentDriver: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentEvent>, DriverError>;
}

/// Build the configured driver. This is the only place a concrete driver
/// type is named outside the driver module.
pub fn create_driver(config: &Config) -> Arc<dyn AgentDriver> {
    match config.driver {
        DriverKind::Process => Arc::new(ProcessDriver::new(&config.agent_command)),
        DriverKind::Inproc => Arc::new(InprocDriver::from_env()),
    }
}
