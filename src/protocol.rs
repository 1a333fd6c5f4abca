//! Wire protocol between the browser extension and the relay.
//!
//! Every frame is a JSON object with a `type` tag. The enums here are the
//! stable contract; field names and tag spellings must not change without a
//! matching extension release.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// WebSocket close code for malformed or out-of-order frames.
pub const CLOSE_PROTOCOL_ERROR: u16 = 4002;
/// WebSocket close code for a non-extension origin.
pub const CLOSE_ORIGIN_REJECTED: u16 = 4003;
/// WebSocket close code when the connection cap is exceeded.
pub const CLOSE_CAPACITY_EXCEEDED: u16 = 4008;

/// Permission mode governing how tool prompts are handled.
///
/// Wire spellings follow the extension settings UI: `plan`, `acceptEdits`,
/// `bypassPermissions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Plan,
    AcceptEdits,
    BypassPermissions,
}

impl PermissionMode {
    /// Parse the wire spelling. Used by the store loader.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plan" => Some(Self::Plan),
            "acceptEdits" => Some(Self::AcceptEdits),
            "bypassPermissions" => Some(Self::BypassPermissions),
            _ => None,
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionMode::Plan => write!(f, "plan"),
            PermissionMode::AcceptEdits => write!(f, "acceptEdits"),
            PermissionMode::BypassPermissions => write!(f, "bypassPermissions"),
        }
    }
}

/// Captured UI element sent alongside a chat message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<String>,
    /// Visible text content, truncated by the capture layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_snippet: Option<String>,
    /// PNG screenshot of the element, base64-encoded by the extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_base64: Option<String>,
}

/// A single question posed by an `ask_user_question` permission prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserQuestion {
    #[serde(default)]
    pub header: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

/// An option within a [`UserQuestion`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

/// Answer to one question of a question set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionAnswer {
    pub question_index: usize,
    pub selected: Vec<String>,
}

// ============================================================
// Client → Server
// ============================================================

/// Frames the extension sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Must be the first frame on every connection. A missing
    /// `permission_mode` falls back to the server's configured default.
    Handshake {
        #[serde(default)]
        permission_mode: Option<PermissionMode>,
        page_url: String,
        tab_id: String,
    },
    Chat {
        message: String,
        #[serde(default)]
        element_context: Option<ElementContext>,
        #[serde(default)]
        selected_text: Option<String>,
    },
    CancelRequest,
    UpdatePermissionMode {
        mode: PermissionMode,
    },
    PermissionResponse {
        request_id: String,
        approved: bool,
        #[serde(default)]
        modified_input: Option<Value>,
        #[serde(default)]
        answers: Option<Vec<QuestionAnswer>>,
        #[serde(default)]
        reason: Option<String>,
    },
    ClearSession,
    Pong,
}

impl ClientFrame {
    /// Tag names accepted from the client. Frames with a `type` outside this
    /// set are logged and ignored rather than failing the connection.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "handshake",
        "chat",
        "cancel_request",
        "update_permission_mode",
        "permission_response",
        "clear_session",
        "pong",
    ];
}

// ============================================================
// Server → Client
// ============================================================

/// Lifecycle marker carried by `stream_control` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamAction {
    Started,
    Completed,
    Cancelled,
}

/// Terminator metadata for a finished stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamMetadata {
    pub duration_ms: u64,
    pub tool_count: u64,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_conversation_id: Option<String>,
}

/// Progress states reported for one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// Kind discriminator on `permission_request` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    ToolUse,
    PlanApproval,
    AskUserQuestion,
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionKind::ToolUse => write!(f, "tool_use"),
            PermissionKind::PlanApproval => write!(f, "plan_approval"),
            PermissionKind::AskUserQuestion => write!(f, "ask_user_question"),
        }
    }
}

/// Frames the relay sends to the extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    HandshakeAck {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_conversation_id: Option<String>,
        resumed: bool,
    },
    Ping,
    StreamControl {
        action: StreamAction,
        stream_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<StreamMetadata>,
    },
    ResponseChunk {
        content: String,
        done: bool,
    },
    Thinking {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        done: bool,
    },
    ToolActivity {
        tool_id: String,
        tool_name: String,
        status: ToolStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    PermissionRequest {
        request_id: String,
        request_type: PermissionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plan: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        questions: Option<Vec<UserQuestion>>,
        timeout_seconds: u64,
    },
    PermissionModeUpdated {
        mode: PermissionMode,
    },
    SessionCleared {
        agent_conversation_id: String,
        message: String,
    },
    Status {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerFrame {
    /// Build an `error` frame from a taxonomy code.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Build a `status` frame.
    pub fn status(status: impl Into<String>, detail: Option<String>) -> Self {
        ServerFrame::Status {
            status: status.into(),
            detail,
        }
    }
}

/// In-band error codes of the `error` frame. Connection-fatal conditions
/// use the 4xxx close codes instead.
pub mod error_code {
    pub const BUSY: &str = "busy";
    pub const DRIVER_FAILURE: &str = "driver_failure";
    pub const RESUME_UNAVAILABLE: &str = "resume_unavailable";
}
