//! Store schema and record types.

use crate::protocol::PermissionMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    agent_conversation_id TEXT,
    project_root TEXT NOT NULL,
    tab_id TEXT NOT NULL,
    page_url TEXT NOT NULL,
    permission_mode TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    last_activity TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_resume
    ON sessions(project_root, page_url, last_activity DESC);
CREATE INDEX IF NOT EXISTS idx_sessions_tab ON sessions(tab_id);

CREATE TABLE IF NOT EXISTS messages (
    session_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    ts TEXT NOT NULL,

    PRIMARY KEY (session_id, seq),
    FOREIGN KEY (session_id) REFERENCES sessions(session_id) ON DELETE CASCADE
);
"#;

/// Additive migration: per-message uuid exposed by the history endpoint.
/// Fails harmlessly once the column exists.
pub const MIGRATION_ADD_MESSAGE_UUID: &str = "ALTER TABLE messages ADD COLUMN uuid TEXT";

/// Session lifecycle status as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Closed,
}

impl SessionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "idle" => Some(Self::Idle),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Durable session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub agent_conversation_id: Option<String>,
    pub project_root: String,
    pub tab_id: String,
    pub page_url: String,
    pub permission_mode: PermissionMode,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Role of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    ToolResult,
    Status,
}

impl MessageRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool_result" => Some(Self::ToolResult),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::ToolResult => write!(f, "tool_result"),
            MessageRole::Status => write!(f, "status"),
        }
    }
}

/// Append-only message row. `seq` values per session are 1,2,3,… with no
/// gaps over the session's full lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub session_id: String,
    pub seq: i64,
    pub uuid: String,
    pub role: MessageRole,
    pub content: serde_json::Value,
    pub ts: DateTime<Utc>,
}
