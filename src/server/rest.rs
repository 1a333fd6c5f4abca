//! Read-only REST surface over the Store, plus the conversation-switch
//! control endpoint and health.

use super::AppState;
use crate::session::SessionCommand;
use crate::store::SessionRecord;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

const TITLE_LIMIT: usize = 60;

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_conversation_id: Option<String>,
    pub title: String,
    pub status: String,
    pub message_count: i64,
}

#[derive(Debug, Serialize)]
pub struct AgentSessionSummary {
    pub session_id: String,
    pub agent_conversation_id: String,
    pub title: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub role: String,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
    pub uuid: String,
}

#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    pub target_agent_conversation_id: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
    pub active_connections: usize,
}

/// Session title: first user message, falling back to the page URL.
fn session_title(state: &AppState, record: &SessionRecord) -> String {
    let title = state
        .store
        .first_user_message(&record.session_id)
        .ok()
        .flatten()
        .unwrap_or_else(|| record.page_url.clone());
    truncate_title(&title)
}

fn truncate_title(s: &str) -> String {
    let first = s.lines().next().unwrap_or(s).trim();
    if first.len() <= TITLE_LIMIT {
        return first.to_string();
    }
    let mut end = TITLE_LIMIT;
    while end > 0 && !first.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &first[..end])
}

pub async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummary>>, AppError> {
    let records = state
        .store
        .list_sessions()
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let summaries = records
        .iter()
        .map(|record| SessionSummary {
            session_id: record.session_id.clone(),
            agent_conversation_id: record.agent_conversation_id.clone(),
            title: session_title(&state, record),
            status: record.status.to_string(),
            message_count: state.store.message_count(&record.session_id).unwrap_or(0),
        })
        .collect();
    Ok(Json(summaries))
}

pub async fn session_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MessageView>>, AppError> {
    // Distinguish empty history from an unknown session.
    state
        .store
        .get_session(&id)
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    let messages = state
        .store
        .get_messages(&id)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(
        messages
            .into_iter()
            .map(|message| MessageView {
                role: message.role.to_string(),
                content: message.content,
                timestamp: message.ts,
                uuid: message.uuid,
            })
            .collect(),
    ))
}

/// The resumable set: sessions holding an agent conversation id.
pub async fn list_agent_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<AgentSessionSummary>>, AppError> {
    let records = state
        .store
        .list_agent_sessions()
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let summaries = records
        .iter()
        .filter_map(|record| {
            let agent_conversation_id = record.agent_conversation_id.clone()?;
            Some(AgentSessionSummary {
                session_id: record.session_id.clone(),
                agent_conversation_id,
                title: session_title(&state, record),
                status: record.status.to_string(),
                created_at: record.created_at,
                last_activity: record.last_activity,
            })
        })
        .collect();
    Ok(Json(summaries))
}

/// Point a live session at a chosen agent conversation. The session drops
/// its driver so the next run opens the target conversation.
pub async fn switch_sdk_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SwitchRequest>,
) -> Result<Json<Value>, AppError> {
    if request.target_agent_conversation_id.trim().is_empty() {
        return Err(AppError::BadRequest(
            "target_agent_conversation_id must not be empty".to_string(),
        ));
    }
    let handle = state
        .sessions
        .session(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("no live session {id}")))?;

    let (reply_tx, reply_rx) = oneshot::channel();
    let sent = handle
        .send(SessionCommand::SwitchConversation {
            agent_conversation_id: request.target_agent_conversation_id.clone(),
            reply: reply_tx,
        })
        .await;
    if !sent || reply_rx.await.is_err() {
        return Err(AppError::Internal("session did not acknowledge".to_string()));
    }
    Ok(Json(serde_json::json!({
        "ok": true,
        "session_id": id,
        "agent_conversation_id": request.target_agent_conversation_id,
    })))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.sessions.active_count().await,
        active_connections: state.connections.active_count().await,
    })
}

// ============================================================
// Error mapping
// ============================================================

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            AppError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_truncate_on_char_boundaries() {
        assert_eq!(truncate_title("short"), "short");
        assert_eq!(truncate_title("  padded  "), "padded");
        let long = "x".repeat(100);
        let title = truncate_title(&long);
        assert!(title.chars().count() <= TITLE_LIMIT + 1);
        assert!(title.ends_with('…'));
        // Multibyte input must not split a char
        let emoji = "🦀".repeat(40);
        let _ = truncate_title(&emoji);
    }

    #[test]
    fn title_uses_first_line_only() {
        assert_eq!(truncate_title("first line\nsecond line"), "first line");
    }
}
