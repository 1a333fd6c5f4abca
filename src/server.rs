//! HTTP/WebSocket endpoint assembly.

mod rest;
mod ws;

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::session::manager::SessionManager;
use crate::store::Store;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub sessions: Arc<SessionManager>,
    pub connections: Arc<ConnectionManager>,
}

/// Build the router: the WebSocket endpoint plus the read-only REST surface
/// on the same port.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(rest::health))
        .route("/sessions", get(rest::list_sessions))
        .route("/sessions/:id/messages", get(rest::session_messages))
        .route("/api/v1/agent-sessions", get(rest::list_agent_sessions))
        .route(
            "/api/v1/sessions/:id/switch-sdk-session",
            post(rest::switch_sdk_session),
        )
        .with_state(state)
}
