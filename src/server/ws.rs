//! WebSocket endpoint: one bidirectional framed channel per browser tab.
//!
//! Connection lifecycle: origin check, capacity check, handshake-first
//! protocol, keepalive ping loop, frame dispatch to the owning session, and
//! loss notification on teardown.

use super::AppState;
use crate::connection::OUTBOUND_QUEUE;
use crate::protocol::{
    ClientFrame, ServerFrame, CLOSE_CAPACITY_EXCEEDED, CLOSE_ORIGIN_REJECTED, CLOSE_PROTOCOL_ERROR,
};
use crate::session::manager::ManagerError;
use crate::session::{SessionCommand, SessionHandle};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Origin schemes browser extensions connect from. Absent origins are
/// accepted (native tooling and tests don't send one).
const EXTENSION_SCHEMES: &[&str] = &[
    "chrome-extension://",
    "moz-extension://",
    "safari-web-extension://",
];

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin_ok = origin_allowed(&headers);
    ws.on_upgrade(move |socket| async move {
        if !origin_ok {
            close_with(socket, CLOSE_ORIGIN_REJECTED, "origin_rejected").await;
            return;
        }
        handle_socket(socket, state).await;
    })
}

fn origin_allowed(headers: &HeaderMap) -> bool {
    match headers.get(axum::http::header::ORIGIN) {
        None => true,
        Some(value) => match value.to_str() {
            Ok(origin) => EXTENSION_SCHEMES
                .iter()
                .any(|scheme| origin.starts_with(scheme)),
            Err(_) => false,
        },
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    tracing::warn!(code, reason, "Closing connection");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    // Register before splitting so a cap rejection can still close cleanly.
    let (frame_tx, mut frame_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let Some(conn_id) = state.connections.try_register(frame_tx).await else {
        close_with(socket, CLOSE_CAPACITY_EXCEEDED, "capacity_exceeded").await;
        return;
    };
    tracing::info!(conn_id = %conn_id, "Connection accepted");

    let (mut sink, mut stream) = socket.split();
    let (close_tx, mut close_rx) = mpsc::channel::<(u16, String)>(1);

    // Single writer per connection: everything outbound funnels through it.
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = frame_rx.recv() => match frame {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                request = close_rx.recv() => {
                    if let Some((code, reason)) = request {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                    }
                    break;
                }
            }
        }
    });

    // The first frame must be a handshake.
    let session = match read_handshake(&mut stream, &state, &conn_id).await {
        Ok(session) => session,
        Err((code, reason)) => {
            let _ = close_tx.send((code, reason)).await;
            cleanup(&state, &conn_id, None).await;
            let _ = writer.await;
            return;
        }
    };
    state
        .connections
        .bind_session(&conn_id, &session.session_id)
        .await;

    // Keepalive: a protocol-level ping every interval; two unanswered pings
    // drop the connection. The token unblocks the read loop so a silent
    // peer cannot hold the handle open.
    let missed_pings = Arc::new(AtomicU32::new(0));
    let peer_dead = tokio_util::sync::CancellationToken::new();
    let keepalive = {
        let state = state.clone();
        let conn_id = conn_id.clone();
        let missed = Arc::clone(&missed_pings);
        let close_tx = close_tx.clone();
        let peer_dead = peer_dead.clone();
        let interval = state.config.ping_interval;
        let miss_limit = state.config.ping_miss_limit;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick is immediate; skip it
            loop {
                ticker.tick().await;
                if missed.load(Ordering::Relaxed) >= miss_limit {
                    tracing::warn!(conn_id = %conn_id, "Keepalive failed, dropping connection");
                    let _ = close_tx.send((1001u16, "keepalive timeout".to_string())).await;
                    peer_dead.cancel();
                    break;
                }
                missed.fetch_add(1, Ordering::Relaxed);
                if state.connections.send(&conn_id, ServerFrame::Ping).await.is_err() {
                    break;
                }
            }
        })
    };

    // Inbound dispatch until the peer goes away or breaks protocol.
    loop {
        let message = tokio::select! {
            () = peer_dead.cancelled() => break,
            message = stream.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match message {
            Ok(Message::Text(text)) => {
                match dispatch_frame(&text, &session, &missed_pings).await {
                    Dispatch::Continue => {}
                    Dispatch::ProtocolError(reason) => {
                        let _ = close_tx
                            .send((CLOSE_PROTOCOL_ERROR, reason))
                            .await;
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "Connection closed by peer");
                break;
            }
            Ok(_) => {} // binary / transport-level ping frames are ignored
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "Read error");
                break;
            }
        }
    }

    keepalive.abort();
    cleanup(&state, &conn_id, Some(&session)).await;
    drop(close_tx);
    let _ = writer.await;
}

async fn read_handshake(
    stream: &mut futures::stream::SplitStream<WebSocket>,
    state: &AppState,
    conn_id: &str,
) -> Result<SessionHandle, (u16, String)> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next()).await;
    let text = match first {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => return Err((CLOSE_PROTOCOL_ERROR, "expected handshake".to_string())),
        Err(_) => return Err((CLOSE_PROTOCOL_ERROR, "handshake timeout".to_string())),
    };

    let frame: ClientFrame = serde_json::from_str(&text)
        .map_err(|e| (CLOSE_PROTOCOL_ERROR, format!("malformed handshake: {e}")))?;
    let ClientFrame::Handshake {
        permission_mode,
        page_url,
        tab_id,
    } = frame
    else {
        return Err((CLOSE_PROTOCOL_ERROR, "first frame must be handshake".to_string()));
    };

    let permission_mode = permission_mode.unwrap_or(state.config.default_permission_mode);
    let result = state
        .sessions
        .handshake(&conn_id.to_string(), permission_mode, &page_url, &tab_id)
        .await
        .map_err(|e| match e {
            ManagerError::ShuttingDown => (1001u16, "server shutting down".to_string()),
            ManagerError::Store(e) => {
                tracing::error!(error = %e, "Handshake store failure");
                (CLOSE_PROTOCOL_ERROR, "internal error".to_string())
            }
        })?;

    let _ = state
        .connections
        .send(
            conn_id,
            ServerFrame::HandshakeAck {
                session_id: result.session_id.clone(),
                agent_conversation_id: result.agent_conversation_id.clone(),
                resumed: result.resumed,
            },
        )
        .await;
    tracing::info!(
        conn_id = %conn_id,
        session_id = %result.session_id,
        resumed = result.resumed,
        "Handshake complete"
    );
    Ok(result.handle)
}

enum Dispatch {
    Continue,
    ProtocolError(String),
}

async fn dispatch_frame(
    text: &str,
    session: &SessionHandle,
    missed_pings: &AtomicU32,
) -> Dispatch {
    // Unknown frame types are logged and ignored; known-but-malformed
    // frames fail the connection.
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return Dispatch::ProtocolError(format!("malformed frame: {e}")),
    };
    let Some(frame_type) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        return Dispatch::ProtocolError("frame missing type".to_string());
    };
    if !ClientFrame::KNOWN_TYPES.contains(&frame_type.as_str()) {
        tracing::warn!(frame_type = %frame_type, "Ignoring unknown frame type");
        return Dispatch::Continue;
    }
    let frame: ClientFrame = match serde_json::from_value(value) {
        Ok(frame) => frame,
        Err(e) => return Dispatch::ProtocolError(format!("malformed {frame_type} frame: {e}")),
    };

    let command = match frame {
        ClientFrame::Handshake { .. } => {
            return Dispatch::ProtocolError("duplicate handshake".to_string());
        }
        ClientFrame::Pong => {
            missed_pings.store(0, Ordering::Relaxed);
            return Dispatch::Continue;
        }
        ClientFrame::Chat {
            message,
            element_context,
            selected_text,
        } => SessionCommand::Chat {
            message,
            element_context,
            selected_text,
        },
        ClientFrame::CancelRequest => SessionCommand::Cancel,
        ClientFrame::UpdatePermissionMode { mode } => SessionCommand::SetPermissionMode { mode },
        ClientFrame::PermissionResponse {
            request_id,
            approved,
            modified_input,
            answers,
            reason: _,
        } => SessionCommand::PermissionResponse {
            request_id,
            approved,
            modified_input,
            answers,
        },
        ClientFrame::ClearSession => SessionCommand::ClearSession,
    };

    if !session.send(command).await {
        tracing::warn!(session_id = %session.session_id, "Session gone, dropping frame");
    }
    Dispatch::Continue
}

/// Release the handle and tell the owning session its transport is gone.
async fn cleanup(state: &AppState, conn_id: &str, session: Option<&SessionHandle>) {
    let bound = state.connections.unregister(conn_id).await;
    let session_id = bound.or_else(|| session.map(|s| s.session_id.clone()));
    if let (Some(session_id), Some(handle)) = (&session_id, session) {
        if handle.session_id == *session_id {
            handle
                .send(SessionCommand::ConnectionLost {
                    conn_id: conn_id.to_string(),
                })
                .await;
        }
    }
    tracing::info!(conn_id = %conn_id, "Connection released");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_origin(origin: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::ORIGIN,
            HeaderValue::from_str(origin).unwrap(),
        );
        headers
    }

    #[test]
    fn extension_origins_pass() {
        assert!(origin_allowed(&headers_with_origin(
            "chrome-extension://abcdef"
        )));
        assert!(origin_allowed(&headers_with_origin("moz-extension://xyz")));
    }

    #[test]
    fn web_origins_are_rejected() {
        assert!(!origin_allowed(&headers_with_origin("https://evil.example")));
        assert!(!origin_allowed(&headers_with_origin("http://localhost:3456")));
    }

    #[test]
    fn absent_origin_is_allowed() {
        assert!(origin_allowed(&HeaderMap::new()));
    }
}
