//! Transport handle registry.
//!
//! Owns the outbound side of every live connection. Writes are serialized
//! per handle by a single writer task (spawned by the WebSocket layer) that
//! drains the handle's frame queue; everything else just enqueues.

use crate::protocol::ServerFrame;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

pub type ConnId = String;

/// Outbound queue depth per connection. A peer slow enough to fill this is
/// treated as gone.
pub const OUTBOUND_QUEUE: usize = 256;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SendError {
    #[error("unknown connection")]
    UnknownConnection,
    #[error("peer gone")]
    PeerGone,
}

struct ConnectionEntry {
    frame_tx: mpsc::Sender<ServerFrame>,
    session_id: Option<String>,
}

pub struct ConnectionManager {
    conns: RwLock<HashMap<ConnId, ConnectionEntry>>,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Register a handle, enforcing the concurrency cap at accept time.
    /// Returns `None` when the cap is hit.
    pub async fn try_register(&self, frame_tx: mpsc::Sender<ServerFrame>) -> Option<ConnId> {
        let mut conns = self.conns.write().await;
        if conns.len() >= self.max_connections {
            tracing::warn!(cap = self.max_connections, "Connection cap exceeded");
            return None;
        }
        let conn_id = uuid::Uuid::new_v4().to_string();
        conns.insert(
            conn_id.clone(),
            ConnectionEntry {
                frame_tx,
                session_id: None,
            },
        );
        Some(conn_id)
    }

    /// Attach the owning session after a successful handshake.
    pub async fn bind_session(&self, conn_id: &str, session_id: &str) {
        if let Some(entry) = self.conns.write().await.get_mut(conn_id) {
            entry.session_id = Some(session_id.to_string());
        }
    }

    /// Enqueue a frame on the connection's writer. A closed or full queue
    /// means the peer is effectively gone.
    pub async fn send(&self, conn_id: &str, frame: ServerFrame) -> Result<(), SendError> {
        let tx = {
            let conns = self.conns.read().await;
            conns
                .get(conn_id)
                .map(|entry| entry.frame_tx.clone())
                .ok_or(SendError::UnknownConnection)?
        };
        tx.send(frame).await.map_err(|_| SendError::PeerGone)
    }

    /// Drop a handle, returning the session id it was bound to (if any) so
    /// the caller can notify the session of the loss.
    pub async fn unregister(&self, conn_id: &str) -> Option<String> {
        self.conns
            .write()
            .await
            .remove(conn_id)
            .and_then(|entry| entry.session_id)
    }

    pub async fn active_count(&self) -> usize {
        self.conns.read().await.len()
    }
}
