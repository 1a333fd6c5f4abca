//! Lifecycle registry for in-flight agent runs.
//!
//! Each run gets a fresh stream id and a one-shot cancel signal. The
//! controller tracks per-stream counters and owns the state transitions;
//! frame emission stays with the session that owns the run.

use crate::driver::AgentEvent;
use crate::protocol::StreamMetadata;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Running,
    Cancelling,
}

/// Terminal disposition of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    Failed,
}

/// Handle returned to the owning session at registration.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub stream_id: String,
    pub cancel: CancellationToken,
}

struct StreamEntry {
    #[allow(dead_code)] // Diagnostic field, read when dumping the registry
    session_id: String,
    state: StreamState,
    cancel: CancellationToken,
    started_at: Instant,
    tool_count: u64,
    bytes: u64,
}

/// Registry of running streams. Terminal streams are removed, which is what
/// makes late cancels and double terminations no-ops.
#[derive(Default)]
pub struct StreamController {
    streams: Mutex<HashMap<String, StreamEntry>>,
}

impl StreamController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run and hand back its id + cancel signal.
    pub fn begin(&self, session_id: &str) -> StreamHandle {
        let stream_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        self.streams.lock().unwrap().insert(
            stream_id.clone(),
            StreamEntry {
                session_id: session_id.to_string(),
                state: StreamState::Running,
                cancel: cancel.clone(),
                started_at: Instant::now(),
                tool_count: 0,
                bytes: 0,
            },
        );
        tracing::debug!(stream_id = %stream_id, session_id = %session_id, "Stream registered");
        StreamHandle { stream_id, cancel }
    }

    /// Update counters for one relayed event.
    pub fn record_event(&self, stream_id: &str, event: &AgentEvent) {
        let mut streams = self.streams.lock().unwrap();
        let Some(entry) = streams.get_mut(stream_id) else {
            return;
        };
        match event {
            AgentEvent::Text { delta } | AgentEvent::Thinking { delta, .. } => {
                entry.bytes += delta.len() as u64;
            }
            AgentEvent::ToolStart { .. } => entry.tool_count += 1,
            _ => {}
        }
    }

    /// Raise the cancel signal. Returns false when the stream is unknown or
    /// already cancelling, making repeated cancels no-ops.
    pub fn request_cancel(&self, stream_id: &str) -> bool {
        let mut streams = self.streams.lock().unwrap();
        let Some(entry) = streams.get_mut(stream_id) else {
            return false; // already terminal (or never existed): ignore
        };
        if entry.state == StreamState::Cancelling {
            return false;
        }
        entry.state = StreamState::Cancelling;
        entry.cancel.cancel();
        tracing::info!(stream_id = %stream_id, "Stream cancelling");
        true
    }

    pub fn is_cancelling(&self, stream_id: &str) -> bool {
        self.streams
            .lock()
            .unwrap()
            .get(stream_id)
            .is_some_and(|e| e.state == StreamState::Cancelling)
    }

    /// Terminate the stream and produce its metadata. Returns `None` if the
    /// stream already terminated (the first terminator wins).
    pub fn finish(
        &self,
        stream_id: &str,
        outcome: StreamOutcome,
        agent_conversation_id: Option<String>,
    ) -> Option<StreamMetadata> {
        let entry = self.streams.lock().unwrap().remove(stream_id)?;
        let duration_ms = entry.started_at.elapsed().as_millis() as u64;
        tracing::info!(
            stream_id = %stream_id,
            ?outcome,
            duration_ms,
            tool_count = entry.tool_count,
            "Stream finished"
        );
        Some(StreamMetadata {
            duration_ms,
            tool_count: entry.tool_count,
            bytes: entry.bytes,
            agent_conversation_id,
        })
    }
}
