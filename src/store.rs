//! Durable store for sessions and their message logs.
//!
//! Append-only semantics over SQLite: session rows are upserted in place,
//! message rows are never mutated. The loaders tolerate individual corrupt
//! rows so a bad record can never block startup.

mod schema;
pub mod screenshots;

pub use schema::*;

use crate::protocol::PermissionMode;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Thread-safe store handle.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        // Additive column migrations - ignore error if the column exists
        let _ = conn.execute(MIGRATION_ADD_MESSAGE_UUID, []);
        Ok(())
    }

    // ==================== Session Operations ====================

    /// Insert a new session row.
    pub fn create_session(&self, record: &SessionRecord) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (session_id, agent_conversation_id, project_root, tab_id,
                                   page_url, permission_mode, status, created_at, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.session_id,
                record.agent_conversation_id,
                record.project_root,
                record.tab_id,
                record.page_url,
                record.permission_mode.to_string(),
                record.status.to_string(),
                record.created_at.to_rfc3339(),
                record.last_activity.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> StoreResult<SessionRecord> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"
        ))?;
        let row = stmt
            .query_row(params![session_id], parse_session_row)
            .optional()?;
        match row {
            Some(Some(record)) => Ok(record),
            // A present-but-unparseable row counts as missing for callers
            _ => Err(StoreError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Record activity, bumping `last_activity` to the given instant.
    pub fn touch_activity(&self, session_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.update_row(
            session_id,
            "UPDATE sessions SET last_activity = ?1 WHERE session_id = ?2",
            &at.to_rfc3339(),
        )
    }

    pub fn update_status(&self, session_id: &str, status: SessionStatus) -> StoreResult<()> {
        self.update_row(
            session_id,
            "UPDATE sessions SET status = ?1 WHERE session_id = ?2",
            &status.to_string(),
        )
    }

    pub fn update_permission_mode(
        &self,
        session_id: &str,
        mode: PermissionMode,
    ) -> StoreResult<()> {
        self.update_row(
            session_id,
            "UPDATE sessions SET permission_mode = ?1 WHERE session_id = ?2",
            &mode.to_string(),
        )
    }

    /// Persist the agent-conversation id announced by the driver. Passing
    /// `None` detaches the session from its conversation.
    pub fn set_agent_conversation_id(
        &self,
        session_id: &str,
        conversation_id: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE sessions SET agent_conversation_id = ?1 WHERE session_id = ?2",
            params![conversation_id, session_id],
        )?;
        if updated == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    fn update_row(&self, session_id: &str, sql: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(sql, params![value, session_id])?;
        if updated == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Most recent resumable session for `(project_root, page_url)`: status
    /// whatever, agent-conversation id non-null, last activity inside the
    /// resume window. Served by the `idx_sessions_resume` index.
    pub fn find_resumable(
        &self,
        project_root: &str,
        page_url: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<Option<SessionRecord>> {
        let cutoff = now
            - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::hours(24));
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{SESSION_COLUMNS} FROM sessions
             WHERE project_root = ?1 AND page_url = ?2
               AND agent_conversation_id IS NOT NULL
               AND last_activity >= ?3
             ORDER BY last_activity DESC
             LIMIT 1"
        ))?;
        let row = stmt
            .query_row(
                params![project_root, page_url, cutoff.to_rfc3339()],
                parse_session_row,
            )
            .optional()?;
        Ok(row.flatten())
    }

    /// All sessions, most recent first. Corrupt rows are logged and skipped.
    pub fn list_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
        self.list_where("1 = 1")
    }

    /// Sessions that have an agent conversation attached (the resumable set).
    pub fn list_agent_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
        self.list_where("agent_conversation_id IS NOT NULL")
    }

    fn list_where(&self, predicate: &str) -> StoreResult<Vec<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{SESSION_COLUMNS} FROM sessions WHERE {predicate} ORDER BY last_activity DESC"
        ))?;
        let rows = stmt.query_map([], parse_session_row)?;
        let mut records = Vec::new();
        for row in rows {
            match row {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {} // already logged by the parser
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable session row"),
            }
        }
        Ok(records)
    }

    /// Fold rows left `active`/`idle` by a previous process to `closed`.
    /// Resume eligibility is unaffected - it keys off `last_activity`.
    pub fn close_stale_sessions(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let folded = conn.execute(
            "UPDATE sessions SET status = 'closed' WHERE status != 'closed'",
            [],
        )?;
        Ok(folded)
    }

    // ==================== Message Operations ====================

    /// Append a message with the next sequence number for the session.
    /// The seq allocation and insert run in one transaction.
    pub fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &serde_json::Value,
    ) -> StoreResult<StoredMessage> {
        let mut conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let uuid = uuid::Uuid::new_v4().to_string();

        let tx = conn.transaction()?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO messages (session_id, seq, uuid, role, content, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                seq,
                uuid,
                role.to_string(),
                content.to_string(),
                now.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET last_activity = ?1 WHERE session_id = ?2",
            params![now.to_rfc3339(), session_id],
        )?;
        tx.commit()?;

        Ok(StoredMessage {
            session_id: session_id.to_string(),
            seq,
            uuid,
            role,
            content: content.clone(),
            ts: now,
        })
    }

    pub fn get_messages(&self, session_id: &str) -> StoreResult<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, seq, uuid, role, content, ts
             FROM messages WHERE session_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![session_id], parse_message_row)?;
        let mut messages = Vec::new();
        for row in rows {
            match row {
                Ok(msg) => messages.push(msg),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable message row"),
            }
        }
        Ok(messages)
    }

    pub fn message_count(&self, session_id: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .map_err(StoreError::from)
    }

    /// Text of the first user message, used as the session title.
    pub fn first_user_message(&self, session_id: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let content: Option<String> = conn
            .query_row(
                "SELECT content FROM messages
                 WHERE session_id = ?1 AND role = 'user' ORDER BY seq ASC LIMIT 1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content.map(|c| {
            serde_json::from_str::<serde_json::Value>(&c)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or(c)
        }))
    }

    /// Drop the message log for a session (opt-in behavior of `clear_session`).
    pub fn clear_messages(&self, session_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }
}

const SESSION_COLUMNS: &str = "SELECT session_id, agent_conversation_id, project_root, tab_id, \
                               page_url, permission_mode, status, created_at, last_activity";

/// Parse one session row. Unknown enum spellings are logged and yield `None`
/// so a corrupt row is skipped instead of aborting the caller.
fn parse_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<SessionRecord>> {
    let session_id: String = row.get(0)?;
    let mode_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;

    let (Some(permission_mode), Some(status)) = (
        PermissionMode::parse(&mode_str),
        SessionStatus::parse(&status_str),
    ) else {
        tracing::warn!(
            session_id = %session_id,
            mode = %mode_str,
            status = %status_str,
            "Skipping corrupt session row"
        );
        return Ok(None);
    };

    Ok(Some(SessionRecord {
        session_id,
        agent_conversation_id: row.get(1)?,
        project_root: row.get(2)?,
        tab_id: row.get(3)?,
        page_url: row.get(4)?,
        permission_mode,
        status,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        last_activity: parse_datetime(&row.get::<_, String>(8)?),
    }))
}

fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let session_id: String = row.get(0)?;
    let seq: i64 = row.get(1)?;
    let role_str: String = row.get(3)?;
    let content_str: String = row.get(4)?;
    Ok(StoredMessage {
        uuid: row
            .get::<_, Option<String>>(2)?
            .unwrap_or_else(|| format!("{session_id}:{seq}")),
        session_id,
        seq,
        role: MessageRole::parse(&role_str).unwrap_or(MessageRole::Status),
        content: serde_json::from_str(&content_str)
            .unwrap_or(serde_json::Value::String(content_str)),
        ts: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
