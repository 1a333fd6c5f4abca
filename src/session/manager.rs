//! Session factory and registry: resume decisions, the idle reaper, and
//! graceful shutdown.

use super::{Session, SessionCommand, SessionHandle, SessionSeed, SessionShared};
use crate::config::Config;
use crate::connection::ConnId;
use crate::protocol::PermissionMode;
use crate::store::{SessionRecord, SessionStatus, StoreError};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};

const REAPER_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("server is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of the handshake resume decision.
pub struct HandshakeResult {
    pub session_id: String,
    pub agent_conversation_id: Option<String>,
    pub resumed: bool,
    pub handle: SessionHandle,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    shared: Arc<SessionShared>,
    project_root: PathBuf,
    resume_window: Duration,
    idle_limit: Duration,
    idle_grace: Duration,
    shutting_down: AtomicBool,
}

impl SessionManager {
    pub fn new(shared: Arc<SessionShared>, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            shared,
            project_root: config.project_path.clone(),
            resume_window: config.resume_window,
            idle_limit: config.idle_limit,
            idle_grace: config.idle_grace,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Handshake entry point: rebind a live session for the tab, resume a
    /// stored conversation for the same `(project_root, page_url)`, or start
    /// fresh - in that order.
    pub async fn handshake(
        &self,
        conn_id: &ConnId,
        permission_mode: PermissionMode,
        page_url: &str,
        tab_id: &str,
    ) -> Result<HandshakeResult, ManagerError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(ManagerError::ShuttingDown);
        }
        let project_root = self.project_root.to_string_lossy().into_owned();

        // 1. A live session for this tab picks up the new transport.
        let live = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .find(|handle| handle.tab_id == tab_id)
                .cloned()
        };
        if let Some(handle) = live {
            tracing::info!(
                session_id = %handle.session_id,
                tab_id = %tab_id,
                "Rebinding live session to new connection"
            );
            handle
                .send(SessionCommand::Rebind {
                    conn_id: conn_id.clone(),
                })
                .await;
            let agent_conversation_id = self
                .shared
                .store
                .get_session(&handle.session_id)
                .ok()
                .and_then(|record| record.agent_conversation_id);
            return Ok(HandshakeResult {
                session_id: handle.session_id.clone(),
                agent_conversation_id,
                resumed: true,
                handle,
            });
        }

        // 2. A recent conversation for the same project + page resumes.
        let resumable = self.shared.store.find_resumable(
            &project_root,
            page_url,
            Utc::now(),
            self.resume_window,
        )?;
        if let Some(prior) = resumable {
            let conversation_id = prior.agent_conversation_id.clone();
            tracing::info!(
                prior_session = %prior.session_id,
                conversation_id = ?conversation_id,
                "Resuming stored conversation"
            );
            return self
                .start_session(conn_id, permission_mode, page_url, tab_id, conversation_id, true)
                .await;
        }

        // 3. Fresh session with a freshly minted conversation id.
        let conversation_id = Some(uuid::Uuid::new_v4().to_string());
        self.start_session(conn_id, permission_mode, page_url, tab_id, conversation_id, false)
            .await
    }

    async fn start_session(
        &self,
        conn_id: &ConnId,
        permission_mode: PermissionMode,
        page_url: &str,
        tab_id: &str,
        agent_conversation_id: Option<String>,
        resumed: bool,
    ) -> Result<HandshakeResult, ManagerError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        self.shared.store.create_session(&SessionRecord {
            session_id: session_id.clone(),
            agent_conversation_id: agent_conversation_id.clone(),
            project_root: self.project_root.to_string_lossy().into_owned(),
            tab_id: tab_id.to_string(),
            page_url: page_url.to_string(),
            permission_mode,
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
        })?;

        let handle = Session::spawn(
            SessionSeed {
                session_id: session_id.clone(),
                tab_id: tab_id.to_string(),
                page_url: page_url.to_string(),
                project_root: self.project_root.clone(),
                permission_mode,
                agent_conversation_id: agent_conversation_id.clone(),
            },
            Arc::clone(&self.shared),
            Some(conn_id.clone()),
        );
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), handle.clone());

        Ok(HandshakeResult {
            session_id,
            agent_conversation_id,
            resumed,
            handle,
        })
    }

    pub async fn session(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Periodic idle sweep for the lifetime of the process.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                manager.reap_idle().await;
            }
        });
    }

    /// One reaper pass: sessions idle past the limit are marked `idle`;
    /// past limit + grace they are closed and their memory released. Store
    /// rows are retained for later resume until the window expires.
    pub async fn reap_idle(&self) {
        let now = Utc::now().timestamp();
        let idle_after = self.idle_limit.as_secs() as i64;
        let close_after = idle_after + self.idle_grace.as_secs() as i64;

        let candidates: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };

        for handle in candidates {
            let idle_for = now - handle.last_activity_epoch();
            if idle_for >= close_after {
                tracing::info!(
                    session_id = %handle.session_id,
                    idle_secs = idle_for,
                    "Closing idle session"
                );
                self.close_session(&handle).await;
            } else if idle_for >= idle_after {
                if let Err(e) = self
                    .shared
                    .store
                    .update_status(&handle.session_id, SessionStatus::Idle)
                {
                    tracing::warn!(error = %e, "Failed to mark session idle");
                }
            }
        }
    }

    async fn close_session(&self, handle: &SessionHandle) {
        let (done_tx, done_rx) = oneshot::channel();
        if handle.send(SessionCommand::Shutdown { done: done_tx }).await {
            let _ = tokio::time::timeout(SHUTDOWN_DEADLINE, done_rx).await;
        }
        self.sessions.write().await.remove(&handle.session_id);
    }

    /// Graceful shutdown: refuse new handshakes, then drain every live
    /// session (each cancels its stream and flushes pending messages).
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let handles: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };
        tracing::info!(count = handles.len(), "Draining sessions for shutdown");
        for handle in handles {
            self.close_session(&handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PermissionTimeouts;
    use crate::connection::ConnectionManager;
    use crate::driver::testing::ScriptedDriver;
    use crate::driver::AgentDriver;
    use crate::store::{screenshots::ScreenshotStore, Store};
    use crate::stream::StreamController;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        manager: Arc<SessionManager>,
        store: Store,
        conn_id: ConnId,
        _shots: tempfile::TempDir,
    }

    async fn fixture(idle_limit: Duration, idle_grace: Duration) -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let connections = Arc::new(ConnectionManager::new(16));
        let (frame_tx, _frames) = tokio::sync::mpsc::channel(64);
        let conn_id = connections.try_register(frame_tx).await.unwrap();

        let shots = tempfile::tempdir().unwrap();
        let shared = Arc::new(SessionShared {
            store: store.clone(),
            screenshots: ScreenshotStore::new(shots.path().to_path_buf()),
            streams: Arc::new(StreamController::new()),
            connections,
            timeouts: PermissionTimeouts::default(),
            clear_purges_messages: false,
            driver_factory: Arc::new(|| {
                Arc::new(ScriptedDriver::new()) as Arc<dyn AgentDriver>
            }),
        });

        let mut config = Config::from_env();
        config.project_path = PathBuf::from("/proj");
        config.idle_limit = idle_limit;
        config.idle_grace = idle_grace;

        Fixture {
            manager: SessionManager::new(shared, &config),
            store,
            conn_id,
            _shots: shots,
        }
    }

    #[tokio::test]
    async fn fresh_handshake_mints_conversation() {
        let f = fixture(Duration::from_secs(1800), Duration::from_secs(1800)).await;
        let result = f
            .manager
            .handshake(&f.conn_id, PermissionMode::Plan, "https://x/", "t1")
            .await
            .unwrap();

        assert!(!result.resumed);
        assert!(result.agent_conversation_id.is_some());
        assert_eq!(f.manager.active_count().await, 1);

        let record = f.store.get_session(&result.session_id).unwrap();
        assert_eq!(record.tab_id, "t1");
        assert_eq!(record.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn same_tab_rebinds_live_session() {
        let f = fixture(Duration::from_secs(1800), Duration::from_secs(1800)).await;
        let first = f
            .manager
            .handshake(&f.conn_id, PermissionMode::Plan, "https://x/", "t1")
            .await
            .unwrap();
        let second = f
            .manager
            .handshake(&f.conn_id, PermissionMode::Plan, "https://x/", "t1")
            .await
            .unwrap();

        assert!(second.resumed);
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(f.manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn stored_conversation_resumes_within_window() {
        let f = fixture(Duration::from_secs(1800), Duration::from_secs(1800)).await;
        let now = Utc::now();
        f.store
            .create_session(&SessionRecord {
                session_id: "s_old".to_string(),
                agent_conversation_id: Some("c9".to_string()),
                project_root: "/proj".to_string(),
                tab_id: "t_old".to_string(),
                page_url: "https://x/".to_string(),
                permission_mode: PermissionMode::Plan,
                status: SessionStatus::Closed,
                created_at: now,
                last_activity: now,
            })
            .unwrap();
        f.store
            .touch_activity("s_old", now - ChronoDuration::minutes(10))
            .unwrap();

        let result = f
            .manager
            .handshake(&f.conn_id, PermissionMode::Plan, "https://x/", "t_new")
            .await
            .unwrap();

        assert!(result.resumed);
        assert_eq!(result.agent_conversation_id.as_deref(), Some("c9"));
        assert_ne!(result.session_id, "s_old");
    }

    #[tokio::test]
    async fn expired_conversation_starts_fresh() {
        let f = fixture(Duration::from_secs(1800), Duration::from_secs(1800)).await;
        let now = Utc::now();
        f.store
            .create_session(&SessionRecord {
                session_id: "s_old".to_string(),
                agent_conversation_id: Some("c9".to_string()),
                project_root: "/proj".to_string(),
                tab_id: "t_old".to_string(),
                page_url: "https://x/".to_string(),
                permission_mode: PermissionMode::Plan,
                status: SessionStatus::Closed,
                created_at: now,
                last_activity: now,
            })
            .unwrap();
        f.store
            .touch_activity("s_old", now - ChronoDuration::hours(25))
            .unwrap();

        let result = f
            .manager
            .handshake(&f.conn_id, PermissionMode::Plan, "https://x/", "t_new")
            .await
            .unwrap();

        assert!(!result.resumed);
        assert_ne!(result.agent_conversation_id.as_deref(), Some("c9"));
    }

    #[tokio::test]
    async fn reaper_marks_idle_then_closes() {
        let f = fixture(Duration::from_secs(0), Duration::from_secs(3600)).await;
        let result = f
            .manager
            .handshake(&f.conn_id, PermissionMode::Plan, "https://x/", "t1")
            .await
            .unwrap();

        // idle_limit is zero, so any session is instantly idle - but the
        // grace hasn't passed, so it is not closed.
        f.manager.reap_idle().await;
        assert_eq!(
            f.store.get_session(&result.session_id).unwrap().status,
            SessionStatus::Idle
        );
        assert_eq!(f.manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn reaper_closes_after_grace() {
        let f = fixture(Duration::from_secs(0), Duration::from_secs(0)).await;
        let result = f
            .manager
            .handshake(&f.conn_id, PermissionMode::Plan, "https://x/", "t1")
            .await
            .unwrap();

        // Zero limit + zero grace: closed on the next pass.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        f.manager.reap_idle().await;
        assert_eq!(f.manager.active_count().await, 0);
        assert_eq!(
            f.store.get_session(&result.session_id).unwrap().status,
            SessionStatus::Closed
        );
    }

    #[tokio::test]
    async fn shutdown_drains_and_refuses_new_handshakes() {
        let f = fixture(Duration::from_secs(1800), Duration::from_secs(1800)).await;
        let result = f
            .manager
            .handshake(&f.conn_id, PermissionMode::Plan, "https://x/", "t1")
            .await
            .unwrap();

        f.manager.shutdown().await;
        assert_eq!(f.manager.active_count().await, 0);
        assert_eq!(
            f.store.get_session(&result.session_id).unwrap().status,
            SessionStatus::Closed
        );
        assert!(matches!(
            f.manager
                .handshake(&f.conn_id, PermissionMode::Plan, "https://x/", "t2")
                .await,
            Err(ManagerError::ShuttingDown)
        ));
    }
}
