//! Screenshot blob storage with TTL cleanup.
//!
//! Blobs are plain files under `<data_dir>/screenshots/<session_id>/`,
//! keyed by capture id. The reaper sweeps at startup and hourly.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Filesystem-backed screenshot store.
#[derive(Debug, Clone)]
pub struct ScreenshotStore {
    dir: PathBuf,
}

impl ScreenshotStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Save a capture, returning its path.
    pub fn save(
        &self,
        session_id: &str,
        capture_id: &str,
        bytes: &[u8],
    ) -> std::io::Result<PathBuf> {
        let session_dir = self.dir.join(sanitize(session_id));
        std::fs::create_dir_all(&session_dir)?;
        let path = session_dir.join(format!("{}.png", sanitize(capture_id)));
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Delete captures older than `ttl`. Returns the number removed.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        let Ok(sessions) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        for session in sessions.flatten() {
            removed += sweep_dir(&session.path(), cutoff);
            // Drop now-empty session directories
            let _ = std::fs::remove_dir(session.path());
        }
        if removed > 0 {
            tracing::info!(removed, "Swept expired screenshots");
        }
        removed
    }

    /// Sweep now, then hourly, for the lifetime of the process.
    pub fn spawn_reaper(self, ttl: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                interval.tick().await;
                let store = self.clone();
                // Filesystem walking stays off the scheduler
                let _ = tokio::task::spawn_blocking(move || store.sweep(ttl)).await;
            }
        });
    }
}

fn sweep_dir(dir: &Path, cutoff: SystemTime) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|modified| modified < cutoff)
            .unwrap_or(false);
        if expired && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}

/// Ids come from the wire; keep them path-safe.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_sweep() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ScreenshotStore::new(tmp.path().to_path_buf());

        let path = store.save("s1", "cap1", b"fake-png").unwrap();
        assert!(path.exists());

        // Nothing is old enough yet
        assert_eq!(store.sweep(Duration::from_secs(3600)), 0);
        assert!(path.exists());

        // Zero TTL expires everything written before now
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.sweep(Duration::from_secs(0)), 1);
        assert!(!path.exists());
    }

    #[test]
    fn sweep_of_missing_dir_is_harmless() {
        let store = ScreenshotStore::new(PathBuf::from("/nonexistent/tabbridge-test"));
        assert_eq!(store.sweep(Duration::from_secs(0)), 0);
    }

    #[test]
    fn ids_are_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ScreenshotStore::new(tmp.path().to_path_buf());
        let path = store.save("../evil", "a/b", b"x").unwrap();
        assert!(path.starts_with(tmp.path()));
        assert!(path.to_string_lossy().contains("___evil"));
    }
}
