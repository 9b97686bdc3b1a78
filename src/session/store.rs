//! The Session Store (§4.3): an in-memory map keyed by session id, a
//! secondary fingerprint index covering only non-terminal sessions, and an
//! optional durable projection used for crash recovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::session::{Session, SessionStatus};

/// The durable projection persisted for crash recovery: everything on
/// `Session` except nothing — the runtime-only fields (process handle,
/// cancel token) were never part of `Session` to begin with (see
/// `domain::session`), so the whole struct is safe to serialize as-is.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    sessions: Vec<Session>,
}

pub struct SessionStore {
    by_id: RwLock<HashMap<String, Session>>,
    by_fingerprint: RwLock<HashMap<String, String>>,
    snapshot_path: Option<PathBuf>,
}

impl SessionStore {
    pub fn new(snapshot_path: Option<PathBuf>) -> Self {
        Self {
            by_id: RwLock::new(HashMap::new()),
            by_fingerprint: RwLock::new(HashMap::new()),
            snapshot_path,
        }
    }

    pub fn insert(&self, session: Session) {
        let mut by_id = self.by_id.write();
        if !session.status.is_terminal() {
            self.by_fingerprint
                .write()
                .insert(session.fingerprint.clone(), session.id.clone());
        }
        by_id.insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.by_id.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Session> {
        self.by_id.read().values().cloned().collect()
    }

    /// Find a non-terminal session for `fingerprint`, used by `start` to
    /// implement idempotent join.
    pub fn find_active_by_fingerprint(&self, fingerprint: &str) -> Option<Session> {
        let id = self.by_fingerprint.read().get(fingerprint).cloned()?;
        self.by_id.read().get(&id).cloned()
    }

    /// Mutate a session in place under the store's write lock and return the
    /// updated record. Drops the session from the fingerprint index the
    /// moment it becomes terminal.
    pub fn update<F>(&self, id: &str, f: F) -> Option<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut by_id = self.by_id.write();
        let session = by_id.get_mut(id)?;
        f(session);
        let became_terminal = session.status.is_terminal();
        let fingerprint = session.fingerprint.clone();
        let updated = session.clone();
        drop(by_id);
        if became_terminal {
            let mut by_fp = self.by_fingerprint.write();
            if by_fp.get(&fingerprint).map(|v| v == id).unwrap_or(false) {
                by_fp.remove(&fingerprint);
            }
        }
        Some(updated)
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        let removed = self.by_id.write().remove(id);
        if let Some(ref session) = removed {
            let mut by_fp = self.by_fingerprint.write();
            if by_fp.get(&session.fingerprint).map(|v| v == id).unwrap_or(false) {
                by_fp.remove(&session.fingerprint);
            }
        }
        removed
    }

    /// Write the current full set of sessions as a JSON snapshot, if a
    /// snapshot path was configured.
    pub async fn persist_snapshot(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let sessions = self.list();
        let snapshot = Snapshot { sessions };
        let json = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing session snapshot to {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Load a prior snapshot, if any. Per §4.3, any session whose persisted
    /// status was non-terminal becomes `failed(reason="host restarted")` so
    /// the reaper can reclaim its directory; terminal sessions are restored
    /// as-is.
    pub async fn load_snapshot_and_recover(&self) -> Result<usize> {
        let Some(path) = &self.snapshot_path else {
            return Ok(0);
        };
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(0);
        }
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading session snapshot {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing session snapshot {}", path.display()))?;

        let mut recovered = 0;
        for mut session in snapshot.sessions {
            if !session.status.is_terminal() {
                session.status = SessionStatus::Failed;
                session.error = Some("host restarted".to_string());
                session.ended_at = Some(chrono::Utc::now());
                recovered += 1;
                warn!(session_id = %session.id, "recovered non-terminal session as failed after restart");
            }
            self.insert(session);
        }
        info!(recovered, "loaded session snapshot");
        Ok(recovered)
    }
}

pub fn default_snapshot_path(transcoding_dir: &str) -> PathBuf {
    Path::new(transcoding_dir).join(".index").join("sessions.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::{Container, TranscodeRequest};

    fn sample_session(id: &str, fingerprint: &str) -> Session {
        Session::new(
            id.to_string(),
            fingerprint.to_string(),
            TranscodeRequest {
                input_path: "/a".into(),
                target_codec: "h264".into(),
                target_container: Container::Mp4,
                resolution: "720p".into(),
                bitrate: 1000,
                audio_codec: None,
                audio_bitrate: None,
                quality: None,
                speed_preset: None,
                priority: 0,
            },
            "ffmpeg".into(),
            PathBuf::from("/tmp/session_x"),
        )
    }

    #[test]
    fn fingerprint_index_tracks_only_active_sessions() {
        let store = SessionStore::new(None);
        store.insert(sample_session("a", "fp1"));
        assert!(store.find_active_by_fingerprint("fp1").is_some());

        store.update("a", |s| {
            s.transition(SessionStatus::Starting);
            s.transition(SessionStatus::Running);
            s.transition(SessionStatus::Completed);
        });
        assert!(store.find_active_by_fingerprint("fp1").is_none());
        assert!(store.get("a").is_some());
    }

    #[test]
    fn remove_clears_fingerprint_index() {
        let store = SessionStore::new(None);
        store.insert(sample_session("a", "fp1"));
        store.remove("a");
        assert!(store.get("a").is_none());
        assert!(store.find_active_by_fingerprint("fp1").is_none());
    }
}
