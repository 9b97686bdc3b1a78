//! The Session Manager (§4.4): the largest single component here. Owns
//! session lifecycle end to end — dedup, backend selection, launch, the
//! Progress Aggregator, and cooperative stop — everything except the actual
//! bytes, which the backend adapter and the Segment Directory Service own.
//!
//! Grounded in the teacher's `media::transcoder::Transcoder` (one task per
//! active job, polling a shared progress struct) and `services::rate_limiter`
//! for the exponential-backoff poll loop this design's Progress Aggregator
//! reuses directly.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::adapter::{AdapterRunState, BackendAdapter, BackendHandle, CancelHandle, CancelToken};
use crate::backend::registry::BackendRegistry;
use crate::config::Config;
use crate::domain::session::{Session, SessionStatus};
use crate::domain::{DeviceProfile, TranscodeRequest};
use crate::error::ApiError;
use crate::segment::SegmentDirectoryService;
use crate::session::locks::StripedLocks;
use crate::session::store::SessionStore;

/// Runtime-only state for one active session: the backend handle, the
/// cancellation switch, and the aggregator task. Never serialized, never
/// handed out — kept behind the manager's `runtime` map and looked up by id.
struct SessionRuntime {
    backend_id: String,
    handle: Arc<BackendHandle>,
    cancel: CancelHandle,
    aggregator: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub running: usize,
    pub pending_or_starting: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Owns session lifecycle: starting new jobs (with dedup), the Progress
/// Aggregator that polls each running job's backend adapter, and stopping
/// jobs either by client request or by the Cleanup Reaper.
pub struct SessionManager {
    config: Arc<Config>,
    backends: Arc<BackendRegistry>,
    segments: Arc<SegmentDirectoryService>,
    store: Arc<SessionStore>,
    /// Serializes concurrent `start()` calls that land on the same
    /// fingerprint, so only one wins the race to launch.
    fingerprint_locks: Arc<StripedLocks>,
    /// Serializes status transitions per session id between the aggregator
    /// task and any `stop()`/`fail_and_stop()` caller.
    transition_locks: Arc<StripedLocks>,
    runtime: Arc<RwLock<HashMap<String, SessionRuntime>>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<Config>,
        backends: Arc<BackendRegistry>,
        segments: Arc<SegmentDirectoryService>,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            config,
            backends,
            segments,
            store,
            fingerprint_locks: Arc::new(StripedLocks::new()),
            transition_locks: Arc::new(StripedLocks::new()),
            runtime: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.store.get(id)
    }

    pub fn list(&self) -> Vec<Session> {
        self.store.list()
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.store.list();
        let mut stats = SessionStats {
            total: sessions.len(),
            running: 0,
            pending_or_starting: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
        };
        for s in sessions {
            match s.status {
                SessionStatus::Pending | SessionStatus::Starting => stats.pending_or_starting += 1,
                SessionStatus::Running => stats.running += 1,
                SessionStatus::Completed => stats.completed += 1,
                SessionStatus::Failed => stats.failed += 1,
                SessionStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Start a new session for `request`, or join an already-active one with
    /// the same fingerprint (§4.4 idempotence rule). Performs the full
    /// 7-step start algorithm: fingerprint, dedup-check under the striped
    /// lock, backend selection, directory reservation, record insertion,
    /// launch, and the initial `pending -> starting` transition.
    pub async fn start(
        &self,
        request: TranscodeRequest,
        profile: Option<&DeviceProfile>,
    ) -> Result<Session, ApiError> {
        request.validate()?;
        let fingerprint = request.fingerprint();

        // The fingerprint shard only needs to cover the dedup check and the
        // pending-record insertion: once inserted, the record itself claims
        // the fingerprint (`SessionStore::insert` populates the index
        // immediately), so the lock is released before the blocking adapter
        // call below. §5 forbids holding a lock across `start_transcode`/
        // `stop_transcode`/stream calls, which may block on an external
        // ffmpeg process for a non-trivial time.
        let (id, directory, backend) = {
            let shard = self.fingerprint_locks.shard_for(&fingerprint);
            let _guard = shard.lock().await;

            if let Some(existing) = self.store.find_active_by_fingerprint(&fingerprint) {
                return Ok(existing);
            }

            let backend_id = self.backends.select(&request, profile)?;
            let backend = self
                .backends
                .get(&backend_id)
                .ok_or_else(|| ApiError::service_unavailable("selected backend vanished"))?;

            let id = Uuid::new_v4().to_string();
            let directory = self
                .segments
                .reserve(&id)
                .await
                .map_err(ApiError::Internal)?;

            let session = Session::new(id.clone(), fingerprint.clone(), request.clone(), backend_id, directory.clone());
            self.store.insert(session);

            (id, directory, backend)
        };

        let (cancel_handle, cancel_token) = CancelHandle::new();
        let backend_handle = match backend.start_transcode(&request, &directory, cancel_token.clone()).await {
            Ok(h) => h,
            Err(e) => {
                let shard = self.fingerprint_locks.shard_for(&fingerprint);
                let _guard = shard.lock().await;
                self.store.update(&id, |s| {
                    s.fail(format!("failed to start backend: {e}"));
                });
                return Err(ApiError::Internal(e.context("starting backend job")));
            }
        };

        let aggregator = self.spawn_aggregator(id.clone(), backend.clone(), cancel_token);
        self.runtime.write().insert(
            id.clone(),
            SessionRuntime {
                backend_id: backend.id().to_string(),
                handle: Arc::new(backend_handle),
                cancel: cancel_handle,
                aggregator,
            },
        );

        let started = self
            .store
            .update(&id, |s| {
                s.transition(SessionStatus::Starting);
            })
            .expect("session was just inserted");

        info!(session_id = %id, backend = %started.backend_id, "session started");
        Ok(started)
    }

    /// Poll `backend`'s progress for `id` on an exponential backoff (1s up to
    /// `poll_backoff_max`, reset whenever progress actually changes), folding
    /// results back into the store until the adapter reports a terminal
    /// state, the session is cancelled, or the poll fails
    /// `poll_failure_threshold` times in a row.
    fn spawn_aggregator(
        &self,
        id: String,
        backend: Arc<dyn BackendAdapter>,
        mut cancel: CancelToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let runtime = self.runtime.clone();
        let transition_locks = self.transition_locks.clone();
        let poll_interval = self.config.poll_interval;
        let poll_backoff_max = self.config.poll_backoff_max;
        let poll_failure_threshold = self.config.poll_failure_threshold;

        tokio::spawn(async move {
            let mut backoff = ExponentialBackoff {
                initial_interval: poll_interval,
                max_interval: poll_backoff_max,
                multiplier: 2.0,
                max_elapsed_time: None,
                ..Default::default()
            };
            let mut last_progress = 0.0f32;
            let mut consecutive_failures = 0u32;

            loop {
                let sleep = tokio::time::sleep(backoff.next_backoff().unwrap_or(poll_backoff_max));
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(session_id = %id, "aggregator observed cancellation, exiting");
                        break;
                    }
                    _ = sleep => {}
                }

                // Clone the Arc'd handle out from under the sync lock, then
                // drop the guard before the adapter call — a `parking_lot`
                // guard must never be held across an await point.
                let handle = {
                    let guard = runtime.read();
                    let Some(entry) = guard.get(&id) else { break };
                    entry.handle.clone()
                };
                let snapshot = backend.get_progress(&handle).await;

                let shard = transition_locks.shard_for(&id);
                let _guard = shard.lock().await;

                match snapshot {
                    Ok(p) => {
                        consecutive_failures = 0;
                        if p.progress > last_progress {
                            last_progress = p.progress;
                            backoff.reset();
                        }
                        store.update(&id, |s| {
                            if s.status == SessionStatus::Starting {
                                s.transition(SessionStatus::Running);
                            }
                            s.record_progress(p.progress, p.bytes_in, p.bytes_out, p.speed);
                        });

                        match p.state {
                            AdapterRunState::Completed => {
                                store.update(&id, |s| {
                                    s.transition(SessionStatus::Completed);
                                });
                                info!(session_id = %id, "session completed");
                                break;
                            }
                            AdapterRunState::Failed => {
                                let reason = p.error.unwrap_or_else(|| "backend reported failure".into());
                                store.update(&id, |s| {
                                    s.fail(reason);
                                });
                                warn!(session_id = %id, "session failed");
                                break;
                            }
                            AdapterRunState::Running => {}
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(session_id = %id, error = %e, consecutive_failures, "progress poll failed");
                        if consecutive_failures >= poll_failure_threshold {
                            store.update(&id, |s| {
                                s.fail(format!("backend unreachable: {e}"));
                            });
                            break;
                        }
                    }
                }
            }

            runtime.write().remove(&id);
        })
    }

    /// Client-initiated stop: cancels the backend job and marks the session
    /// `cancelled`. Idempotent — stopping an already-terminal session is a
    /// no-op that still returns the current record.
    pub async fn stop(&self, id: &str) -> Result<Session, ApiError> {
        self.terminate(id, SessionStatus::Cancelled, "stopped by client").await
    }

    /// Reaper-initiated stop: cancels the backend job and marks the session
    /// `failed` with `reason`. Used for start-timeout and stall-timeout.
    pub async fn fail_and_stop(&self, id: &str, reason: impl Into<String>) -> Result<Session, ApiError> {
        self.terminate(id, SessionStatus::Failed, reason).await
    }

    async fn terminate(
        &self,
        id: &str,
        terminal: SessionStatus,
        reason: impl Into<String>,
    ) -> Result<Session, ApiError> {
        // The transition lock only needs to cover the runtime-entry removal
        // and the terminal-state commit — both synchronous. It is dropped
        // before the blocking `stop_transcode` adapter call below (§5), the
        // same rule `start()` follows for `start_transcode`.
        let entry = {
            let shard = self.transition_locks.shard_for(id);
            let _guard = shard.lock().await;

            let session = self.store.get(id).ok_or_else(|| ApiError::not_found("unknown session"))?;
            if session.status.is_terminal() {
                return Ok(session);
            }

            let entry = self.runtime.write().remove(id);

            let reason = reason.into();
            self.store
                .update(id, |s| {
                    if terminal == SessionStatus::Failed {
                        s.fail(reason.clone());
                    } else {
                        s.transition(terminal);
                    }
                })
                .ok_or_else(|| ApiError::not_found("unknown session"))?;

            entry
        };

        if let Some(entry) = entry {
            entry.cancel.cancel();
            entry.aggregator.abort();
            if let Some(backend) = self.backends.get(&entry.backend_id) {
                if let Err(e) = backend.stop_transcode(&entry.handle).await {
                    warn!(session_id = %id, error = %e, "error stopping backend job");
                }
            }
        }

        self.store.get(id).ok_or_else(|| ApiError::not_found("unknown session"))
    }

    /// Whether `id` currently has a live backend job (used by the reaper to
    /// avoid reaping a directory still in active use).
    pub fn is_active(&self, id: &str) -> bool {
        self.runtime.read().contains_key(id)
    }

    /// The Segment Directory Service backing this manager's sessions, for
    /// callers (the Cleanup Reaper) that need to remove a session's scratch
    /// directory themselves once the record has been reaped.
    pub fn segments(&self) -> &Arc<SegmentDirectoryService> {
        &self.segments
    }

    /// Drop a session's record from the store without touching its
    /// directory or backend job. Callers (the Cleanup Reaper) are expected
    /// to have already confirmed the session is terminal and to handle
    /// directory removal themselves via [`segments`](Self::segments).
    pub fn evict_record(&self, id: &str) -> Option<Session> {
        self.store.remove(id)
    }

    pub async fn persist_snapshot(&self) -> Result<()> {
        self.store.persist_snapshot().await.context("persisting session snapshot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::adapter::{ProgressSnapshot, StreamHandle};
    use crate::domain::{BackendDescriptor, Container};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct InstantBackend {
        load: AtomicUsize,
    }

    #[async_trait]
    impl BackendAdapter for InstantBackend {
        fn id(&self) -> &str {
            "instant"
        }

        fn get_capabilities(&self) -> BackendDescriptor {
            BackendDescriptor {
                id: "instant".into(),
                supported_video_codecs: vec!["h264".into()],
                supported_audio_codecs: vec!["aac".into()],
                supported_containers: vec!["mp4".into()],
                resolution_ladder: vec!["1080p".into()],
                max_concurrent_sessions: 10,
                hardware_accelerated: false,
                features: Default::default(),
                priority: 1,
            }
        }

        fn current_load(&self) -> usize {
            self.load.load(Ordering::SeqCst)
        }

        async fn start_transcode(
            &self,
            _request: &TranscodeRequest,
            _directory: &Path,
            _cancel: CancelToken,
        ) -> anyhow::Result<BackendHandle> {
            self.load.fetch_add(1, Ordering::SeqCst);
            Ok(BackendHandle::new(()))
        }

        async fn get_progress(&self, _handle: &BackendHandle) -> anyhow::Result<ProgressSnapshot> {
            Ok(ProgressSnapshot {
                state: AdapterRunState::Completed,
                progress: 1.0,
                bytes_in: 100,
                bytes_out: 50,
                speed: 1.0,
                error: None,
            })
        }

        async fn stop_transcode(&self, _handle: &BackendHandle) -> anyhow::Result<()> {
            self.load.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn start_stream(
            &self,
            _request: &TranscodeRequest,
            _directory: &Path,
            _cancel: CancelToken,
        ) -> anyhow::Result<StreamHandle> {
            unimplemented!()
        }

        async fn stop_stream(&self, _reader: &StreamHandle) -> anyhow::Result<()> {
            unimplemented!()
        }
    }

    fn sample_request() -> TranscodeRequest {
        TranscodeRequest {
            input_path: "/m/a.mkv".into(),
            target_codec: "h264".into(),
            target_container: Container::Mp4,
            resolution: "1080p".into(),
            bitrate: 2000,
            audio_codec: None,
            audio_bitrate: None,
            quality: None,
            speed_preset: None,
            priority: 0,
        }
    }

    fn test_manager(tmp: &std::path::Path) -> SessionManager {
        let config = test_config();
        let backends = Arc::new(BackendRegistry::new());
        backends.register(Arc::new(InstantBackend {
            load: AtomicUsize::new(0),
        }));
        let segments = Arc::new(SegmentDirectoryService::new(tmp));
        let store = Arc::new(SessionStore::new(None));
        SessionManager::new(Arc::new(config), backends, segments, store)
    }

    fn test_config() -> Config {
        Config {
            host: None,
            port: 0,
            transcoding_dir: "/tmp".into(),
            plugin_dir: "/tmp".into(),
            poll_interval: Duration::from_millis(5),
            poll_backoff_max: Duration::from_millis(20),
            poll_failure_threshold: 3,
            retain_terminal: Duration::from_secs(600),
            start_timeout: Duration::from_secs(300),
            stall_timeout: Duration::from_secs(600),
            reaper_interval: Duration::from_secs(60),
            snapshot_interval: Duration::from_secs(30),
            max_concurrent_sessions_fallback: 4,
            max_body_bytes: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn start_creates_a_pending_then_starting_session() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());
        let session = manager.start(sample_request(), None).await.unwrap();
        assert_eq!(session.status, SessionStatus::Starting);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_join_the_same_session() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());
        let a = manager.start(sample_request(), None).await.unwrap();
        let b = manager.start(sample_request(), None).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn aggregator_drives_session_to_completed() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());
        let session = manager.start(sample_request(), None).await.unwrap();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(s) = manager.get(&session.id) {
                if s.status == SessionStatus::Completed {
                    return;
                }
            }
        }
        panic!("session did not reach Completed in time");
    }

    #[tokio::test]
    async fn stop_marks_session_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());
        // Use a distinct bitrate so this session's fingerprint doesn't clash
        // with ones from other tests running concurrently against the same
        // process-wide temp root assumption.
        let mut request = sample_request();
        request.bitrate = 2001;
        let session = manager.start(request, None).await.unwrap();
        let stopped = manager.stop(&session.id).await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn stop_is_idempotent_on_terminal_session() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());
        let mut request = sample_request();
        request.bitrate = 2002;
        let session = manager.start(request, None).await.unwrap();
        manager.stop(&session.id).await.unwrap();
        let second = manager.stop(&session.id).await.unwrap();
        assert_eq!(second.status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn stop_unknown_session_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());
        let err = manager.stop("does-not-exist").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
