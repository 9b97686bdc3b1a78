//! The Cleanup Reaper (§4.8, C8): periodic eviction of terminal and
//! abandoned sessions, plus a best-effort sweep for orphaned scratch
//! directories left behind by a crash (a session whose record never made it
//! into a snapshot, or whose directory survived a restart). Runs as a
//! [`Service`] background task on `config.reaper_interval`, and is also
//! reachable synchronously through `POST /api/playback/cleanup/run`.
//!
//! Grounded in the teacher's `jobs::transcode_gc::cleanup_cache` — a literal
//! stub for this exact feature ("Transcode cache garbage collection" /
//! "Clean up stale transcode cache files") — generalized from a one-shot
//! daily cron entry into the always-on reaper this design's session
//! lifecycle needs, and the teacher's `jobs::mod::start_scheduler`
//! `tokio-cron-scheduler` wiring, adapted to a plain `tokio::time::interval`
//! loop since this reaper's period is configurable at runtime rather than a
//! fixed cron expression.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::session::{Session, SessionStatus};
use crate::segment::SegmentDirectoryService;
use crate::services::manager::{Service, ServiceHealth};
use crate::session::SessionManager;
use crate::util::concurrency::process_concurrent;

/// How many session checks / directory removals the reaper runs at once.
/// Fixed rather than configurable: this bounds filesystem fan-out, not
/// encoding throughput, and the teacher's own `ConcurrencyLimiter` examples
/// use a similarly small fixed constant for batch I/O.
const REAP_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReaperStats {
    pub checked: usize,
    pub reaped_terminal: usize,
    pub failed_start_timeout: usize,
    pub failed_stalled: usize,
    pub orphaned_directories_removed: usize,
}

impl ReaperStats {
    fn merge(mut self, other: ReaperStats) -> Self {
        self.checked += other.checked;
        self.reaped_terminal += other.reaped_terminal;
        self.failed_start_timeout += other.failed_start_timeout;
        self.failed_stalled += other.failed_stalled;
        self.orphaned_directories_removed += other.orphaned_directories_removed;
        self
    }
}

enum Outcome {
    None,
    ReapedTerminal,
    FailedStartTimeout,
    FailedStalled,
}

pub struct CleanupReaper {
    config: Arc<Config>,
    sessions: Arc<SessionManager>,
    segments: Arc<SegmentDirectoryService>,
    task: RwLock<Option<tokio::task::JoinHandle<()>>>,
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
}

impl CleanupReaper {
    pub fn new(config: Arc<Config>, sessions: Arc<SessionManager>, segments: Arc<SegmentDirectoryService>) -> Self {
        Self {
            config,
            sessions,
            segments,
            task: RwLock::new(None),
            shutdown_tx: RwLock::new(None),
        }
    }

    /// Run one reap cycle synchronously and return its stats. Used both by
    /// the background loop and by the manual `/cleanup/run` admin endpoint.
    pub async fn run_cycle(&self) -> ReaperStats {
        run_cycle_core(&self.config, &self.sessions, &self.segments).await
    }
}

/// The cycle body, free of `&self` so the background loop can drive it from
/// cloned `Arc`s without borrowing the `Service`.
async fn run_cycle_core(config: &Config, sessions: &Arc<SessionManager>, segments: &Arc<SegmentDirectoryService>) -> ReaperStats {
    let now = Utc::now();
    let retain_terminal = chrono::Duration::from_std(config.retain_terminal).unwrap_or(chrono::Duration::zero());
    let start_timeout = chrono::Duration::from_std(config.start_timeout).unwrap_or(chrono::Duration::zero());
    let stall_timeout = chrono::Duration::from_std(config.stall_timeout).unwrap_or(chrono::Duration::zero());

    let sessions_snapshot = sessions.list();
    let checked = sessions_snapshot.len();

    let manager = sessions.clone();
    let segments_for_reap = segments.clone();
    let outcomes = process_concurrent(sessions_snapshot, REAP_CONCURRENCY, move |session| {
        let manager = manager.clone();
        let segments = segments_for_reap.clone();
        async move { reap_one(&manager, &segments, session, now, retain_terminal, start_timeout, stall_timeout).await }
    })
    .await;

    let mut stats = ReaperStats {
        checked,
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome {
            Outcome::None => {}
            Outcome::ReapedTerminal => stats.reaped_terminal += 1,
            Outcome::FailedStartTimeout => stats.failed_start_timeout += 1,
            Outcome::FailedStalled => stats.failed_stalled += 1,
        }
    }

    stats = stats.merge(sweep_orphaned_directories(config, sessions, segments).await);

    info!(
        checked = stats.checked,
        reaped_terminal = stats.reaped_terminal,
        failed_start_timeout = stats.failed_start_timeout,
        failed_stalled = stats.failed_stalled,
        orphaned_directories_removed = stats.orphaned_directories_removed,
        "cleanup reaper cycle complete"
    );
    stats
}

/// Walk the scratch root for `session_*` directories with no matching
/// in-memory record at all — the case a crash-recovery snapshot can't
/// cover because the record was never persisted in the first place.
async fn sweep_orphaned_directories(
    config: &Config,
    sessions: &Arc<SessionManager>,
    segments: &Arc<SegmentDirectoryService>,
) -> ReaperStats {
    let root = std::path::PathBuf::from(&config.transcoding_dir);
    let tracked: std::collections::HashSet<String> = sessions.list().into_iter().map(|s| s.id).collect();

    let mut entries = match tokio::fs::read_dir(&root).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ReaperStats::default(),
        Err(e) => {
            warn!(error = %e, root = %root.display(), "failed to scan scratch root for orphaned directories");
            return ReaperStats::default();
        }
    };

    let mut orphans = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(id) = name.strip_prefix("session_") else { continue };
        if id == ".index" || tracked.contains(id) {
            continue;
        }
        if matches!(entry.file_type().await, Ok(ft) if ft.is_dir()) {
            orphans.push(id.to_string());
        }
    }

    if orphans.is_empty() {
        return ReaperStats::default();
    }

    let segments = segments.clone();
    let removed = process_concurrent(orphans, REAP_CONCURRENCY, move |id| {
        let segments = segments.clone();
        async move {
            match segments.remove_session_dir(&id).await {
                Ok(()) => {
                    debug!(session_id = %id, "removed orphaned scratch directory");
                    true
                }
                Err(e) => {
                    warn!(session_id = %id, error = %e, "failed to remove orphaned scratch directory");
                    false
                }
            }
        }
    })
    .await;

    ReaperStats {
        orphaned_directories_removed: removed.into_iter().filter(|ok| *ok).count(),
        ..Default::default()
    }
}

async fn reap_one(
    manager: &SessionManager,
    segments: &SegmentDirectoryService,
    session: Session,
    now: chrono::DateTime<Utc>,
    retain_terminal: chrono::Duration,
    start_timeout: chrono::Duration,
    stall_timeout: chrono::Duration,
) -> Outcome {
    match session.status {
        status if status.is_terminal() => {
            let Some(ended_at) = session.ended_at else { return Outcome::None };
            if now - ended_at < retain_terminal {
                return Outcome::None;
            }
            if let Err(e) = segments.remove_session_dir(&session.id).await {
                warn!(session_id = %session.id, error = %e, "failed to remove terminal session directory");
                return Outcome::None;
            }
            manager.evict_record(&session.id);
            debug!(session_id = %session.id, "reaped terminal session past retention");
            Outcome::ReapedTerminal
        }
        SessionStatus::Pending | SessionStatus::Starting => {
            if now - session.started_at < start_timeout {
                return Outcome::None;
            }
            match manager.fail_and_stop(&session.id, "start timeout").await {
                Ok(_) => Outcome::FailedStartTimeout,
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "failed to fail stuck-starting session");
                    Outcome::None
                }
            }
        }
        SessionStatus::Running => {
            if now - session.last_update_at < stall_timeout {
                return Outcome::None;
            }
            match manager.fail_and_stop(&session.id, "stalled").await {
                Ok(_) => Outcome::FailedStalled,
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "failed to fail stalled session");
                    Outcome::None
                }
            }
        }
        SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled => Outcome::None,
    }
}

#[async_trait]
impl Service for CleanupReaper {
    fn name(&self) -> &str {
        "reaper"
    }

    async fn start(&self) -> Result<()> {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let interval = self.config.reaper_interval;

        let config = self.config.clone();
        let sessions = self.sessions.clone();
        let segments = self.segments.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it, cycle on the interval proper
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_cycle_core(&config, &sessions, &segments).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("cleanup reaper stopping");
                        break;
                    }
                }
            }
        });

        *self.task.write() = Some(handle);
        *self.shutdown_tx.write() = Some(shutdown_tx);
        info!(interval_secs = interval.as_secs(), "cleanup reaper started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let tx = self.shutdown_tx.write().take();
        let handle = self.task.write().take();
        drop(tx);
        if let Some(h) = handle {
            let _ = h.await;
        }
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        if self.task.read().is_some() {
            Ok(ServiceHealth::healthy())
        } else {
            Ok(ServiceHealth::unhealthy("reaper task not running"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::registry::BackendRegistry;
    use crate::domain::request::{Container, TranscodeRequest};
    use crate::session::store::SessionStore;
    use std::time::Duration;

    fn test_config(tmp: &std::path::Path) -> Config {
        Config {
            host: None,
            port: 0,
            transcoding_dir: tmp.display().to_string(),
            plugin_dir: tmp.display().to_string(),
            poll_interval: Duration::from_millis(5),
            poll_backoff_max: Duration::from_millis(20),
            poll_failure_threshold: 3,
            retain_terminal: Duration::from_millis(50),
            start_timeout: Duration::from_millis(50),
            stall_timeout: Duration::from_millis(50),
            reaper_interval: Duration::from_secs(60),
            snapshot_interval: Duration::from_secs(30),
            max_concurrent_sessions_fallback: 4,
            max_body_bytes: 1024 * 1024,
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

    #[tokio::test]
    async fn reaps_terminal_session_past_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(tmp.path()));
        let backends = Arc::new(BackendRegistry::new());
        let segments = Arc::new(SegmentDirectoryService::new(tmp.path()));
        let store = Arc::new(SessionStore::new(None));
        let directory = segments.reserve("sess-1").await.unwrap();

        let mut session = Session::new(
            "sess-1".into(),
            "fp-1".into(),
            sample_request(),
            "ffmpeg".into(),
            directory,
        );
        session.transition(SessionStatus::Starting);
        session.transition(SessionStatus::Running);
        session.transition(SessionStatus::Completed);
        session.ended_at = Some(Utc::now() - chrono::Duration::seconds(5));
        store.insert(session);

        let manager = Arc::new(SessionManager::new(config.clone(), backends, segments.clone(), store));
        let reaper = CleanupReaper::new(config, manager.clone(), segments.clone());

        let stats = reaper.run_cycle().await;
        assert_eq!(stats.reaped_terminal, 1);
        assert!(manager.get("sess-1").is_none());
        assert!(!segments.session_dir("sess-1").exists());
    }

    #[tokio::test]
    async fn leaves_recent_terminal_session_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.retain_terminal = Duration::from_secs(600);
        let config = Arc::new(config);
        let backends = Arc::new(BackendRegistry::new());
        let segments = Arc::new(SegmentDirectoryService::new(tmp.path()));
        let store = Arc::new(SessionStore::new(None));
        let directory = segments.reserve("sess-2").await.unwrap();

        let mut session = Session::new(
            "sess-2".into(),
            "fp-2".into(),
            sample_request(),
            "ffmpeg".into(),
            directory,
        );
        session.transition(SessionStatus::Starting);
        session.transition(SessionStatus::Running);
        session.transition(SessionStatus::Completed);
        store.insert(session);

        let manager = Arc::new(SessionManager::new(config.clone(), backends, segments.clone(), store));
        let reaper = CleanupReaper::new(config, manager.clone(), segments);

        let stats = reaper.run_cycle().await;
        assert_eq!(stats.reaped_terminal, 0);
        assert!(manager.get("sess-2").is_some());
    }

    #[tokio::test]
    async fn removes_orphaned_directory_with_no_session_record() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(tmp.path()));
        let backends = Arc::new(BackendRegistry::new());
        let segments = Arc::new(SegmentDirectoryService::new(tmp.path()));
        segments.reserve("orphan-1").await.unwrap();
        let store = Arc::new(SessionStore::new(None));

        let manager = Arc::new(SessionManager::new(config.clone(), backends, segments.clone(), store));
        let reaper = CleanupReaper::new(config, manager, segments.clone());

        let stats = reaper.run_cycle().await;
        assert_eq!(stats.orphaned_directories_removed, 1);
        assert!(!segments.session_dir("orphan-1").exists());
    }
}
