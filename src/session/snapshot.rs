//! The periodic session-snapshot task (§11): writes the Session Store's
//! crash-recovery index to disk on a fixed interval, in addition to the
//! one-shot write `main` performs at graceful shutdown. Without this, a hard
//! crash between two shutdowns loses every session recorded since the last
//! clean exit. Shaped after the Cleanup Reaper's own `Service` background
//! loop in `reaper::CleanupReaper` — same interval-ticker-plus-shutdown-
//! broadcast structure, just driving `SessionStore::persist_snapshot`
//! instead of a reap cycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::services::manager::{Service, ServiceHealth};
use crate::session::SessionStore;

pub struct SnapshotService {
    store: Arc<SessionStore>,
    interval: Duration,
    task: RwLock<Option<tokio::task::JoinHandle<()>>>,
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
}

impl SnapshotService {
    pub fn new(store: Arc<SessionStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            task: RwLock::new(None),
            shutdown_tx: RwLock::new(None),
        }
    }
}

#[async_trait]
impl Service for SnapshotService {
    fn name(&self) -> &str {
        "session-snapshot"
    }

    async fn start(&self) -> Result<()> {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let interval = self.interval;
        let store = self.store.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it, snapshot on the interval proper
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.persist_snapshot().await {
                            warn!(error = %e, "periodic session snapshot failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("session snapshot task stopping");
                        break;
                    }
                }
            }
        });

        *self.task.write() = Some(handle);
        *self.shutdown_tx.write() = Some(shutdown_tx);
        info!(interval_secs = interval.as_secs(), "session snapshot task started");
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
            Ok(ServiceHealth::unhealthy("snapshot task not running"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn periodic_snapshot_writes_before_shutdown_call() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sessions.json");
        let store = Arc::new(SessionStore::new(Some(path.clone())));
        let service = SnapshotService::new(store, Duration::from_millis(10));

        service.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.stop().await.unwrap();

        assert!(path.exists());
    }
}
