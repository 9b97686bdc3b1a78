//! Playback & Transcoding Control Plane — entry point.
//!
//! Wires together the plain `Arc`-shared components (Backend Registry,
//! Session Manager, Segment Directory Service) and the two background
//! [`Service`](services::manager::Service)s (the HTTP listener, the Cleanup
//! Reaper) per SPEC_FULL.md §10.5, then runs until a shutdown signal arrives.

mod api;
mod app;
mod backend;
mod config;
mod decision;
mod domain;
mod error;
mod logging;
mod reaper;
mod segment;
mod services;
mod session;
mod util;

use std::sync::Arc;

use app::AppState;
use backend::ffmpeg::FfmpegBackend;
use backend::registry::BackendRegistry;
use config::Config;
use reaper::CleanupReaper;
use segment::SegmentDirectoryService;
use services::ServicesManager;
use services::http_server::HttpServerService;
use session::{SessionManager, SessionStore, SnapshotService, default_snapshot_path};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);
    logging::init();

    tracing::info!("starting viewra-transcoder");

    let segments = Arc::new(SegmentDirectoryService::new(&config.transcoding_dir));

    let backends = Arc::new(BackendRegistry::new());
    backends.register(Arc::new(FfmpegBackend::new(
        config.max_concurrent_sessions_fallback,
        segments.io_locks(),
    )));
    tracing::info!(backends = backends.list().len(), "backend registry populated");

    let snapshot_path = default_snapshot_path(&config.transcoding_dir);
    let store = Arc::new(SessionStore::new(Some(snapshot_path)));
    let recovered = store.load_snapshot_and_recover().await?;
    if recovered > 0 {
        tracing::warn!(recovered, "recovered non-terminal sessions as failed after restart");
    }

    let sessions = Arc::new(SessionManager::new(
        config.clone(),
        backends.clone(),
        segments.clone(),
        store.clone(),
    ));

    let reaper = Arc::new(CleanupReaper::new(config.clone(), sessions.clone(), segments.clone()));
    let snapshotter = Arc::new(SnapshotService::new(store, config.snapshot_interval));

    // Route builder closures ignore the `AppState` argument they're handed
    // (the route tables are static), so the services manager can be built
    // before `AppState` exists. The HTTP listener is registered afterward,
    // once `AppState` can hold a reference to this very manager (§10.5).
    // `health` is merged directly into the root router by `app::build_app`
    // (teacher convention: liveness/readiness stay outside `/api`), so only
    // the playback surface is registered here.
    let services_manager = ServicesManager::builder()
        .add_api_routes("playback", |_state| api::playback::router())
        .add_service(reaper.clone())
        .add_service(snapshotter)
        .build();

    let state = AppState {
        config: config.clone(),
        backends,
        sessions: sessions.clone(),
        segments,
        reaper,
        services: services_manager.clone(),
    };

    let http = Arc::new(HttpServerService::new(config.clone(), state));
    services_manager.register(http).await;

    services_manager.start_all().await?;
    tracing::info!("all services started");

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");

    services_manager.stop_all().await?;
    sessions.persist_snapshot().await?;
    tracing::info!("shutdown complete");

    Ok(())
}
