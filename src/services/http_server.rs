//! HTTP server service: binds the Axum app and runs it in a background task.
//!
//! Grounded on the teacher's `services::http_server::HttpServerService`,
//! trimmed of its GraphQL/database service dependency — this design builds
//! `AppState` once in `main` and hands it straight to [`build_app`].

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;

use crate::app::{AppState, build_app};
use crate::config::Config;
use crate::services::manager::{Service, ServiceHealth};

/// HTTP server service: binds and serves the Axum app in a background task.
pub struct HttpServerService {
    config: Arc<Config>,
    state: AppState,
    join_handle: RwLock<Option<tokio::task::JoinHandle<Result<()>>>>,
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
}

impl HttpServerService {
    pub fn new(config: Arc<Config>, state: AppState) -> Self {
        Self {
            config,
            state,
            join_handle: RwLock::new(None),
            shutdown_tx: RwLock::new(None),
        }
    }
}

#[async_trait]
impl Service for HttpServerService {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(&self) -> Result<()> {
        let app = build_app(self.state.clone());
        let host = self.config.host.as_deref().unwrap_or("0.0.0.0");
        let addr: SocketAddr = format!("{host}:{}", self.config.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], self.config.port)));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("HTTP server: bind failed")?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let serve_fut = axum::serve(listener, app);
        let join = tokio::spawn(async move {
            tokio::select! {
                result = serve_fut => result.context("axum::serve"),
                _ = shutdown_rx.recv() => Ok(()),
            }
        });

        *self.join_handle.write() = Some(join);
        *self.shutdown_tx.write() = Some(shutdown_tx);

        info!(addr = %addr, "HTTP server listening");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let tx = self.shutdown_tx.write().take();
        let handle = self.join_handle.write().take();
        drop(tx);
        if let Some(h) = handle {
            let _ = h.await;
        }
        info!("HTTP server stopped");
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        if self.join_handle.read().is_some() {
            Ok(ServiceHealth::healthy())
        } else {
            Ok(ServiceHealth::unhealthy("server task not running"))
        }
    }

    fn provides_routes(&self) -> bool {
        false
    }
}
