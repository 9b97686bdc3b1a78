//! Application state and HTTP router construction.
//!
//! Used by [`main`](crate) and by
//! [`HttpServerService`](crate::services::http_server::HttpServerService) to
//! build the Axum app. Grounded in the teacher's `app.rs`, trimmed of the
//! GraphQL schema and database handle this design has no use for, and with
//! the static-frontend fallback dropped — this is a pure API service with no
//! bundled UI, so an unmatched route falling through to axum's default `404`
//! is correct per §6 ("unknown routes return 404").

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::backend::registry::BackendRegistry;
use crate::config::Config;
use crate::reaper::CleanupReaper;
use crate::segment::SegmentDirectoryService;
use crate::services::ServicesManager;
use crate::session::SessionManager;

/// Shared state for every HTTP handler on the playback surface.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backends: Arc<BackendRegistry>,
    pub sessions: Arc<SessionManager>,
    pub segments: Arc<SegmentDirectoryService>,
    pub reaper: Arc<CleanupReaper>,
    pub services: Arc<ServicesManager>,
}

/// Build the `/api` router by merging all route builders registered with
/// [`ServicesManagerBuilder::add_api_routes`](crate::services::manager::ServicesManagerBuilder::add_api_routes).
pub fn api_router(state: AppState) -> Router<AppState> {
    state.services.build_api_router(state.clone())
}

/// Build the full Axum router: `/api` plus CORS, trace, and body-size-limit
/// layers. Returns `Router<()>` (state fully applied) for use with
/// `axum::serve`.
pub fn build_app(state: AppState) -> Router<()> {
    let max_body_bytes = state.config.max_body_bytes;
    let api = api_router(state.clone());

    Router::new()
        .merge(crate::api::health::router())
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
