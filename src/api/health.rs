//! Root-level liveness/readiness endpoints, merged directly into the router
//! rather than nested under `/api` — the teacher's convention (see
//! `api::health::router()` in its `main.rs`). Distinct from the
//! `/api/playback/health` liveness check spec.md names, and from
//! `/api/playback/health/services`, the richer per-service breakdown.

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::app::AppState;
use crate::services::manager::HealthStatus;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness check: ready only if every registered service reports healthy.
async fn readyz(State(state): State<AppState>) -> Json<ReadyResponse> {
    let ready = state
        .services
        .health_all()
        .await
        .values()
        .all(|h| h.status == HealthStatus::Healthy);
    Json(ReadyResponse { ready })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
