//! The HTTP Surface (§4.7, C7): every route in spec.md §6, all nested under
//! `/api/playback`. Handlers are thin — validation and orchestration live on
//! the domain types and the components in [`crate::session`],
//! [`crate::decision`], and [`crate::segment`]; this module's job is request
//! parsing, response shaping, and mapping component errors onto [`ApiError`].
//!
//! Grounded in the teacher's `api::media` streaming handlers (range requests,
//! content-type headers) and `api::health` (liveness shape), generalized from
//! a media-library surface to this design's session-lifecycle surface.

use std::collections::HashMap;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum_extra::TypedHeader;
use axum_extra::headers::Range;
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::domain::device::DeviceProfile;
use crate::domain::request::{Container, TranscodeRequest};
use crate::domain::session::Session;
use crate::error::ApiError;
use crate::reaper::ReaperStats;
use crate::services::manager::ServiceHealth;

use super::extract::ValidatedJson;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/playback/decide", post(decide))
        .route("/playback/start", post(start))
        .route("/playback/session/{id}", get(get_session).delete(stop_session))
        .route("/playback/sessions", get(list_sessions))
        .route("/playback/stats", get(stats))
        .route("/playback/health", get(health))
        .route("/playback/plugins/refresh", post(refresh_plugins))
        .route("/playback/cleanup/run", post(cleanup_run))
        .route("/playback/backends", get(backends))
        .route("/playback/health/services", get(health_services))
        .route("/playback/stream/{id}/manifest.mpd", get(stream_manifest))
        .route("/playback/stream/{id}/playlist.m3u8", get(stream_playlist))
        .route("/playback/stream/{id}/{name}", get(stream_named))
        .route("/playback/stream/{id}", get(stream_progressive))
}

#[derive(Debug, Deserialize)]
struct DecideRequest {
    media_path: String,
    #[serde(default)]
    device_profile: DeviceProfile,
}

async fn decide(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<DecideRequest>,
) -> Result<Response, ApiError> {
    if req.media_path.trim().is_empty() {
        return Err(ApiError::bad_request("media_path must not be empty"));
    }

    let ffprobe_path =
        std::env::var("VIEWRA_FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string());
    let media = crate::decision::probe::probe_source(&ffprobe_path, &req.media_path)
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to probe '{}': {e}", req.media_path)))?;

    let backend_caps = state.backends.list();
    let decision = crate::decision::decide(&media, &req.device_profile, &backend_caps);
    Ok((StatusCode::OK, Json(decision)).into_response())
}

async fn start(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<TranscodeRequest>,
) -> Result<Response, ApiError> {
    let session = state.sessions.start(req, None).await?;
    Ok((StatusCode::CREATED, Json(session)).into_response())
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .sessions
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("unknown session '{id}'")))
}

async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let session = state.sessions.stop(&id).await?;
    Ok(Json(session))
}

#[derive(Serialize)]
struct SessionsResponse {
    sessions: Vec<Session>,
}

async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.sessions.list(),
    })
}

#[derive(Serialize)]
struct StatsResponse {
    active_sessions: usize,
    total_sessions: usize,
    pending_or_starting: usize,
    completed: usize,
    failed: usize,
    cancelled: usize,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let s = state.sessions.stats();
    Json(StatsResponse {
        active_sessions: s.running,
        total_sessions: s.total,
        pending_or_starting: s.pending_or_starting,
        completed: s.completed,
        failed: s.failed,
        cancelled: s.cancelled,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

async fn refresh_plugins(State(state): State<AppState>) -> impl IntoResponse {
    let count = state.backends.refresh();
    tracing::info!(
        plugin_dir = %state.config.plugin_dir,
        registered_backends = count,
        "plugin refresh requested"
    );
    StatusCode::ACCEPTED
}

async fn cleanup_run(State(state): State<AppState>) -> Json<ReaperStats> {
    Json(state.reaper.run_cycle().await)
}

#[derive(Serialize)]
struct BackendInfo {
    #[serde(flatten)]
    descriptor: crate::domain::backend::BackendDescriptor,
    current_load: usize,
}

async fn backends(State(state): State<AppState>) -> Json<Vec<BackendInfo>> {
    Json(
        state
            .backends
            .list_with_load()
            .into_iter()
            .map(|(descriptor, current_load)| BackendInfo {
                descriptor,
                current_load,
            })
            .collect(),
    )
}

async fn health_services(State(state): State<AppState>) -> Json<HashMap<String, ServiceHealth>> {
    Json(state.services.health_all().await)
}

async fn stream_manifest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.segments.serve_manifest(&id, "manifest.mpd").await
}

async fn stream_playlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.segments.serve_manifest(&id, "playlist.m3u8").await
}

async fn stream_named(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    range: Option<TypedHeader<Range>>,
) -> Result<Response, ApiError> {
    state
        .segments
        .serve_file(&id, &name, range.map(|TypedHeader(r)| r))
        .await
}

/// The single progressive output file for a session whose target container
/// is `mp4`/`webm`/`mkv`. Adaptive sessions (`dash`/`hls`) have no single
/// "the stream" file — §7 names this a `Conflict`.
async fn stream_progressive(
    State(state): State<AppState>,
    Path(id): Path<String>,
    range: Option<TypedHeader<Range>>,
) -> Result<Response, ApiError> {
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("unknown session '{id}'")))?;

    if !matches!(
        session.status,
        crate::domain::session::SessionStatus::Running | crate::domain::session::SessionStatus::Completed
    ) {
        return Err(ApiError::conflict(format!(
            "session '{id}' is not yet streamable (status={:?})",
            session.status
        )));
    }

    let filename = match session.request.target_container {
        Container::Mp4 => "output.mp4",
        Container::Webm => "output.webm",
        Container::Mkv => "output.mkv",
        Container::Dash | Container::Hls => {
            return Err(ApiError::conflict(
                "session produces adaptive output; use manifest.mpd, playlist.m3u8, or a named segment",
            ));
        }
    };

    state
        .segments
        .serve_file(&id, filename, range.map(|TypedHeader(r)| r))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decide_request_defaults_device_profile_when_absent() {
        let parsed: DecideRequest =
            serde_json::from_str(r#"{"media_path":"/m/a.mkv"}"#).unwrap();
        assert_eq!(parsed.media_path, "/m/a.mkv");
        assert!(parsed.device_profile.supported_codecs.is_empty());
    }
}
