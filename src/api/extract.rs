//! A `Json`-like extractor that folds content-type and parse failures into
//! [`ApiError::BadRequest`] instead of axum's default rejection types, so
//! every validation failure on the playback surface comes back through the
//! same `{"error": ..., "code": ...}` envelope (§7).

use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use serde::de::DeserializeOwned;

use crate::error::ApiError;

pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("application/json") {
            return Err(ApiError::bad_request(format!(
                "expected Content-Type: application/json, got '{content_type}'"
            )));
        }

        let bytes = Bytes::from_request(req, state).await.map_err(|e| {
            // axum's own body-size-limit rejection (from the `DefaultBodyLimit`
            // layer in `app.rs`) carries `413 Payload Too Large`; everything
            // else here is a malformed/unreadable body (400).
            let message = format!("failed to read request body: {e}");
            if e.into_response().status() == StatusCode::PAYLOAD_TOO_LARGE {
                ApiError::PayloadTooLarge
            } else {
                ApiError::bad_request(message)
            }
        })?;

        let value = serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::bad_request(format!("malformed JSON body: {e}")))?;
        Ok(ValidatedJson(value))
    }
}
