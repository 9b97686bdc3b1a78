//! The Segment Directory Service (§4.6): per-session scratch directory
//! allocation, path-traversal-safe name resolution, and race-tolerant
//! manifest/segment/progressive reads with HTTP range support.
//!
//! Grounded in the teacher's `media::transcoder::Transcoder` (per-job scratch
//! directory under a configured root) and `services/ffmpeg.rs`'s streaming
//! file responses; the race-tolerant read contract and the striped
//! directory-removal lock are new, spec-driven plumbing this design needs.

use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::Range;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::ApiError;
use crate::session::StripedLocks;

pub struct SegmentDirectoryService {
    root: PathBuf,
    io_locks: Arc<StripedLocks>,
}

impl SegmentDirectoryService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            io_locks: Arc::new(StripedLocks::new()),
        }
    }

    /// The same striped lock set this service takes around a session's
    /// manifest/segment reads, shared with the backend adapter so a manifest
    /// write can never interleave with a concurrent read of the same path.
    pub fn io_locks(&self) -> Arc<StripedLocks> {
        self.io_locks.clone()
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("session_{session_id}"))
    }

    /// Create a fresh per-session directory, including any missing parents.
    pub async fn reserve(&self, session_id: &str) -> Result<PathBuf> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating session directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Remove a session's directory, if present. Takes the same striped lock
    /// a concurrent read of this session would, so a stream request that
    /// started just before the grace period expires finishes reading before
    /// the directory disappears (§4.8).
    pub async fn remove_session_dir(&self, session_id: &str) -> Result<()> {
        let shard = self.io_locks.shard_for(session_id);
        let _guard = shard.lock().await;
        let dir = self.session_dir(session_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing session directory {}", dir.display())),
        }
    }

    /// Resolve `(session_id, name)` to a path inside the session directory,
    /// rejecting anything that isn't a single path component.
    fn resolve(&self, session_id: &str, name: &str) -> Result<PathBuf, ApiError> {
        if session_id.is_empty() || session_id.contains(['/', '\\']) || session_id.contains("..") {
            return Err(ApiError::not_found("unknown session"));
        }
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(ApiError::not_found("segment not found"));
        }
        Ok(self.session_dir(session_id).join(name))
    }

    /// Serve a manifest/playlist file whole: if present, serve it; if not,
    /// `404` so clients retry. Never serves a partially written document —
    /// the whole file is read into memory before any bytes reach the client.
    pub async fn serve_manifest(&self, session_id: &str, name: &str) -> Result<Response, ApiError> {
        let path = self.resolve(session_id, name)?;
        let shard = self.io_locks.shard_for(session_id);
        let guard = shard.lock().await;
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ApiError::not_found(format!("{name} not yet produced")));
            }
            Err(e) => return Err(ApiError::Internal(e.into())),
        };
        drop(guard);

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type_for(name)),
        );
        Ok((StatusCode::OK, headers, bytes).into_response())
    }

    /// Serve a segment or progressive file with HTTP range support. Never
    /// blocks waiting for bytes that haven't been written yet — serves
    /// whatever the file currently holds, per §4.6's race contract.
    pub async fn serve_file(
        &self,
        session_id: &str,
        name: &str,
        range: Option<Range>,
    ) -> Result<Response, ApiError> {
        let path = self.resolve(session_id, name)?;

        let shard = self.io_locks.shard_for(session_id);
        let guard = shard.lock().await;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ApiError::not_found(format!("{name} not yet produced")));
            }
            Err(e) => return Err(ApiError::Internal(e.into())),
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| ApiError::Internal(e.into()))?
            .len();
        // The lock only needs to cover open()+stat(): once the fd is open,
        // removing the directory underneath it does not invalidate reads.
        drop(guard);

        let content_type = content_type_for(name);

        let Some(range) = range else {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            let stream = ReaderStream::new(file);
            return Ok((StatusCode::OK, headers, Body::from_stream(stream)).into_response());
        };

        let Some((start, end)) = range
            .satisfiable_ranges(len)
            .next()
            .map(|(s, e)| normalize_range(s, e, len))
        else {
            return Err(ApiError::RangeNotSatisfiable);
        };
        if start > end || start >= len {
            return Err(ApiError::RangeNotSatisfiable);
        }

        let chunk_len = end - start + 1;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(chunk_len));
        headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{len}"))
                .expect("range header value is always valid ascii"),
        );
        let stream = ReaderStream::new(file.take(chunk_len));
        Ok((StatusCode::PARTIAL_CONTENT, headers, Body::from_stream(stream)).into_response())
    }
}

fn normalize_range(start: Bound<u64>, end: Bound<u64>, len: u64) -> (u64, u64) {
    let start = match start {
        Bound::Included(s) => s,
        Bound::Excluded(s) => s + 1,
        Bound::Unbounded => 0,
    };
    let end = match end {
        Bound::Included(e) => e.min(len.saturating_sub(1)),
        Bound::Excluded(e) => e.saturating_sub(1).min(len.saturating_sub(1)),
        Bound::Unbounded => len.saturating_sub(1),
    };
    (start, end)
}

/// Content-type mapping from §4.6, falling back to `mime_guess` for anything
/// the spec's table doesn't name (teacher's `services/filesystem.rs` uses the
/// same fallback for its own byte-serving responses).
pub fn content_type_for(name: &str) -> &'static str {
    if name == "manifest.mpd" {
        "application/dash+xml"
    } else if name.ends_with(".m4s") || name.ends_with(".mp4") {
        "video/mp4"
    } else if name == "playlist.m3u8" {
        "application/vnd.apple.mpegurl"
    } else if name.ends_with(".ts") {
        "video/mp2t"
    } else {
        mime_guess::from_path(name)
            .first_raw()
            .unwrap_or("application/octet-stream")
    }
}
