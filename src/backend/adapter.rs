//! The uniform capability/start/progress/stop/stream contract every
//! transcoding backend must satisfy (§4.2). Concrete backend implementations
//! are treated as external collaborators by the source design; this crate
//! ships exactly one, [`FfmpegBackend`](crate::backend::ffmpeg::FfmpegBackend),
//! as a reference so the system is runnable end to end.

use std::any::Any;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::domain::{BackendDescriptor, TranscodeRequest};

/// Cooperative cancellation, handed to a backend when it starts a job.
/// A thin wrapper over `tokio::sync::watch`, in the spirit of the teacher's
/// `broadcast`-channel shutdown signal in `services::http_server`.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token has been cancelled.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|v| *v).await;
    }
}

/// The other half of a [`CancelToken`]; owned by the Session Manager.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// An opaque handle to a running backend job. Adapters stash whatever they
/// need (a child process, an internal session id, ...) behind `Any` and
/// downcast it back in their own methods; the Session Manager only ever
/// threads the handle back into the adapter that produced it.
pub struct BackendHandle(Box<dyn Any + Send + Sync>);

impl BackendHandle {
    pub fn new<T: Send + Sync + 'static>(inner: T) -> Self {
        Self(Box::new(inner))
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

/// An opaque handle to an open progressive-output stream.
pub struct StreamHandle(Box<dyn Any + Send + Sync>);

impl StreamHandle {
    pub fn new<T: Send + Sync + 'static>(inner: T) -> Self {
        Self(Box::new(inner))
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterRunState {
    Running,
    Completed,
    Failed,
}

/// What `get_progress` reports back; mirrors the fields §4.2 names.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub state: AdapterRunState,
    pub progress: f32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub speed: f64,
    /// Populated when `state == Failed`.
    pub error: Option<String>,
}

/// The adapter contract (§4.2). Implementors must be safe to call from
/// multiple tasks concurrently; they do not retry internally — the caller
/// (Session Manager / Progress Aggregator) owns retry and backoff policy.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Stable identifier matching [`BackendDescriptor::id`].
    fn id(&self) -> &str;

    /// Pure, cacheable capability descriptor.
    fn get_capabilities(&self) -> BackendDescriptor;

    /// Number of sessions this adapter currently has in flight; consulted by
    /// [`BackendRegistry::select`](crate::backend::registry::BackendRegistry::select)
    /// for tie-breaking and capacity checks.
    fn current_load(&self) -> usize;

    /// Launch the job, writing into `directory`. Must return before encoding
    /// completes; observable output (directory populated, manifest emitted
    /// if applicable) must not require the caller to read the stream.
    async fn start_transcode(
        &self,
        request: &TranscodeRequest,
        directory: &Path,
        cancel: CancelToken,
    ) -> anyhow::Result<BackendHandle>;

    /// Cheap, idempotent progress read; must not block on encoder I/O beyond
    /// reading an already-buffered snapshot.
    async fn get_progress(&self, handle: &BackendHandle) -> anyhow::Result<ProgressSnapshot>;

    /// Cooperative then forced termination. Idempotent; safe to call after
    /// natural completion.
    async fn stop_transcode(&self, handle: &BackendHandle) -> anyhow::Result<()>;

    /// For progressive outputs only: open a byte stream for a single HTTP
    /// client. Not used by the default segment-serving path (§4.6 serves
    /// progressive files directly off disk), but part of the contract for
    /// adapters that do not write to a shared filesystem. `directory` is the
    /// same session directory passed to `start_transcode`.
    async fn start_stream(
        &self,
        request: &TranscodeRequest,
        directory: &Path,
        cancel: CancelToken,
    ) -> anyhow::Result<StreamHandle>;

    /// Idempotent.
    async fn stop_stream(&self, reader: &StreamHandle) -> anyhow::Result<()>;
}
