//! The reference `BackendAdapter`: ffmpeg for encoding, ffprobe for source
//! analysis. Ships so the system is runnable end to end; other adapters are
//! external collaborators per the design (§1).

mod manifest;
mod probe;
mod process;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::fs::File;

use crate::domain::backend::{BackendDescriptor, BackendFeatures};
use crate::domain::request::TranscodeRequest;
use crate::session::StripedLocks;

use super::adapter::{
    AdapterRunState, BackendAdapter, BackendHandle, CancelToken, ProgressSnapshot, StreamHandle,
};

pub struct FfmpegBackend {
    id: String,
    ffmpeg_path: String,
    ffprobe_path: String,
    max_concurrent_sessions: usize,
    load: Arc<AtomicUsize>,
    /// Shared with `SegmentDirectoryService`, so manifest writes and reads
    /// of the same session's `manifest.mpd` take the same shard (§4.8).
    io_locks: Arc<StripedLocks>,
}

impl FfmpegBackend {
    pub fn new(max_concurrent_sessions: usize, io_locks: Arc<StripedLocks>) -> Self {
        Self {
            id: "ffmpeg".to_string(),
            ffmpeg_path: std::env::var("VIEWRA_FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe_path: std::env::var("VIEWRA_FFPROBE_PATH")
                .unwrap_or_else(|_| "ffprobe".to_string()),
            max_concurrent_sessions,
            load: Arc::new(AtomicUsize::new(0)),
            io_locks,
        }
    }
}

#[async_trait]
impl BackendAdapter for FfmpegBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_capabilities(&self) -> BackendDescriptor {
        BackendDescriptor {
            id: self.id.clone(),
            supported_video_codecs: vec!["h264".into(), "hevc".into(), "vp9".into()],
            supported_audio_codecs: vec!["aac".into(), "opus".into()],
            supported_containers: vec![
                "mp4".into(),
                "dash".into(),
                "hls".into(),
                "webm".into(),
                "mkv".into(),
            ],
            resolution_ladder: vec![
                "480p".into(),
                "720p".into(),
                "1080p".into(),
                "2160p".into(),
            ],
            max_concurrent_sessions: self.max_concurrent_sessions,
            hardware_accelerated: false,
            features: BackendFeatures {
                streaming_output: true,
                segmented_output: true,
                subtitle_burn_in: false,
            },
            priority: 0,
        }
    }

    fn current_load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    async fn start_transcode(
        &self,
        request: &TranscodeRequest,
        directory: &Path,
        cancel: CancelToken,
    ) -> anyhow::Result<BackendHandle> {
        self.load.fetch_add(1, Ordering::SeqCst);
        let job = match process::spawn(
            &self.ffmpeg_path,
            &self.ffprobe_path,
            request.clone(),
            directory.to_path_buf(),
            cancel,
            self.load.clone(),
            self.io_locks.clone(),
        )
        .await
        {
            Ok(job) => job,
            Err(e) => {
                self.load.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        Ok(BackendHandle::new(job))
    }

    async fn get_progress(&self, handle: &BackendHandle) -> anyhow::Result<ProgressSnapshot> {
        let job = handle
            .downcast_ref::<process::RunningJob>()
            .ok_or_else(|| anyhow::anyhow!("handle does not belong to the ffmpeg backend"))?;
        let snapshot = job.snapshot();
        Ok(ProgressSnapshot {
            state: snapshot.state,
            progress: snapshot.progress,
            bytes_in: snapshot.bytes_in,
            bytes_out: snapshot.bytes_out,
            speed: snapshot.speed,
            error: snapshot.error,
        })
    }

    async fn stop_transcode(&self, handle: &BackendHandle) -> anyhow::Result<()> {
        let job = handle
            .downcast_ref::<process::RunningJob>()
            .ok_or_else(|| anyhow::anyhow!("handle does not belong to the ffmpeg backend"))?;
        job.kill().await;
        Ok(())
    }

    async fn start_stream(
        &self,
        request: &TranscodeRequest,
        directory: &Path,
        _cancel: CancelToken,
    ) -> anyhow::Result<StreamHandle> {
        let filename = match request.target_container {
            crate::domain::request::Container::Mp4 => "output.mp4",
            crate::domain::request::Container::Webm => "output.webm",
            crate::domain::request::Container::Mkv => "output.mkv",
            other => anyhow::bail!("{:?} is not a progressive container", other),
        };
        let file = File::open(directory.join(filename)).await?;
        Ok(StreamHandle::new(file))
    }

    async fn stop_stream(&self, _reader: &StreamHandle) -> anyhow::Result<()> {
        // Dropping the File handle closes it; nothing else to release.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_advertise_all_containers() {
        let backend = FfmpegBackend::new(4, Arc::new(StripedLocks::new()));
        let caps = backend.get_capabilities();
        assert_eq!(caps.max_concurrent_sessions, 4);
        assert!(caps.supported_containers.contains(&"dash".to_string()));
        assert!(caps.features.segmented_output);
        assert_eq!(backend.current_load(), 0);
    }
}
