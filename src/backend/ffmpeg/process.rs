//! Spawns and drives one ffmpeg child process, parsing its `-progress
//! pipe:1` machine-readable stream into a shared snapshot the adapter's
//! `get_progress` reads from. The teacher's own ffmpeg integration
//! (`services::ffmpeg::FfmpegService`) only ever piped `stderr` for error
//! text; this progress channel is new plumbing this control plane needs.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex as TokioMutex, Notify};
use tracing::{debug, info, warn};

use crate::backend::adapter::{AdapterRunState, CancelToken};
use crate::domain::request::{Container, TranscodeRequest};
use crate::session::StripedLocks;

use super::manifest::{DashManifestSpec, render_dash_manifest};
use super::probe;

#[derive(Debug, Clone)]
pub struct JobProgress {
    pub state: AdapterRunState,
    pub progress: f32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub speed: f64,
    pub error: Option<String>,
}

impl Default for JobProgress {
    fn default() -> Self {
        Self {
            state: AdapterRunState::Running,
            progress: 0.0,
            bytes_in: 0,
            bytes_out: 0,
            speed: 0.0,
            error: None,
        }
    }
}

pub struct RunningJob {
    child: Arc<TokioMutex<Option<Child>>>,
    progress: Arc<RwLock<JobProgress>>,
}

impl RunningJob {
    pub fn snapshot(&self) -> JobProgress {
        self.progress.read().clone()
    }

    pub async fn kill(&self) {
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.start_kill();
        }
    }
}

fn ffmpeg_video_codec(target_codec: &str) -> &'static str {
    match target_codec {
        "hevc" => "libx265",
        "vp9" => "libvpx-vp9",
        _ => "libx264",
    }
}

fn ffmpeg_audio_codec(codec: &str) -> &'static str {
    match codec {
        "opus" => "libopus",
        _ => "aac",
    }
}

struct OutputPlan {
    args: Vec<String>,
    /// Set only for adaptive containers; used for post-processing.
    dash_init: Option<String>,
}

fn build_args(request: &TranscodeRequest, directory: &Path) -> Result<OutputPlan> {
    let (width, height) = crate::domain::request::resolution_to_pixels(&request.resolution)
        .context("resolution already validated by TranscodeRequest::validate")?;

    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        request.input_path.clone(),
        "-c:v".to_string(),
        ffmpeg_video_codec(&request.target_codec).to_string(),
        "-b:v".to_string(),
        format!("{}k", request.bitrate / 1000),
        "-vf".to_string(),
        format!("scale={}:{}", width, height),
    ];

    if let Some(preset) = &request.speed_preset {
        args.push("-preset".to_string());
        args.push(preset.clone());
    }
    if let Some(q) = request.quality {
        args.push("-crf".to_string());
        args.push(q.to_string());
    }

    if let Some(codec) = &request.audio_codec {
        args.push("-c:a".to_string());
        args.push(ffmpeg_audio_codec(codec).to_string());
        if let Some(bitrate) = request.audio_bitrate {
            args.push("-b:a".to_string());
            args.push(format!("{}k", bitrate / 1000));
        }
    } else {
        args.push("-an".to_string());
    }

    let dash_init = match request.target_container {
        Container::Hls => {
            args.push("-f".to_string());
            args.push("hls".to_string());
            args.push("-hls_time".to_string());
            args.push("4".to_string());
            args.push("-hls_playlist_type".to_string());
            args.push("vod".to_string());
            args.push("-hls_segment_filename".to_string());
            args.push(directory.join("segment_%03d.ts").display().to_string());
            args.push(directory.join("playlist.m3u8").display().to_string());
            None
        }
        Container::Dash => {
            args.push("-f".to_string());
            args.push("segment".to_string());
            args.push("-segment_format".to_string());
            args.push("mp4".to_string());
            args.push("-segment_format_options".to_string());
            args.push("movflags=+frag_keyframe+empty_moov".to_string());
            args.push("-segment_time".to_string());
            args.push("4".to_string());
            args.push("-reset_timestamps".to_string());
            args.push("1".to_string());
            args.push(directory.join("segment_%d.m4s").display().to_string());
            Some("init.mp4".to_string())
        }
        Container::Mp4 => {
            args.push("-movflags".to_string());
            args.push("+faststart".to_string());
            args.push("-f".to_string());
            args.push("mp4".to_string());
            args.push(directory.join("output.mp4").display().to_string());
            None
        }
        Container::Webm => {
            args.push("-f".to_string());
            args.push("webm".to_string());
            args.push(directory.join("output.webm").display().to_string());
            None
        }
        Container::Mkv => {
            args.push("-f".to_string());
            args.push("matroska".to_string());
            args.push(directory.join("output.mkv").display().to_string());
            None
        }
    };

    args.push("-progress".to_string());
    args.push("pipe:1".to_string());
    args.push("-nostats".to_string());

    Ok(OutputPlan { args, dash_init })
}

/// Launch ffmpeg for `request`, writing into `directory`. Spawns a background
/// task that parses progress, honors `cancel`, performs dash manifest
/// post-processing on success, and decrements `load` when the job ends.
pub async fn spawn(
    ffmpeg_path: &str,
    ffprobe_path: &str,
    request: TranscodeRequest,
    directory: PathBuf,
    mut cancel: CancelToken,
    load: Arc<AtomicUsize>,
    io_locks: Arc<StripedLocks>,
) -> Result<RunningJob> {
    let probed = probe::probe(ffprobe_path, Path::new(&request.input_path))
        .await
        .unwrap_or_default();
    let duration_secs = probed.duration_secs;

    // `SegmentDirectoryService::session_dir` names directories
    // `session_<id>`; recovering the id lets the manifest writer take the
    // same `io_locks` shard a concurrent manifest read takes, without
    // threading a session id through the whole `BackendAdapter` contract.
    let session_id = directory
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("session_"))
        .unwrap_or("unknown")
        .to_string();

    let plan = build_args(&request, &directory)?;

    info!(input = %request.input_path, container = request.target_container.as_str(), "starting ffmpeg transcode");

    let mut child = Command::new(ffmpeg_path)
        .args(&plan.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn '{}'", ffmpeg_path))?;

    let stdout = child.stdout.take().context("ffmpeg child missing stdout")?;
    let stderr = child.stderr.take().context("ffmpeg child missing stderr")?;

    let progress = Arc::new(RwLock::new(JobProgress::default()));
    let child = Arc::new(TokioMutex::new(Some(child)));

    let progress_writer = progress.clone();
    let child_for_task = child.clone();
    let directory_for_task = directory.clone();
    let session_id_for_task = session_id.clone();
    let io_locks_for_task = io_locks.clone();
    let container = request.target_container;
    let dash_init = plan.dash_init.clone();
    let video_codec_tag = request.target_codec.clone();
    let video_bitrate_bps = request.bitrate;
    let audio_codec_tag = request.audio_codec.clone();
    let audio_bitrate_bps = request.audio_bitrate;

    // Adaptive (DASH) output needs `manifest.mpd` to exist well before the
    // encode finishes — §4.2 requires observable output "without requiring
    // the caller to read the stream", and clients poll the manifest long
    // before a multi-minute transcode completes. This task republishes a
    // provisional manifest off whatever segments currently exist on disk
    // every 2s; `finalize_dash_manifest` overwrites it one last time with the
    // authoritative duration once ffmpeg exits successfully.
    let manifest_refresh = if container == Container::Dash {
        let directory = directory.clone();
        let session_id_for_manifest = session_id.clone();
        let io_locks_for_manifest = io_locks.clone();
        let init_segment = dash_init.clone().unwrap_or_else(|| "init.mp4".to_string());
        let video_codec_tag = video_codec_tag.clone();
        let audio_codec_tag = audio_codec_tag.clone();
        let finished = Arc::new(AtomicBool::new(false));
        let finished_for_task = finished.clone();
        let stop_notify = Arc::new(Notify::new());
        let stop_notify_for_task = stop_notify.clone();
        let mut cancel_for_manifest = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                if finished_for_task.load(Ordering::SeqCst) {
                    break;
                }
                let provisional_duration = 4.0 * (1 + count_segments(&directory).await) as f64;
                if let Err(e) = write_dash_manifest_from_directory(
                    &directory,
                    &session_id_for_manifest,
                    &io_locks_for_manifest,
                    &init_segment,
                    provisional_duration,
                    probed.width.unwrap_or(1920),
                    probed.height.unwrap_or(1080),
                    &video_codec_tag,
                    video_bitrate_bps,
                    audio_codec_tag.as_deref(),
                    audio_bitrate_bps,
                )
                .await
                {
                    debug!(error = %e, "provisional dash manifest refresh failed, will retry");
                }
                tokio::select! {
                    _ = cancel_for_manifest.cancelled() => break,
                    _ = stop_notify_for_task.notified() => break,
                    _ = ticker.tick() => {}
                }
            }
        });
        Some((task, finished, stop_notify))
    } else {
        None
    };

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut block: Vec<(String, String)> = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("transcode cancelled, killing ffmpeg");
                    if let Some(child) = child_for_task.lock().await.as_mut() {
                        let _ = child.start_kill();
                    }
                    break;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some((key, value)) = line.split_once('=') {
                                let key = key.trim().to_string();
                                let value = value.trim().to_string();
                                let is_boundary = key == "progress";
                                let boundary_value = value.clone();
                                block.push((key, value));
                                if is_boundary {
                                    apply_block(&progress_writer, &block, duration_secs);
                                    block.clear();
                                    if boundary_value == "end" {
                                        break;
                                    }
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "error reading ffmpeg progress stream");
                            break;
                        }
                    }
                }
            }
        }

        // drain stderr in the background so the child never blocks on a full pipe
        while let Ok(Some(_)) = stderr_lines.next_line().await {}

        let exit = {
            let mut guard = child_for_task.lock().await;
            match guard.as_mut() {
                Some(child) => child.wait().await,
                None => return,
            }
        };

        load.fetch_sub(1, Ordering::SeqCst);

        // Stop the provisional-manifest refresher and wait for its last
        // in-flight write to land before the authoritative one below, so the
        // final manifest is never clobbered by a stale periodic refresh.
        if let Some((task, finished, stop_notify)) = manifest_refresh {
            finished.store(true, Ordering::SeqCst);
            stop_notify.notify_one();
            let _ = task.await;
        }

        match exit {
            Ok(status) if status.success() => {
                if container == Container::Dash {
                    if let Err(e) = finalize_dash_manifest(
                        &directory_for_task,
                        &session_id_for_task,
                        &io_locks_for_task,
                        dash_init.as_deref().unwrap_or("init.mp4"),
                        duration_secs.unwrap_or(0.0),
                        probed.width.unwrap_or(1920),
                        probed.height.unwrap_or(1080),
                        &video_codec_tag,
                        video_bitrate_bps,
                        audio_codec_tag.as_deref(),
                        audio_bitrate_bps,
                    )
                    .await
                    {
                        warn!(error = %e, "failed to author dash manifest");
                        let mut state = progress_writer.write();
                        state.state = AdapterRunState::Failed;
                        state.error = Some(format!("manifest authoring failed: {e}"));
                        return;
                    }
                }
                let mut state = progress_writer.write();
                state.state = AdapterRunState::Completed;
                state.progress = 1.0;
                debug!("ffmpeg transcode completed");
            }
            Ok(status) => {
                let mut state = progress_writer.write();
                state.state = AdapterRunState::Failed;
                state.error = Some(format!("ffmpeg exited with {status}"));
            }
            Err(e) => {
                let mut state = progress_writer.write();
                state.state = AdapterRunState::Failed;
                state.error = Some(format!("failed to wait on ffmpeg: {e}"));
            }
        }
    });

    Ok(RunningJob { child, progress })
}

fn apply_block(progress: &Arc<RwLock<JobProgress>>, block: &[(String, String)], duration_secs: Option<f64>) {
    let mut out_time_ms: Option<u64> = None;
    let mut total_size: Option<u64> = None;
    let mut speed: Option<f64> = None;

    for (key, value) in block {
        match key.as_str() {
            "out_time_ms" => out_time_ms = value.parse().ok(),
            "total_size" => total_size = value.parse().ok(),
            "speed" => speed = value.trim_end_matches('x').trim().parse().ok(),
            _ => {}
        }
    }

    let mut state = progress.write();
    if let (Some(ms), Some(duration)) = (out_time_ms, duration_secs) {
        if duration > 0.0 {
            let fraction = (ms as f64 / 1_000_000.0) / duration;
            state.progress = state.progress.max(fraction.clamp(0.0, 1.0) as f32);
        }
    }
    if let Some(size) = total_size {
        state.bytes_out = size;
    }
    if let Some(s) = speed {
        state.speed = s;
    }
}

/// The numeric index ffmpeg's segment muxer embeds in `segment_<n>.m4s`, for
/// sorting the SegmentList in playback order. Lexicographic sort would place
/// `segment_10.m4s` before `segment_2.m4s` once a session passes 10 segments
/// (40s at the default 4s segment duration) — common for any real transcode.
fn segment_index(name: &str) -> Option<u64> {
    name.strip_prefix("segment_")?
        .strip_suffix(".m4s")?
        .parse()
        .ok()
}

/// List currently-written `segment_*.m4s` files, in playback order. Used
/// both by the periodic provisional refresh and the final authoritative
/// write — reading "whatever exists right now" is the same race-tolerant
/// operation either way (§4.6).
async fn list_segment_files(directory: &Path) -> Result<Vec<String>> {
    let mut segment_files = Vec::new();
    let mut read_dir = tokio::fs::read_dir(directory).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("segment_") && name.ends_with(".m4s") {
            segment_files.push(name);
        }
    }
    segment_files.sort_by_key(|name| segment_index(name).unwrap_or(u64::MAX));
    Ok(segment_files)
}

async fn count_segments(directory: &Path) -> usize {
    list_segment_files(directory).await.map(|v| v.len()).unwrap_or(0)
}

#[allow(clippy::too_many_arguments)]
async fn write_dash_manifest_from_directory(
    directory: &Path,
    session_id: &str,
    io_locks: &StripedLocks,
    init_segment: &str,
    duration_secs: f64,
    width: u32,
    height: u32,
    video_codec_tag: &str,
    video_bitrate_bps: i64,
    audio_codec_tag: Option<&str>,
    audio_bitrate_bps: Option<i64>,
) -> Result<()> {
    let segment_files = list_segment_files(directory).await?;

    let spec = DashManifestSpec {
        duration_secs,
        segment_duration_secs: 4.0,
        init_segment,
        segment_files: &segment_files,
        width,
        height,
        video_codec_tag,
        video_bitrate_bps,
        audio_codec_tag,
        audio_bitrate_bps,
    };
    let xml = render_dash_manifest(&spec)?;

    // Same shard the HTTP-facing reader (`segment::serve_manifest`) takes, so
    // a GET can never observe a manifest mid-write; the tmp+rename keeps the
    // window where a reader could see a half-written file at zero (§4.8).
    let shard = io_locks.shard_for(session_id);
    let _guard = shard.lock().await;
    let path = directory.join("manifest.mpd");
    let tmp = directory.join("manifest.mpd.tmp");
    tokio::fs::write(&tmp, xml).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

/// The authoritative, final write: same shape as the periodic provisional
/// refresh, but called once after ffmpeg exits successfully with the real
/// total duration instead of a running estimate.
#[allow(clippy::too_many_arguments)]
async fn finalize_dash_manifest(
    directory: &Path,
    session_id: &str,
    io_locks: &StripedLocks,
    init_segment: &str,
    duration_secs: f64,
    width: u32,
    height: u32,
    video_codec_tag: &str,
    video_bitrate_bps: i64,
    audio_codec_tag: Option<&str>,
    audio_bitrate_bps: Option<i64>,
) -> Result<()> {
    write_dash_manifest_from_directory(
        directory,
        session_id,
        io_locks,
        init_segment,
        duration_secs,
        width,
        height,
        video_codec_tag,
        video_bitrate_bps,
        audio_codec_tag,
        audio_bitrate_bps,
    )
    .await
}
