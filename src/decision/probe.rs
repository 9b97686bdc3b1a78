//! Minimal ffprobe-backed source analysis for the `/decide` endpoint. Kept
//! separate from `backend::ffmpeg::probe` deliberately: the decision engine
//! must stay adapter-agnostic, so it runs its own narrow probe rather than
//! reaching into a specific `BackendAdapter` implementation. The teacher
//! itself probes with ffprobe in more than one place
//! (`services::ffmpeg::FfmpegService`, `media::transcoder::Transcoder`); this
//! is the same pattern applied a third time for a different caller.

use std::process::Stdio;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Command;

use crate::domain::media::MediaDescriptor;

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

pub async fn probe_source(ffprobe_path: &str, path: &str) -> Result<MediaDescriptor> {
    let output = Command::new(ffprobe_path)
        .args(["-v", "error"])
        .args(["-print_format", "json"])
        .args(["-show_format", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to execute ffprobe for '{path}'"))?;

    if !output.status.success() {
        anyhow::bail!(
            "ffprobe failed for '{}': {}",
            path,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let parsed: FfprobeOutput =
        serde_json::from_slice(&output.stdout).context("failed to parse ffprobe JSON output")?;

    let container = parsed
        .format
        .as_ref()
        .and_then(|f| f.format_name.as_deref())
        .map(primary_container_alias)
        .unwrap_or_default()
        .to_string();
    let bitrate = parsed
        .format
        .and_then(|f| f.bit_rate)
        .and_then(|b| b.parse::<i64>().ok());

    let video = parsed
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    let (video_codec, width, height) = match video {
        Some(v) => (
            v.codec_name.unwrap_or_default(),
            v.width.unwrap_or(0),
            v.height.unwrap_or(0),
        ),
        None => (String::new(), 0, 0),
    };

    Ok(MediaDescriptor {
        path: path.to_string(),
        container,
        video_codec,
        bitrate,
        width,
        height,
    })
}

/// ffprobe reports container names like `matroska,webm`; normalize to the
/// first alias so comparisons against a profile's `preferred_containers`
/// (which name a single container) are meaningful.
pub fn primary_container_alias(format_name: &str) -> &str {
    format_name.split(',').next().unwrap_or(format_name)
}
