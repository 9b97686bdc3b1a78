//! Minimal ffprobe wrapper: just enough to feed the decision engine and the
//! progress-fraction calculation. Full stream introspection (HDR detection,
//! chapter lists, etc.) is deliberately not reproduced here — the control
//! plane only needs duration and the primary video stream's dimensions.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeInfo {
    pub duration_secs: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(flatten)]
    _rest: HashMap<String, serde_json::Value>,
}

pub async fn probe(ffprobe_path: &str, input: &Path) -> Result<ProbeInfo> {
    debug!(path = %input.display(), "probing source with ffprobe");

    let output = Command::new(ffprobe_path)
        .args(["-v", "error"])
        .args(["-print_format", "json"])
        .args(["-show_format", "-show_streams"])
        .arg(input)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to execute ffprobe for '{}'", input.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "ffprobe failed for '{}': {}",
            input.display(),
            if stderr.is_empty() {
                "no error output"
            } else {
                stderr.trim()
            }
        );
    }

    let parsed: FfprobeOutput =
        serde_json::from_slice(&output.stdout).context("failed to parse ffprobe JSON output")?;

    let duration_secs = parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok());

    let video = parsed
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    let (width, height) = video
        .map(|v| (v.width, v.height))
        .unwrap_or((None, None));

    Ok(ProbeInfo {
        duration_secs,
        width,
        height,
    })
}
