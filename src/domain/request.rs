//! The immutable request describing a desired transcode output, and the
//! content-addressed fingerprint used to deduplicate equivalent requests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ApiError;

/// Output container. Backends advertise which of these they can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Dash,
    Hls,
    Webm,
    Mkv,
}

impl Container {
    pub fn as_str(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Dash => "dash",
            Container::Hls => "hls",
            Container::Webm => "webm",
            Container::Mkv => "mkv",
        }
    }

    /// Adaptive containers ship a manifest plus many segments; progressive
    /// containers ship a single file.
    pub fn is_adaptive(&self) -> bool {
        matches!(self, Container::Dash | Container::Hls)
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mp4" => Some(Container::Mp4),
            "dash" => Some(Container::Dash),
            "hls" => Some(Container::Hls),
            "webm" => Some(Container::Webm),
            "mkv" => Some(Container::Mkv),
            _ => None,
        }
    }
}

/// Codecs this adapter recognizes. The reference backend only ever produces
/// `h264`, but validation accepts the wider set the descriptor advertises so
/// other adapters registered alongside it are not arbitrarily constrained.
pub const KNOWN_VIDEO_CODECS: &[&str] = &["h264", "hevc", "vp9"];
pub const KNOWN_AUDIO_CODECS: &[&str] = &["aac", "opus"];

/// A named resolution preset or an explicit pixel size, as sent by the
/// client (`"720p"`, `"1920x1080"`, ...). Stored as the raw string and
/// parsed to pixels on demand so the fingerprint reflects exactly what the
/// caller asked for.
pub fn resolution_to_pixels(resolution: &str) -> Option<(u32, u32)> {
    match resolution.to_ascii_lowercase().as_str() {
        "2160p" | "4k" => Some((3840, 2160)),
        "1080p" => Some((1920, 1080)),
        "720p" => Some((1280, 720)),
        "480p" => Some((854, 480)),
        "sd" => Some((640, 360)),
        other => {
            let (w, h) = other.split_once('x')?;
            Some((w.parse().ok()?, h.parse().ok()?))
        }
    }
}

/// Immutable description of a desired transcode output. Two requests with
/// equal [`fingerprint`](TranscodeRequest::fingerprint) are interchangeable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeRequest {
    pub input_path: String,
    pub target_codec: String,
    pub target_container: Container,
    pub resolution: String,
    pub bitrate: i64,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub audio_bitrate: Option<i64>,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub speed_preset: Option<String>,
    #[serde(default)]
    pub priority: u8,
}

/// Fields that determine output equivalence, serialized in a fixed order so
/// the fingerprint is stable regardless of struct field order.
#[derive(Serialize)]
struct FingerprintTuple<'a> {
    input_path: &'a str,
    target_container: &'static str,
    target_codec: &'a str,
    resolution: &'a str,
    bitrate: i64,
    audio_codec: Option<&'a str>,
    audio_bitrate: Option<i64>,
    quality: Option<u8>,
}

impl TranscodeRequest {
    /// Validate the request against the §7 `BadRequest` rules. Unknown
    /// containers are rejected at the type level by serde; everything else
    /// is checked here.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.input_path.trim().is_empty() {
            return Err(ApiError::bad_request("input_path must not be empty"));
        }
        if !KNOWN_VIDEO_CODECS.contains(&self.target_codec.as_str()) {
            return Err(ApiError::bad_request(format!(
                "unknown target_codec '{}'",
                self.target_codec
            )));
        }
        if self.bitrate <= 0 {
            return Err(ApiError::bad_request("bitrate must be positive"));
        }
        if resolution_to_pixels(&self.resolution).is_none() {
            return Err(ApiError::bad_request(format!(
                "unrecognized resolution '{}'",
                self.resolution
            )));
        }
        if let Some(ref codec) = self.audio_codec
            && !KNOWN_AUDIO_CODECS.contains(&codec.as_str())
        {
            return Err(ApiError::bad_request(format!(
                "unknown audio_codec '{}'",
                codec
            )));
        }
        if let Some(bitrate) = self.audio_bitrate
            && bitrate <= 0
        {
            return Err(ApiError::bad_request("audio_bitrate must be positive"));
        }
        if let Some(q) = self.quality
            && !(1..=51).contains(&q)
        {
            return Err(ApiError::bad_request("quality must be between 1 and 51"));
        }
        Ok(())
    }

    /// Content-addressed hash over the normalized tuple of fields that
    /// determine output equivalence. Grounded in the teacher's
    /// `indexer::types::cache_key` recipe (canonical JSON, SHA-256, hex).
    pub fn fingerprint(&self) -> String {
        let tuple = FingerprintTuple {
            input_path: &self.input_path,
            target_container: self.target_container.as_str(),
            target_codec: &self.target_codec,
            resolution: &self.resolution,
            bitrate: self.bitrate,
            audio_codec: self.audio_codec.as_deref(),
            audio_bitrate: self.audio_bitrate,
            quality: self.quality,
        };
        let canonical =
            serde_json::to_string(&tuple).expect("fingerprint tuple is always serializable");
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{:x}", digest)
    }
}
