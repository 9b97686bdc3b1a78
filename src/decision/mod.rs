//! The Decision Engine (§4.5): a pure function from (source media, device
//! profile, registered backend capabilities) to a playback [`Decision`].
//! Holds no locks and allocates nothing stateful — safe to call from any
//! task, any number of times, for the same inputs.

pub mod probe;

use crate::domain::backend::BackendDescriptor;
use crate::domain::decision::Decision;
use crate::domain::device::DeviceProfile;
use crate::domain::media::MediaDescriptor;
use crate::domain::request::{Container, TranscodeRequest, resolution_to_pixels};

/// Preset bitrates (bps) used to cap the chosen output bitrate per
/// resolution, so a low-bitrate device profile never gets upsampled.
fn preset_bitrate_bps(resolution: &str) -> i64 {
    match resolution {
        "2160p" => 16_000_000,
        "1080p" => 6_000_000,
        "720p" => 3_000_000,
        "480p" => 1_500_000,
        _ => 800_000,
    }
}

fn resolution_at_most(candidate: &str, limit: &str) -> bool {
    match (resolution_to_pixels(candidate), resolution_to_pixels(limit)) {
        (Some((_, ch)), Some((_, lh))) => ch <= lh,
        _ => false,
    }
}

/// Decide whether `media` can be played directly by a client matching
/// `profile`, or must be transcoded — and if so, with what parameters.
/// Implements the five first-match-wins rules in §4.5.
pub fn decide(media: &MediaDescriptor, profile: &DeviceProfile, backends: &[BackendDescriptor]) -> Decision {
    let source_resolution = media.resolution_preset();

    let codec_ok = profile
        .supported_codecs
        .iter()
        .any(|c| c == &media.video_codec);
    let container_ok = profile
        .preferred_containers
        .iter()
        .any(|c| c == &media.container);
    let bitrate_ok = media
        .bitrate
        .zip(profile.max_bitrate)
        .map(|(src, max)| src <= max)
        .unwrap_or(profile.max_bitrate.is_none());
    let resolution_ok = profile
        .max_resolution
        .as_deref()
        .map(|max| resolution_at_most(source_resolution, max))
        .unwrap_or(true);

    // Rule 1: direct play.
    if codec_ok && container_ok && bitrate_ok && resolution_ok {
        return Decision {
            should_transcode: false,
            reason: "source codec, container, bitrate and resolution all satisfy the device profile".into(),
            transcode_params: None,
            direct_stream_url: Some(format!("/media/direct?path={}", media.path)),
        };
    }

    // Rule 2: target container.
    let supports_container = |c: &str| backends.iter().any(|b| b.supported_containers.iter().any(|x| x == c));
    let prefers_hls = profile.is_safari() && supports_container("hls");
    let target_container = if prefers_hls {
        Container::Hls
    } else if let Some(c) = profile
        .preferred_containers
        .iter()
        .find(|c| supports_container(c))
        .and_then(|c| Container::from_str_loose(c))
    {
        c
    } else {
        Container::Dash
    };

    // Rule 3: target codec.
    let backend_codecs: Vec<&str> = backends
        .iter()
        .flat_map(|b| b.supported_video_codecs.iter().map(String::as_str))
        .collect();
    let candidate_codecs: Vec<&str> = profile
        .supported_codecs
        .iter()
        .map(String::as_str)
        .filter(|c| backend_codecs.contains(c))
        .collect();
    let target_codec = if profile.hevc_capable && candidate_codecs.contains(&"hevc") {
        "hevc"
    } else if candidate_codecs.contains(&"h264") {
        "h264"
    } else {
        candidate_codecs.first().copied().unwrap_or("h264")
    };

    // Rule 4: target bitrate.
    let preset = preset_bitrate_bps(source_resolution);
    let mut target_bitrate = preset;
    if let Some(src) = media.bitrate {
        target_bitrate = target_bitrate.min(src);
    }
    if let Some(max) = profile.max_bitrate {
        target_bitrate = target_bitrate.min(max);
    }

    let params = TranscodeRequest {
        input_path: media.path.clone(),
        target_codec: target_codec.to_string(),
        target_container,
        resolution: profile
            .max_resolution
            .clone()
            .unwrap_or_else(|| source_resolution.to_string()),
        bitrate: target_bitrate,
        audio_codec: None,
        audio_bitrate: None,
        quality: None,
        speed_preset: None,
        priority: 0,
    };

    Decision {
        should_transcode: true,
        reason: format!(
            "source does not satisfy device profile; transcoding to {} {}",
            target_codec,
            params.target_container.as_str()
        ),
        transcode_params: Some(params),
        direct_stream_url: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backend::BackendFeatures;

    fn ffmpeg_backend() -> BackendDescriptor {
        BackendDescriptor {
            id: "ffmpeg".into(),
            supported_video_codecs: vec!["h264".into(), "hevc".into()],
            supported_audio_codecs: vec!["aac".into()],
            supported_containers: vec!["dash".into(), "hls".into(), "mp4".into()],
            resolution_ladder: vec!["1080p".into(), "2160p".into()],
            max_concurrent_sessions: 4,
            hardware_accelerated: false,
            features: BackendFeatures::default(),
            priority: 0,
        }
    }

    #[test]
    fn direct_play_when_profile_satisfied() {
        let media = MediaDescriptor {
            path: "/m/a.mkv".into(),
            container: "matroska".into(),
            video_codec: "h264".into(),
            bitrate: Some(4_000_000),
            width: 1280,
            height: 720,
        };
        let profile = DeviceProfile {
            user_agent: Some("Chrome/120".into()),
            supported_codecs: vec!["h264".into(), "aac".into()],
            max_resolution: Some("1080p".into()),
            max_bitrate: Some(8_000_000),
            preferred_containers: vec!["matroska".into()],
            hevc_capable: false,
            client_ip: None,
        };
        let decision = decide(&media, &profile, &[ffmpeg_backend()]);
        assert!(!decision.should_transcode);
        assert!(decision.direct_stream_url.is_some());
    }

    #[test]
    fn transcodes_to_dash_h264_when_unsupported() {
        let media = MediaDescriptor {
            path: "/m/a.mkv".into(),
            container: "matroska".into(),
            video_codec: "hevc".into(),
            bitrate: Some(12_000_000),
            width: 1280,
            height: 720,
        };
        let profile = DeviceProfile {
            user_agent: Some("Chrome/120".into()),
            supported_codecs: vec!["h264".into(), "aac".into()],
            max_resolution: Some("1080p".into()),
            max_bitrate: Some(8_000_000),
            preferred_containers: vec!["dash".into()],
            hevc_capable: false,
            client_ip: None,
        };
        let decision = decide(&media, &profile, &[ffmpeg_backend()]);
        assert!(decision.should_transcode);
        let params = decision.transcode_params.unwrap();
        assert_eq!(params.target_codec, "h264");
        assert_eq!(params.target_container, Container::Dash);
    }

    #[test]
    fn prefers_hls_for_safari_when_available() {
        let media = MediaDescriptor {
            path: "/m/a.mkv".into(),
            container: "matroska".into(),
            video_codec: "hevc".into(),
            bitrate: Some(12_000_000),
            width: 1920,
            height: 1080,
        };
        let profile = DeviceProfile {
            user_agent: Some("Mozilla/5.0 Safari/605.1.15".into()),
            supported_codecs: vec!["h264".into()],
            max_resolution: Some("1080p".into()),
            max_bitrate: Some(8_000_000),
            preferred_containers: vec!["dash".into(), "hls".into()],
            hevc_capable: false,
            client_ip: None,
        };
        let decision = decide(&media, &profile, &[ffmpeg_backend()]);
        assert_eq!(
            decision.transcode_params.unwrap().target_container,
            Container::Hls
        );
    }
}
