//! Integration tests for the playback and transcoding control plane
//!
//! These tests verify end-to-end properties of the system:
//! - Session status transitions (pending -> starting -> running -> completed)
//! - Fingerprint-based deduplication
//! - Decision engine container/codec/bitrate selection
//! - Segment path safety and content-type mapping
//! - HTTP range satisfiability
//! - Cleanup reaper retention rules
//!
//! The binary has no library target, so these are black-box checks of the
//! documented contracts rather than direct calls into `crate::`, mirroring
//! the state machine, fingerprint, decision and segment-serving modules.

// ============================================================================
// Session Status Transition Tests
// ============================================================================

mod session_state_machine {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Status {
        Pending,
        Starting,
        Running,
        Completed,
        Failed,
        Cancelled,
    }

    impl Status {
        fn is_terminal(self) -> bool {
            matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
        }

        fn can_transition_to(self, next: Status) -> bool {
            use Status::*;
            match (self, next) {
                (Pending, Starting) => true,
                (Starting, Running) => true,
                (Running, Completed) => true,
                (s, Failed) | (s, Cancelled) => !s.is_terminal(),
                _ => false,
            }
        }
    }

    #[test]
    fn happy_path_is_legal() {
        use Status::*;
        assert!(Pending.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
    }

    #[test]
    fn cannot_skip_starting() {
        assert!(!Status::Pending.can_transition_to(Status::Running));
        assert!(!Status::Pending.can_transition_to(Status::Completed));
    }

    #[test]
    fn no_state_moves_backward() {
        assert!(!Status::Running.can_transition_to(Status::Starting));
        assert!(!Status::Completed.can_transition_to(Status::Running));
        assert!(!Status::Running.can_transition_to(Status::Pending));
    }

    #[test]
    fn any_nonterminal_state_can_fail_or_cancel() {
        for s in [Status::Pending, Status::Starting, Status::Running] {
            assert!(s.can_transition_to(Status::Failed), "{:?} -> Failed", s);
            assert!(s.can_transition_to(Status::Cancelled), "{:?} -> Cancelled", s);
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [Status::Completed, Status::Failed, Status::Cancelled] {
            for next in [
                Status::Pending,
                Status::Starting,
                Status::Running,
                Status::Completed,
                Status::Failed,
                Status::Cancelled,
            ] {
                if terminal == next {
                    continue;
                }
                assert!(
                    !terminal.can_transition_to(next),
                    "{:?} should not move to {:?}",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn progress_never_decreases() {
        // Mirrors Session::record_progress's monotone-max invariant.
        fn apply(current: f32, reported: f32) -> f32 {
            current.max(reported.clamp(0.0, 1.0))
        }
        let mut progress = 0.0f32;
        progress = apply(progress, 0.4);
        progress = apply(progress, 0.2); // stale/out-of-order report
        assert_eq!(progress, 0.4);
        progress = apply(progress, 0.9);
        assert_eq!(progress, 0.9);
    }
}

// ============================================================================
// Fingerprint Deduplication Tests
// ============================================================================

mod fingerprint_dedup {
    use serde::Serialize;
    use sha2::{Digest, Sha256};

    #[derive(Serialize)]
    struct FingerprintTuple<'a> {
        input_path: &'a str,
        target_container: &'a str,
        target_codec: &'a str,
        resolution: &'a str,
        bitrate: i64,
        audio_codec: Option<&'a str>,
        audio_bitrate: Option<i64>,
        quality: Option<u8>,
    }

    fn fingerprint(tuple: &FingerprintTuple<'_>) -> String {
        let canonical = serde_json::to_string(tuple).unwrap();
        format!("{:x}", Sha256::digest(canonical.as_bytes()))
    }

    fn sample() -> FingerprintTuple<'static> {
        FingerprintTuple {
            input_path: "/media/show.mkv",
            target_container: "dash",
            target_codec: "h264",
            resolution: "720p",
            bitrate: 3_000_000,
            audio_codec: None,
            audio_bitrate: None,
            quality: None,
        }
    }

    #[test]
    fn identical_requests_share_a_fingerprint() {
        assert_eq!(fingerprint(&sample()), fingerprint(&sample()));
    }

    #[test]
    fn bitrate_change_changes_fingerprint() {
        let mut other = sample();
        other.bitrate = 4_000_000;
        assert_ne!(fingerprint(&sample()), fingerprint(&other));
    }

    #[test]
    fn container_change_changes_fingerprint() {
        let mut other = sample();
        other.target_container = "hls";
        assert_ne!(fingerprint(&sample()), fingerprint(&other));
    }

    #[test]
    fn fingerprint_is_a_stable_lowercase_hex_digest() {
        let fp = fingerprint(&sample());
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}

// ============================================================================
// Decision Engine Tests
// ============================================================================

mod decision_engine {
    struct Profile {
        supported_codecs: Vec<&'static str>,
        preferred_containers: Vec<&'static str>,
        max_bitrate: Option<i64>,
        hevc_capable: bool,
        is_safari: bool,
    }

    struct Media {
        video_codec: &'static str,
        container: &'static str,
        bitrate: Option<i64>,
    }

    fn preset_bitrate_bps(resolution: &str) -> i64 {
        match resolution {
            "2160p" => 16_000_000,
            "1080p" => 6_000_000,
            "720p" => 3_000_000,
            "480p" => 1_500_000,
            _ => 800_000,
        }
    }

    fn direct_play_ok(media: &Media, profile: &Profile) -> bool {
        let codec_ok = profile.supported_codecs.contains(&media.video_codec);
        let container_ok = profile.preferred_containers.contains(&media.container);
        let bitrate_ok = media
            .bitrate
            .zip(profile.max_bitrate)
            .map(|(src, max)| src <= max)
            .unwrap_or(profile.max_bitrate.is_none());
        codec_ok && container_ok && bitrate_ok
    }

    fn target_container(profile: &Profile, backend_containers: &[&str]) -> &'static str {
        if profile.is_safari && backend_containers.contains(&"hls") {
            return "hls";
        }
        if profile
            .preferred_containers
            .iter()
            .any(|c| backend_containers.contains(c))
        {
            return "dash";
        }
        "dash"
    }

    fn target_codec(profile: &Profile, backend_codecs: &[&str]) -> &'static str {
        let candidates: Vec<&str> = profile
            .supported_codecs
            .iter()
            .copied()
            .filter(|c| backend_codecs.contains(c))
            .collect();
        if profile.hevc_capable && candidates.contains(&"hevc") {
            "hevc"
        } else if candidates.contains(&"h264") {
            "h264"
        } else {
            "h264"
        }
    }

    fn target_bitrate(resolution: &str, source_bitrate: Option<i64>, profile_max: Option<i64>) -> i64 {
        let mut bitrate = preset_bitrate_bps(resolution);
        if let Some(src) = source_bitrate {
            bitrate = bitrate.min(src);
        }
        if let Some(max) = profile_max {
            bitrate = bitrate.min(max);
        }
        bitrate
    }

    #[test]
    fn direct_play_when_everything_matches() {
        let media = Media {
            video_codec: "h264",
            container: "matroska",
            bitrate: Some(4_000_000),
        };
        let profile = Profile {
            supported_codecs: vec!["h264", "aac"],
            preferred_containers: vec!["matroska"],
            max_bitrate: Some(8_000_000),
            hevc_capable: false,
            is_safari: false,
        };
        assert!(direct_play_ok(&media, &profile));
    }

    #[test]
    fn unsupported_codec_forces_transcode() {
        let media = Media {
            video_codec: "hevc",
            container: "matroska",
            bitrate: Some(4_000_000),
        };
        let profile = Profile {
            supported_codecs: vec!["h264", "aac"],
            preferred_containers: vec!["matroska"],
            max_bitrate: Some(8_000_000),
            hevc_capable: false,
            is_safari: false,
        };
        assert!(!direct_play_ok(&media, &profile));
        assert_eq!(target_codec(&profile, &["h264", "hevc"]), "h264");
    }

    #[test]
    fn safari_prefers_hls_when_backend_supports_it() {
        let profile = Profile {
            supported_codecs: vec!["h264"],
            preferred_containers: vec!["dash", "hls"],
            max_bitrate: Some(8_000_000),
            hevc_capable: false,
            is_safari: true,
        };
        assert_eq!(target_container(&profile, &["dash", "hls", "mp4"]), "hls");
    }

    #[test]
    fn non_safari_falls_back_to_dash() {
        let profile = Profile {
            supported_codecs: vec!["h264"],
            preferred_containers: vec!["dash"],
            max_bitrate: Some(8_000_000),
            hevc_capable: false,
            is_safari: false,
        };
        assert_eq!(target_container(&profile, &["dash", "hls", "mp4"]), "dash");
    }

    #[test]
    fn hevc_capable_profile_prefers_hevc_when_backend_supports_it() {
        let profile = Profile {
            supported_codecs: vec!["h264", "hevc"],
            preferred_containers: vec!["dash"],
            max_bitrate: Some(8_000_000),
            hevc_capable: true,
            is_safari: false,
        };
        assert_eq!(target_codec(&profile, &["h264", "hevc"]), "hevc");
    }

    #[test]
    fn bitrate_never_exceeds_source_or_profile_cap() {
        // Source is lower than the 1080p preset: capped to source.
        assert_eq!(target_bitrate("1080p", Some(2_000_000), Some(8_000_000)), 2_000_000);
        // Profile cap is tighter than both preset and source.
        assert_eq!(target_bitrate("1080p", Some(9_000_000), Some(1_000_000)), 1_000_000);
        // Nothing constrains it below the preset.
        assert_eq!(target_bitrate("720p", None, None), 3_000_000);
    }
}

// ============================================================================
// Segment Path Safety and Content-Type Tests
// ============================================================================

mod segment_serving {
    fn resolve(session_id: &str, name: &str) -> Result<String, &'static str> {
        if session_id.is_empty() || session_id.contains(['/', '\\']) || session_id.contains("..") {
            return Err("unknown session");
        }
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err("segment not found");
        }
        Ok(format!("session_{session_id}/{name}"))
    }

    fn content_type_for(name: &str) -> &'static str {
        if name == "manifest.mpd" {
            "application/dash+xml"
        } else if name.ends_with(".m4s") || name.ends_with(".mp4") {
            "video/mp4"
        } else if name == "playlist.m3u8" {
            "application/vnd.apple.mpegurl"
        } else if name.ends_with(".ts") {
            "video/mp2t"
        } else {
            "application/octet-stream"
        }
    }

    #[test]
    fn well_formed_request_resolves() {
        assert_eq!(
            resolve("abc123", "segment_0.m4s").unwrap(),
            "session_abc123/segment_0.m4s"
        );
    }

    #[test]
    fn parent_directory_escape_is_rejected() {
        assert!(resolve("abc123", "../../etc/passwd").is_err());
        assert!(resolve("../abc", "segment_0.m4s").is_err());
    }

    #[test]
    fn embedded_separators_are_rejected() {
        assert!(resolve("abc123", "sub/segment_0.m4s").is_err());
        assert!(resolve("abc123", "sub\\segment_0.m4s").is_err());
    }

    #[test]
    fn content_types_match_the_known_table() {
        assert_eq!(content_type_for("manifest.mpd"), "application/dash+xml");
        assert_eq!(content_type_for("init.mp4"), "video/mp4");
        assert_eq!(content_type_for("segment_12.m4s"), "video/mp4");
        assert_eq!(content_type_for("playlist.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for("segment_003.ts"), "video/mp2t");
        assert_eq!(content_type_for("readme.txt"), "application/octet-stream");
    }

    #[test]
    fn numeric_segment_ordering_is_not_lexicographic() {
        // segment_10 must sort after segment_2, not before it.
        fn segment_index(name: &str) -> Option<u64> {
            name.strip_prefix("segment_")?
                .split('.')
                .next()?
                .parse()
                .ok()
        }
        let mut names = vec!["segment_2.m4s", "segment_10.m4s", "segment_1.m4s"];
        names.sort_by_key(|n| segment_index(n).unwrap());
        assert_eq!(names, vec!["segment_1.m4s", "segment_2.m4s", "segment_10.m4s"]);
    }
}

// ============================================================================
// HTTP Range Satisfiability Tests
// ============================================================================

mod http_range {
    /// Clamp a `bytes=start-end` request against the known file length,
    /// mirroring `segment::normalize_range` + the `start > end || start >=
    /// len` rejection check.
    fn clamp_range(start: u64, end: Option<u64>, len: u64) -> Option<(u64, u64)> {
        let end = end.unwrap_or(len.saturating_sub(1)).min(len.saturating_sub(1));
        if start > end || start >= len {
            return None;
        }
        Some((start, end))
    }

    #[test]
    fn open_ended_range_clamps_to_file_length() {
        assert_eq!(clamp_range(100, None, 1000), Some((100, 999)));
    }

    #[test]
    fn explicit_range_within_bounds_is_satisfiable() {
        assert_eq!(clamp_range(0, Some(99), 1000), Some((0, 99)));
    }

    #[test]
    fn range_requesting_past_eof_is_clamped_not_rejected() {
        assert_eq!(clamp_range(500, Some(5000), 1000), Some((500, 999)));
    }

    #[test]
    fn range_starting_at_or_past_eof_is_unsatisfiable() {
        assert_eq!(clamp_range(1000, None, 1000), None);
        assert_eq!(clamp_range(2000, Some(3000), 1000), None);
    }
}

// ============================================================================
// Cleanup Reaper Retention Tests
// ============================================================================

mod cleanup_reaper {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Status {
        Pending,
        Starting,
        Running,
        Completed,
        Failed,
        Cancelled,
    }

    impl Status {
        fn is_terminal(self) -> bool {
            matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
        }
    }

    /// Mirrors `CleanupReaper::reap_one`'s three checks: terminal sessions
    /// past the retention window, pending/starting sessions past the start
    /// timeout, and running sessions past the stall timeout.
    fn should_reap(
        status: Status,
        seconds_since_last_update: u64,
        retain_terminal_secs: u64,
        start_timeout_secs: u64,
        stall_timeout_secs: u64,
    ) -> bool {
        match status {
            s if s.is_terminal() => seconds_since_last_update >= retain_terminal_secs,
            Status::Pending | Status::Starting => seconds_since_last_update >= start_timeout_secs,
            Status::Running => seconds_since_last_update >= stall_timeout_secs,
            Status::Completed | Status::Failed | Status::Cancelled => unreachable!(),
        }
    }

    #[test]
    fn recently_completed_session_is_kept() {
        assert!(!should_reap(Status::Completed, 10, 600, 300, 600));
    }

    #[test]
    fn old_completed_session_is_reaped() {
        assert!(should_reap(Status::Completed, 601, 600, 300, 600));
    }

    #[test]
    fn session_stuck_pending_past_start_timeout_is_failed() {
        assert!(should_reap(Status::Pending, 301, 600, 300, 600));
        assert!(!should_reap(Status::Pending, 100, 600, 300, 600));
    }

    #[test]
    fn running_session_with_no_progress_past_stall_timeout_is_failed() {
        assert!(should_reap(Status::Running, 601, 600, 300, 600));
        assert!(!should_reap(Status::Running, 10, 600, 300, 600));
    }

    #[test]
    fn fresh_running_session_is_left_alone() {
        assert!(!should_reap(Status::Running, 0, 600, 300, 600));
    }
}
