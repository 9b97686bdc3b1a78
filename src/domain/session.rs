//! The session record: the externally-visible snapshot of one unit of
//! transcoding work. The runtime-only fields the source spec also lists on
//! `Session` — the backend process handle and the cancellation token — are
//! deliberately not part of this type. They are owned by
//! [`SessionManager`](crate::session::manager::SessionManager)'s internal
//! runtime table so that `Session` stays `Clone + Serialize` and can be
//! hand out freely as an HTTP response body or a store snapshot.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::TranscodeRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal edge in the §4.4 state graph.
    /// Any non-terminal state may always move to `failed` or `cancelled`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (*self, next) {
            (Pending, Starting) => true,
            (Starting, Running) => true,
            (Running, Completed) => true,
            (s, Failed) | (s, Cancelled) => !s.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub fingerprint: String,
    pub request: TranscodeRequest,
    pub backend_id: String,
    pub status: SessionStatus,
    pub progress: f32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub speed: f64,
    pub started_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    pub directory: PathBuf,
}

impl Session {
    pub fn new(
        id: String,
        fingerprint: String,
        request: TranscodeRequest,
        backend_id: String,
        directory: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            fingerprint,
            request,
            backend_id,
            status: SessionStatus::Pending,
            progress: 0.0,
            bytes_in: 0,
            bytes_out: 0,
            speed: 0.0,
            started_at: now,
            last_update_at: now,
            ended_at: None,
            error: None,
            directory,
        }
    }

    /// Apply a status transition, enforcing the §4.4 state graph and the
    /// monotone-progress invariant. Returns `false` (no-op) for illegal
    /// transitions instead of panicking, so callers like the reaper can
    /// attempt a transition speculatively.
    pub fn transition(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.last_update_at = Utc::now();
        if next == SessionStatus::Completed {
            self.progress = 1.0;
        }
        if next.is_terminal() {
            self.ended_at = Some(self.last_update_at);
        }
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        let ok = self.transition(SessionStatus::Failed);
        if ok {
            self.error = Some(reason.into());
        }
        ok
    }

    /// Record a progress update. Never moves `progress` backwards and never
    /// changes `status` — the aggregator does that separately when the
    /// adapter reports a terminal state.
    pub fn record_progress(&mut self, progress: f32, bytes_in: u64, bytes_out: u64, speed: f64) {
        self.progress = self.progress.max(progress.clamp(0.0, 1.0));
        self.bytes_in = bytes_in;
        self.bytes_out = bytes_out;
        self.speed = speed;
        self.last_update_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_forward_path() {
        use SessionStatus::*;
        assert!(Pending.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
    }

    #[test]
    fn no_backward_movement() {
        use SessionStatus::*;
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Running));
    }

    #[test]
    fn any_nonterminal_can_fail_or_cancel() {
        use SessionStatus::*;
        assert!(Pending.can_transition_to(Failed));
        assert!(Starting.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Failed));
    }

    #[test]
    fn progress_is_forced_to_one_on_completion() {
        let mut s = Session::new(
            "id".into(),
            "fp".into(),
            crate::domain::request::TranscodeRequest {
                input_path: "/a".into(),
                target_codec: "h264".into(),
                target_container: crate::domain::request::Container::Mp4,
                resolution: "720p".into(),
                bitrate: 1000,
                audio_codec: None,
                audio_bitrate: None,
                quality: None,
                speed_preset: None,
                priority: 0,
            },
            "ffmpeg".into(),
            "/tmp/session_id".into(),
        );
        s.record_progress(0.4, 0, 0, 0.0);
        assert!(s.transition(SessionStatus::Starting));
        assert!(s.transition(SessionStatus::Running));
        assert!(s.transition(SessionStatus::Completed));
        assert_eq!(s.progress, 1.0);
    }

    #[test]
    fn progress_never_decreases() {
        let mut s = Session::new(
            "id".into(),
            "fp".into(),
            crate::domain::request::TranscodeRequest {
                input_path: "/a".into(),
                target_codec: "h264".into(),
                target_container: crate::domain::request::Container::Mp4,
                resolution: "720p".into(),
                bitrate: 1000,
                audio_codec: None,
                audio_bitrate: None,
                quality: None,
                speed_preset: None,
                priority: 0,
            },
            "ffmpeg".into(),
            "/tmp/session_id".into(),
        );
        s.record_progress(0.5, 0, 0, 0.0);
        s.record_progress(0.3, 0, 0, 0.0);
        assert_eq!(s.progress, 0.5);
    }
}
