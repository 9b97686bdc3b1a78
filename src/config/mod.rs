//! Application configuration management

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (for generating URLs)
    pub host: Option<String>,

    /// Server port
    pub port: u16,

    /// Scratch root for per-session output directories (`VIEWRA_TRANSCODING_DIR`).
    pub transcoding_dir: String,

    /// Root the external plugin-discovery mechanism scans for backend
    /// subprocesses (`VIEWRA_PLUGIN_DIR`). Discovery itself is an external
    /// collaborator; this path is only surfaced for the `/plugins/refresh`
    /// log line and the reference backend's own binary lookup.
    pub plugin_dir: String,

    /// Progress-poll starting interval (default 1s).
    pub poll_interval: Duration,
    /// Progress-poll backoff ceiling (default 5s).
    pub poll_backoff_max: Duration,
    /// Consecutive poll failures before a session is failed as unreachable (default 5).
    pub poll_failure_threshold: u32,

    /// How long a terminal session's directory is retained before reaping (default 10m).
    pub retain_terminal: Duration,
    /// How long a session may stay in `pending`/`starting` before reaping (default 5m).
    pub start_timeout: Duration,
    /// How long `running` may go without a progress update before reaping (default 10m).
    pub stall_timeout: Duration,
    /// Interval between Cleanup Reaper cycles (default 60s).
    pub reaper_interval: Duration,
    /// Interval between periodic session-index snapshot writes (default 30s).
    pub snapshot_interval: Duration,

    /// Fallback global cap on concurrent sessions for backends whose
    /// descriptor does not specify `max_concurrent_sessions`.
    pub max_concurrent_sessions_fallback: usize,

    /// Maximum accepted JSON request body size, in bytes (default 1 MiB).
    pub max_body_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("HOST").ok(),

            port: env::var("PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .context("Invalid PORT")?,

            transcoding_dir: env::var("VIEWRA_TRANSCODING_DIR")
                .unwrap_or_else(|_| "./data/transcoding".to_string()),
            plugin_dir: env::var("VIEWRA_PLUGIN_DIR")
                .unwrap_or_else(|_| "./data/plugins".to_string()),

            poll_interval: Duration::from_secs(env_u64("VIEWRA_POLL_INTERVAL_SECS", 1)?),
            poll_backoff_max: Duration::from_secs(env_u64("VIEWRA_POLL_BACKOFF_MAX_SECS", 5)?),
            poll_failure_threshold: env_u64("VIEWRA_POLL_FAILURE_THRESHOLD", 5)? as u32,

            retain_terminal: Duration::from_secs(env_u64("VIEWRA_RETAIN_TERMINAL_SECS", 600)?),
            start_timeout: Duration::from_secs(env_u64("VIEWRA_START_TIMEOUT_SECS", 300)?),
            stall_timeout: Duration::from_secs(env_u64("VIEWRA_STALL_TIMEOUT_SECS", 600)?),
            reaper_interval: Duration::from_secs(env_u64("VIEWRA_REAPER_INTERVAL_SECS", 60)?),
            snapshot_interval: Duration::from_secs(env_u64("VIEWRA_SNAPSHOT_INTERVAL_SECS", 30)?),

            max_concurrent_sessions_fallback: env_u64(
                "VIEWRA_MAX_CONCURRENT_SESSIONS_FALLBACK",
                4,
            )? as usize,

            max_body_bytes: env_u64("VIEWRA_MAX_BODY_BYTES", 1024 * 1024)? as usize,
        })
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(v) => v.parse().with_context(|| format!("invalid {name}")),
        Err(_) => Ok(default),
    }
}
