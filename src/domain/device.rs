//! The client/device capability hint passed alongside a playback request.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceProfile {
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub supported_codecs: Vec<String>,
    #[serde(default)]
    pub max_resolution: Option<String>,
    #[serde(default)]
    pub max_bitrate: Option<i64>,
    #[serde(default)]
    pub preferred_containers: Vec<String>,
    #[serde(default)]
    pub hevc_capable: bool,
    #[serde(default)]
    pub client_ip: Option<String>,
}

impl DeviceProfile {
    pub fn is_safari(&self) -> bool {
        self.user_agent
            .as_deref()
            .map(|ua| ua.contains("Safari") && !ua.contains("Chrome"))
            .unwrap_or(false)
    }
}
