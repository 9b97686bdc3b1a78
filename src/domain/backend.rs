//! The capability descriptor a [`BackendAdapter`](crate::backend::adapter::BackendAdapter)
//! publishes to the [Backend Registry](crate::backend::registry::BackendRegistry).

use serde::{Deserialize, Serialize};

/// Feature bits a backend may or may not support.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BackendFeatures {
    pub streaming_output: bool,
    pub segmented_output: bool,
    pub subtitle_burn_in: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub supported_video_codecs: Vec<String>,
    pub supported_audio_codecs: Vec<String>,
    pub supported_containers: Vec<String>,
    pub resolution_ladder: Vec<String>,
    pub max_concurrent_sessions: usize,
    pub hardware_accelerated: bool,
    pub features: BackendFeatures,
    /// Higher wins ties during [`select`](crate::backend::registry::BackendRegistry::select).
    pub priority: i32,
}
