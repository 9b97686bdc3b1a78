//! The verdict returned by the [decision engine](crate::decision).

use serde::Serialize;

use super::request::TranscodeRequest;

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub should_transcode: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcode_params: Option<TranscodeRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_stream_url: Option<String>,
}
