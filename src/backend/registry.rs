//! The Backend Registry (§4.1): a mapping from backend id to a registered
//! [`BackendAdapter`], plus the `select` routing algorithm.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::{BackendDescriptor, DeviceProfile, TranscodeRequest};
use crate::error::ApiError;

use super::adapter::BackendAdapter;

struct Entry {
    adapter: Arc<dyn BackendAdapter>,
}

/// Thread-safe registry of backend adapters. `refresh()` is a no-op today
/// (the reference backend is registered once at startup and never changes
/// capabilities at runtime) but is kept as an explicit, idempotent operation
/// so a future discovery mechanism (the external plugin-scan collaborator
/// `VIEWRA_PLUGIN_DIR` names) has a seam to call into.
pub struct BackendRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, adapter: Arc<dyn BackendAdapter>) {
        self.entries.write().push(Entry { adapter });
    }

    pub fn list(&self) -> Vec<BackendDescriptor> {
        self.entries
            .read()
            .iter()
            .map(|e| e.adapter.get_capabilities())
            .collect()
    }

    /// List capabilities alongside current load, for the admin backends endpoint.
    pub fn list_with_load(&self) -> Vec<(BackendDescriptor, usize)> {
        self.entries
            .read()
            .iter()
            .map(|e| (e.adapter.get_capabilities(), e.adapter.current_load()))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn BackendAdapter>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.adapter.id() == id)
            .map(|e| e.adapter.clone())
    }

    /// Re-scan registered backends. Idempotent and safe to call concurrently;
    /// today this just confirms every registered adapter still answers
    /// `get_capabilities()`.
    pub fn refresh(&self) -> usize {
        self.entries.read().len()
    }

    /// Pick a backend for `request`, honoring `profile`'s constraints where
    /// given. Filters by supported container/codec/resolution, drops
    /// backends at capacity, ranks the remainder by descriptor priority
    /// (highest first) and breaks ties by lowest current load.
    pub fn select(
        &self,
        request: &TranscodeRequest,
        profile: Option<&DeviceProfile>,
    ) -> Result<String, ApiError> {
        let entries = self.entries.read();
        let mut candidates: Vec<(&Entry, BackendDescriptor)> = entries
            .iter()
            .map(|e| (e, e.adapter.get_capabilities()))
            .filter(|(_, d)| d.supported_containers.contains(&request.target_container.as_str().to_string()))
            .filter(|(_, d)| d.supported_video_codecs.contains(&request.target_codec))
            .filter(|(_, d)| {
                request
                    .audio_codec
                    .as_ref()
                    .map(|c| d.supported_audio_codecs.contains(c))
                    .unwrap_or(true)
            })
            .filter(|(_, d)| {
                crate::domain::request::resolution_to_pixels(&request.resolution)
                    .map(|(_, h)| {
                        d.resolution_ladder.iter().any(|r| {
                            crate::domain::request::resolution_to_pixels(r)
                                .map(|(_, rh)| rh >= h)
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false)
            })
            .filter(|(_, d)| {
                profile
                    .and_then(|p| p.max_bitrate)
                    .map(|max| request.bitrate <= max)
                    .unwrap_or(true)
            })
            .filter(|(e, d)| e.adapter.current_load() < d.max_concurrent_sessions)
            .collect();

        candidates.sort_by(|(ea, da), (eb, db)| {
            db.priority
                .cmp(&da.priority)
                .then_with(|| ea.adapter.current_load().cmp(&eb.adapter.current_load()))
        });

        candidates
            .into_iter()
            .next()
            .map(|(e, _)| e.adapter.id().to_string())
            .ok_or_else(|| {
                ApiError::service_unavailable(format!(
                    "no backend available for container={} codec={}",
                    request.target_container.as_str(),
                    request.target_codec
                ))
            })
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
