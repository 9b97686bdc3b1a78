//! Striped locks keyed by hash, used both for the per-fingerprint start
//! critical section and (a second instance) for the per-session-id mutex
//! that serializes status transitions and progress updates (§5).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::Mutex;

const SHARD_COUNT: usize = 64;

pub struct StripedLocks {
    shards: Vec<Arc<Mutex<()>>>,
}

impl StripedLocks {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    pub fn shard_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        self.shards[idx].clone()
    }
}

impl Default for StripedLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_maps_to_same_shard() {
        let locks = StripedLocks::new();
        let a = locks.shard_for("fingerprint-a");
        let b = locks.shard_for("fingerprint-a");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
