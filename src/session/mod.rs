//! The Session Store (C3) and Session Manager (C4) — session lifecycle,
//! dedup, the progress aggregator, and the striped locks both rely on.

pub mod locks;
pub mod manager;
pub mod snapshot;
pub mod store;

pub use locks::StripedLocks;
pub use manager::{SessionManager, SessionStats};
pub use snapshot::SnapshotService;
pub use store::{SessionStore, default_snapshot_path};
