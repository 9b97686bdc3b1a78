//! Backend registry and adapter contract (§4.1, §4.2).

pub mod adapter;
pub mod ffmpeg;
pub mod registry;

pub use adapter::{
    AdapterRunState, BackendAdapter, BackendHandle, CancelHandle, CancelToken, ProgressSnapshot,
    StreamHandle,
};
pub use registry::BackendRegistry;
