//! Error types for the performance manager.

use crate::ResourceKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PerfError {
    #[error("{kind} request of {requested} exceeds pool capacity {capacity}")]
    CapacityExceeded {
        kind: ResourceKind,
        requested: u64,
        capacity: u64,
    },

    #[error("timed out waiting for {requested} {kind}")]
    AllocationTimeout { kind: ResourceKind, requested: u64 },

    #[error("lazy load of '{plugin_id}' failed: {message}")]
    LoadFailed { plugin_id: String, message: String },

    #[error("background scheduler requires a running tokio runtime")]
    NoRuntime,
}
