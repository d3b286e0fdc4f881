//! Cross-cutting resource accounting for the Atrium plugin runtime.
//!
//! The [`PerformanceManager`] bundles:
//! - bounded [`ResourcePool`]s (memory, cpu, network, storage) with FIFO
//!   backpressure for sandboxes waiting on capacity,
//! - a TTL [`PluginCache`] namespaced per plugin,
//! - a single-drain [`TaskScheduler`] for prioritised background work,
//! - [`LazyLoader`] memoization so a plugin's initialization runs once,
//! - per-plugin [`PluginMetrics`].
//!
//! Every piece of shared state sits behind a short synchronous lock that is
//! never held across an `.await`.

mod cache;
mod config;
mod error;
mod lazy;
mod manager;
mod metrics;
mod pool;
mod tasks;

pub use cache::{CacheStats, PluginCache};
pub use config::{CacheConfig, PerformanceConfig, PoolConfig};
pub use error::PerfError;
pub use lazy::LazyLoader;
pub use manager::PerformanceManager;
pub use metrics::{MetricsSample, PluginMetrics};
pub use pool::{PoolStatus, ResourceKind, ResourcePool, ResourcePools};
pub use tasks::{
    BackgroundTask, TaskJob, TaskPriority, TaskProgress, TaskScheduler, TaskSpec, TaskStatus,
};

/// Result type for performance-manager operations.
pub type Result<T> = std::result::Result<T, PerfError>;
