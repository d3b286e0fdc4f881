//! Tunables for pools and cache. Deserialized from the `[pools]` and
//! `[cache]` sections of the runtime configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capacity of each shared resource pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub memory_mb: u64,
    pub cpu_percent: u64,
    pub network_requests: u64,
    pub storage_kb: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            cpu_percent: 100,
            network_requests: 1000,
            storage_kb: 10 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default time-to-live of a cache entry.
    pub ttl_ms: u64,
    /// Oldest entries are evicted beyond this size.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5 * 60 * 1000,
            max_entries: 1000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub pools: PoolConfig,
    pub cache: CacheConfig,
}
