//! Runtime configuration, read from a TOML file such as `atrium.toml`.
//!
//! Every section and field is optional; anything left out keeps its
//! default. A missing file means defaults. An unreadable or malformed file
//! is logged and also falls back to defaults, so a bad config never stops
//! the runtime from starting.

use crate::error::PluginHostError;
use atrium_perf::{CacheConfig, PerformanceConfig, PoolConfig};
use atrium_types::Permission;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Restart and unload thresholds used by the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Runtime failures restart the instance while its error count is below this.
    pub max_errors: u32,
    /// Runtime failures restart the instance while its restart count is below this.
    pub max_restarts: u32,
    /// Timeouts restart the instance while its restart count is below this.
    pub max_timeout_restarts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_errors: 5,
            max_restarts: 3,
            max_timeout_restarts: 3,
        }
    }
}

/// Health classification thresholds. Counts strictly above a limit trip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub unhealthy_errors: u64,
    pub unhealthy_restarts: u64,
    pub degraded_errors: u64,
    pub degraded_restarts: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            unhealthy_errors: 10,
            unhealthy_restarts: 5,
            degraded_errors: 3,
            degraded_restarts: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Size of each sandbox's error ring.
    pub error_history: usize,
    /// Capacity of the runtime event channel.
    pub event_capacity: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            error_history: 50,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Permissions no plugin receives, whatever its manifest declares.
    pub denied_permissions: HashSet<Permission>,
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub recovery: RecoveryConfig,
    pub health: HealthConfig,
    pub sandbox: SandboxConfig,
    pub pools: PoolConfig,
    pub cache: CacheConfig,
    pub security: SecurityConfig,
}

impl RuntimeConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, PluginHostError> {
        Ok(toml::from_str(contents)?)
    }

    /// Loads configuration from `path`, falling back to defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("No runtime config found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(config) => {
                    info!("Loaded runtime config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!(
                        "Failed to parse runtime config {:?}: {}. Falling back to defaults.",
                        path, e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read runtime config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// The slice of configuration owned by the performance manager.
    pub fn performance(&self) -> PerformanceConfig {
        PerformanceConfig {
            pools: self.pools,
            cache: self.cache,
        }
    }
}
