//! Per-plugin health classification.

use crate::config::HealthConfig;
use crate::unit::ResourceUsage;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginHealth {
    pub plugin_id: String,
    pub status: HealthStatus,
    pub instances: usize,
    pub running: usize,
    /// Sum of the instances' error counts.
    pub errors: u64,
    /// Sum of the instances' restart counts.
    pub restarts: u64,
    /// Sum over the instances' sandboxes.
    pub resource_usage: ResourceUsage,
}

impl HealthConfig {
    pub fn classify(&self, errors: u64, restarts: u64, running: usize) -> HealthStatus {
        if errors > self.unhealthy_errors || restarts > self.unhealthy_restarts || running == 0 {
            HealthStatus::Unhealthy
        } else if errors > self.degraded_errors || restarts > self.degraded_restarts {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds() {
        let config = HealthConfig::default();
        assert_eq!(config.classify(11, 0, 1), HealthStatus::Unhealthy);
        assert_eq!(config.classify(10, 0, 1), HealthStatus::Degraded);
        assert_eq!(config.classify(4, 0, 1), HealthStatus::Degraded);
        assert_eq!(config.classify(3, 2, 1), HealthStatus::Healthy);
        assert_eq!(config.classify(0, 3, 1), HealthStatus::Degraded);
        assert_eq!(config.classify(0, 6, 1), HealthStatus::Unhealthy);
        assert_eq!(config.classify(0, 0, 0), HealthStatus::Unhealthy);
    }
}
