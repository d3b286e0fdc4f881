//! Running per-plugin performance metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One measurement. Unset fields leave the running record untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub load_time_ms: Option<f64>,
    /// Duration of one execution.
    pub render_time_ms: Option<f64>,
    pub memory_mb: Option<f64>,
    pub network_requests: Option<u64>,
    /// Outcome of the execution the sample describes.
    pub failed: Option<bool>,
}

impl MetricsSample {
    pub fn load(duration_ms: f64) -> Self {
        Self {
            load_time_ms: Some(duration_ms),
            ..Self::default()
        }
    }

    pub fn execution(duration_ms: f64, failed: bool) -> Self {
        Self {
            render_time_ms: Some(duration_ms),
            failed: Some(failed),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginMetrics {
    pub plugin_id: String,
    /// Most recent load duration.
    pub load_time_ms: f64,
    /// Mean execution duration over all samples.
    pub render_time_ms: f64,
    pub memory_mb: f64,
    pub peak_memory_mb: f64,
    pub network_requests: u64,
    pub executions: u64,
    pub errors: u64,
    /// `errors / executions`.
    pub error_rate: f64,
    pub last_updated: DateTime<Utc>,
}

impl PluginMetrics {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            load_time_ms: 0.0,
            render_time_ms: 0.0,
            memory_mb: 0.0,
            peak_memory_mb: 0.0,
            network_requests: 0,
            executions: 0,
            errors: 0,
            error_rate: 0.0,
            last_updated: Utc::now(),
        }
    }

    pub fn merge(&mut self, sample: &MetricsSample) {
        if let Some(load) = sample.load_time_ms {
            self.load_time_ms = load;
        }
        if let Some(render) = sample.render_time_ms {
            let n = self.executions as f64;
            self.render_time_ms = (self.render_time_ms * n + render) / (n + 1.0);
            self.executions += 1;
        }
        if let Some(memory) = sample.memory_mb {
            self.memory_mb = memory;
            self.peak_memory_mb = self.peak_memory_mb.max(memory);
        }
        if let Some(requests) = sample.network_requests {
            self.network_requests += requests;
        }
        if sample.failed == Some(true) {
            self.errors += 1;
        }
        if self.executions > 0 {
            self.error_rate = self.errors as f64 / self.executions as f64;
        }
        self.last_updated = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_averages_and_counts() {
        let mut metrics = PluginMetrics::new("calc");
        metrics.merge(&MetricsSample::load(120.0));
        metrics.merge(&MetricsSample::execution(10.0, false));
        metrics.merge(&MetricsSample::execution(30.0, true));
        metrics.merge(&MetricsSample {
            memory_mb: Some(12.0),
            network_requests: Some(3),
            ..MetricsSample::default()
        });
        metrics.merge(&MetricsSample {
            memory_mb: Some(8.0),
            ..MetricsSample::default()
        });

        assert_eq!(metrics.load_time_ms, 120.0);
        assert_eq!(metrics.executions, 2);
        assert_eq!(metrics.render_time_ms, 20.0);
        assert_eq!(metrics.errors, 1);
        assert_eq!(metrics.error_rate, 0.5);
        assert_eq!(metrics.memory_mb, 8.0);
        assert_eq!(metrics.peak_memory_mb, 12.0);
        assert_eq!(metrics.network_requests, 3);
    }
}
