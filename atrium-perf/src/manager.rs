//! The [`PerformanceManager`] facade.

use crate::{
    BackgroundTask, CacheStats, LazyLoader, MetricsSample, PerformanceConfig, PluginCache,
    PluginMetrics, PoolStatus, ResourcePools, Result, TaskJob, TaskScheduler, TaskSpec,
};
use atrium_types::{ResourceLimits, SandboxId, TaskId};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Resource pools, cache, scheduler, lazy loads and metrics for one runtime.
pub struct PerformanceManager {
    config: PerformanceConfig,
    pools: ResourcePools,
    cache: PluginCache,
    scheduler: TaskScheduler,
    lazy: LazyLoader,
    metrics: Mutex<HashMap<String, PluginMetrics>>,
}

impl Default for PerformanceManager {
    fn default() -> Self {
        Self::new(PerformanceConfig::default())
    }
}

impl PerformanceManager {
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            pools: ResourcePools::new(&config.pools),
            cache: PluginCache::new(&config.cache),
            scheduler: TaskScheduler::new(),
            lazy: LazyLoader::new(),
            metrics: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &PerformanceConfig {
        &self.config
    }

    // ── Lazy loading ────────────────────────────────────────────

    /// Runs `loader` at most once concurrently per plugin id.
    pub async fn lazy_load_plugin<F, Fut>(&self, plugin_id: &str, loader: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        self.lazy.load(plugin_id, loader).await
    }

    pub fn evict_lazy_load(&self, plugin_id: &str) -> bool {
        self.lazy.evict(plugin_id)
    }

    // ── Resource pools ──────────────────────────────────────────

    /// Reserves a sandbox's ceilings, waiting up to `timeout` for capacity.
    pub async fn reserve_resources(
        &self,
        sandbox_id: SandboxId,
        limits: &ResourceLimits,
        timeout: Duration,
    ) -> Result<()> {
        self.pools.reserve(sandbox_id, limits, timeout).await
    }

    pub fn release_resources(&self, sandbox_id: SandboxId) {
        self.pools.release(sandbox_id);
        debug!(sandbox_id = %sandbox_id, "Sandbox resources released");
    }

    pub fn pools(&self) -> &ResourcePools {
        &self.pools
    }

    pub fn get_resource_pool_status(&self) -> Vec<PoolStatus> {
        self.pools.status()
    }

    // ── Cache ───────────────────────────────────────────────────

    pub fn cache(&self) -> &PluginCache {
        &self.cache
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_plugin_cache(&self, plugin_id: &str) -> usize {
        self.cache.clear_plugin_cache(plugin_id)
    }

    // ── Background tasks ────────────────────────────────────────

    pub fn schedule_background_task(&self, spec: TaskSpec, job: TaskJob) -> Result<TaskId> {
        self.scheduler.schedule(spec, job)
    }

    pub fn get_background_tasks(&self) -> Vec<BackgroundTask> {
        self.scheduler.tasks()
    }

    pub fn cancel_plugin_tasks(&self, plugin_id: &str) -> usize {
        self.scheduler.cancel_plugin_tasks(plugin_id)
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    // ── Metrics ─────────────────────────────────────────────────

    pub fn update_metrics(&self, plugin_id: &str, sample: MetricsSample) {
        self.metrics
            .lock()
            .entry(plugin_id.to_string())
            .or_insert_with(|| PluginMetrics::new(plugin_id))
            .merge(&sample);
    }

    pub fn get_metrics(&self, plugin_id: &str) -> Option<PluginMetrics> {
        self.metrics.lock().get(plugin_id).cloned()
    }

    /// Drops the per-plugin state kept for `plugin_id`: its memoized load,
    /// cached values and pending background tasks. Metrics are kept.
    pub fn forget_plugin(&self, plugin_id: &str) {
        self.evict_lazy_load(plugin_id);
        self.clear_plugin_cache(plugin_id);
        self.cancel_plugin_tasks(plugin_id);
    }
}
