//! Central plugin lifecycle manager.
//!
//! Owns the dependency resolver, one sandbox per loaded instance and the
//! performance manager, drives the instance state machine and routes
//! recorded failures to the recovery policy.

use crate::config::RuntimeConfig;
use crate::error::PluginHostError;
use crate::events::{EventBus, RuntimeEvent};
use crate::health::PluginHealth;
use crate::instance::{BatchLoadReport, InstanceStatus, PluginInstance};
use crate::recovery::{RecoveryAction, RecoveryPolicy};
use crate::sandbox::{ErrorCallback, SandboxInfo, SandboxManager};
use crate::unit::{LifecycleHooks, OperationContext, PluginFailure, ResourceUsage, UnitOfWork};
use atrium_deps::{
    Compatibility, DependencyError, DependencyNode, DependencyResolver, RegistryInfo, Resolution,
    VersionUpdate,
};
use atrium_perf::{
    BackgroundTask, CacheStats, MetricsSample, PerfError, PerformanceManager, PluginMetrics,
    PoolStatus,
};
use atrium_types::{
    ErrorKind, InstanceId, PluginError, PluginManifest, PluginVersion, SandboxId,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything the host needs to run a plugin.
pub struct PluginDescriptor {
    pub manifest: PluginManifest,
    pub unit: Arc<dyn UnitOfWork>,
    pub hooks: Option<Arc<dyn LifecycleHooks>>,
    pub error_handler: Option<ErrorCallback>,
}

impl PluginDescriptor {
    pub fn new(manifest: PluginManifest, unit: Arc<dyn UnitOfWork>) -> Self {
        Self {
            manifest,
            unit,
            hooks: None,
            error_handler: None,
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    #[must_use]
    pub fn with_error_handler(mut self, handler: ErrorCallback) -> Self {
        self.error_handler = Some(handler);
        self
    }
}

struct Registration {
    unit: Arc<dyn UnitOfWork>,
    hooks: Option<Arc<dyn LifecycleHooks>>,
}

/// Maps resolver errors that have a host-level equivalent.
fn host_error(err: DependencyError) -> PluginHostError {
    match err {
        DependencyError::PluginNotFound(id) => PluginHostError::PluginNotFound(id),
        DependencyError::AlreadyRegistered(id) => PluginHostError::AlreadyRegistered(id),
        DependencyError::InvalidManifest(e) => PluginHostError::InvalidManifest(e),
        other => PluginHostError::Dependency(other),
    }
}

/// The plugin runtime. Build one per process with [`PluginManager::new`]
/// and tear it down with [`PluginManager::shutdown`].
pub struct PluginManager {
    config: RuntimeConfig,
    resolver: RwLock<DependencyResolver>,
    registrations: RwLock<HashMap<String, Registration>>,
    instances: tokio::sync::RwLock<HashMap<InstanceId, PluginInstance>>,
    sandboxes: Arc<SandboxManager>,
    perf: Arc<PerformanceManager>,
    recovery: RecoveryPolicy,
    events: EventBus,
    token: CancellationToken,
    closing: AtomicBool,
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl PluginManager {
    pub fn new(config: RuntimeConfig) -> Self {
        let token = CancellationToken::new();
        let perf = Arc::new(PerformanceManager::new(config.performance()));
        let sandboxes = Arc::new(SandboxManager::new(
            Arc::clone(&perf),
            &config.sandbox,
            &config.security,
            token.child_token(),
        ));
        Self {
            resolver: RwLock::new(DependencyResolver::new()),
            registrations: RwLock::new(HashMap::new()),
            instances: tokio::sync::RwLock::new(HashMap::new()),
            sandboxes,
            perf,
            recovery: RecoveryPolicy::new(config.recovery),
            events: EventBus::with_capacity(config.sandbox.event_capacity),
            token,
            closing: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), PluginHostError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(PluginHostError::ShuttingDown);
        }
        Ok(())
    }

    // ================================================================
    // Registration
    // ================================================================

    /// Validates and records a plugin, then installs its error handlers:
    /// the runtime's event fan-out first, the plugin's own handler second.
    pub fn register_plugin(&self, descriptor: PluginDescriptor) -> Result<(), PluginHostError> {
        self.ensure_open()?;
        let PluginDescriptor {
            manifest,
            unit,
            hooks,
            error_handler,
        } = descriptor;
        let plugin_id = manifest.id.clone();
        let version = manifest.version.clone();

        self.resolver
            .write()
            .register_plugin(manifest)
            .map_err(host_error)?;
        self.registrations
            .write()
            .insert(plugin_id.clone(), Registration { unit, hooks });

        let events = self.events.clone();
        self.sandboxes.register_error_handler(
            &plugin_id,
            Arc::new(move |error: &PluginError| {
                events.publish(RuntimeEvent::PluginError {
                    error: error.clone(),
                });
            }),
        );
        if let Some(handler) = error_handler {
            self.sandboxes.register_error_handler(&plugin_id, handler);
        }

        info!(plugin_id = %plugin_id, version = %version, "Plugin registered");
        self.events
            .publish(RuntimeEvent::PluginRegistered { plugin_id });
        Ok(())
    }

    /// Removes a plugin with no loaded instances and no registered
    /// dependents, along with its cached state and pending tasks.
    pub async fn unregister_plugin(&self, plugin_id: &str) -> Result<(), PluginHostError> {
        let loaded = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.plugin_id == plugin_id)
            .count();
        if loaded > 0 {
            return Err(PluginHostError::PluginInUse {
                plugin_id: plugin_id.to_string(),
                reason: format!("{loaded} instance(s) loaded"),
            });
        }

        {
            let mut resolver = self.resolver.write();
            let dependents = resolver.find_dependents(plugin_id);
            if !dependents.is_empty() {
                return Err(PluginHostError::PluginInUse {
                    plugin_id: plugin_id.to_string(),
                    reason: format!("required by {}", dependents.join(", ")),
                });
            }
            resolver.unregister_plugin(plugin_id).map_err(host_error)?;
        }

        self.registrations.write().remove(plugin_id);
        self.sandboxes.remove_error_handlers(plugin_id);
        self.perf.forget_plugin(plugin_id);
        info!(plugin_id = %plugin_id, "Plugin unregistered");
        self.events.publish(RuntimeEvent::PluginUnregistered {
            plugin_id: plugin_id.to_string(),
        });
        Ok(())
    }

    pub fn is_registered(&self, plugin_id: &str) -> bool {
        self.resolver.read().contains(plugin_id)
    }

    // ================================================================
    // Loading
    // ================================================================

    /// Resolves dependencies, creates a sandbox and an instance, and runs
    /// the plugin's `on_load` hook (at most once concurrently per plugin).
    ///
    /// Unresolved required dependencies and dependency cycles fail before
    /// any sandbox exists. A
    /// failing hook leaves the instance in `error`; the returned
    /// [`PluginHostError::InitializationFailed`] carries its id.
    pub async fn load_plugin(
        &self,
        plugin_id: &str,
        initial_data: Option<Value>,
    ) -> Result<InstanceId, PluginHostError> {
        self.ensure_open()?;
        self.resolve(plugin_id)?;
        self.spawn_instance(plugin_id, InstanceId::new(), initial_data, 0, 0)
            .await
    }

    fn resolve(&self, plugin_id: &str) -> Result<Resolution, PluginHostError> {
        let resolution = self
            .resolver
            .read()
            .resolve_dependencies(plugin_id)
            .map_err(host_error)?;
        for warning in &resolution.warnings {
            warn!(plugin_id = %plugin_id, "{}", warning);
        }
        Ok(resolution)
    }

    async fn spawn_instance(
        &self,
        plugin_id: &str,
        instance_id: InstanceId,
        initial_data: Option<Value>,
        error_count: u32,
        restart_count: u32,
    ) -> Result<InstanceId, PluginHostError> {
        let (limits, permissions) = {
            let resolver = self.resolver.read();
            let manifest = resolver
                .manifest(plugin_id)
                .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?;
            (manifest.resource_limits, manifest.permissions.clone())
        };
        let hooks = self
            .registrations
            .read()
            .get(plugin_id)
            .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?
            .hooks
            .clone();

        let sandbox_id = self
            .sandboxes
            .create_sandbox(plugin_id, limits, &permissions)
            .await?;

        let mut instance =
            PluginInstance::new(instance_id, plugin_id, sandbox_id, initial_data.clone());
        instance.error_count = error_count;
        instance.restart_count = restart_count;
        self.instances.write().await.insert(instance_id, instance);

        let started = Instant::now();
        let loaded = match hooks {
            Some(hooks) => {
                let sandboxes = Arc::clone(&self.sandboxes);
                self.perf
                    .lazy_load_plugin(plugin_id, move || async move {
                        sandboxes
                            .run(
                                sandbox_id,
                                move |ctx| async move { hooks.on_load(ctx, initial_data).await },
                                None,
                            )
                            .await
                            .map(|()| Value::Null)
                            .map_err(|failure| failure.into_message())
                    })
                    .await
                    .map(|_| ())
            }
            None => Ok(()),
        };

        match loaded {
            Ok(()) => {
                self.sandboxes.activate(sandbox_id)?;
                self.set_status(instance_id, InstanceStatus::Running).await;
                self.perf.update_metrics(
                    plugin_id,
                    MetricsSample::load(started.elapsed().as_secs_f64() * 1000.0),
                );
                info!(plugin_id = %plugin_id, instance_id = %instance_id, sandbox_id = %sandbox_id, "Plugin loaded");
                self.events.publish(RuntimeEvent::InstanceLoaded {
                    plugin_id: plugin_id.to_string(),
                    instance_id,
                });
                Ok(instance_id)
            }
            Err(err) => {
                let message = match err {
                    PerfError::LoadFailed { message, .. } => message,
                    other => other.to_string(),
                };
                self.sandboxes.record_failure(
                    sandbox_id,
                    PluginError::new(
                        plugin_id,
                        ErrorKind::Runtime,
                        format!("on_load failed: {message}"),
                        true,
                    ),
                );
                if let Some(instance) = self.instances.write().await.get_mut(&instance_id) {
                    instance.error_count += 1;
                }
                self.set_status(instance_id, InstanceStatus::Error).await;
                Err(PluginHostError::InitializationFailed {
                    plugin_id: plugin_id.to_string(),
                    instance_id,
                    message,
                })
            }
        }
    }

    /// Topological order of `plugin_ids` over their required dependencies,
    /// with each substituted dependency replaced by its fallback.
    pub fn get_load_order(&self, plugin_ids: &[String]) -> Result<Vec<String>, PluginHostError> {
        self.resolver
            .read()
            .get_load_order(plugin_ids)
            .map_err(host_error)
    }

    /// Loads `plugin_ids` in dependency order. A plugin whose resolved
    /// dependencies include a failed or skipped plugin is skipped.
    pub async fn load_plugins_in_order(
        &self,
        plugin_ids: &[String],
    ) -> Result<BatchLoadReport, PluginHostError> {
        let order = self.get_load_order(plugin_ids)?;
        let mut report = BatchLoadReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for plugin_id in order {
            let resolution = self.resolver.read().resolve_dependencies(&plugin_id);
            let blocker = match resolution {
                Ok(resolution) => resolution
                    .resolved
                    .into_iter()
                    .find(|dep| blocked.contains(dep)),
                Err(e) => {
                    warn!(plugin_id = %plugin_id, error = %e, "Plugin dependencies unresolved");
                    report.failed.push((plugin_id.clone(), e.to_string()));
                    blocked.insert(plugin_id);
                    continue;
                }
            };
            if let Some(dep) = blocker {
                warn!(plugin_id = %plugin_id, dependency = %dep, "Skipping plugin, dependency failed to load");
                report.skipped.push(plugin_id.clone());
                blocked.insert(plugin_id);
                continue;
            }

            match self.load_plugin(&plugin_id, None).await {
                Ok(instance_id) => report.loaded.push((plugin_id, instance_id)),
                Err(e) => {
                    report.failed.push((plugin_id.clone(), e.to_string()));
                    blocked.insert(plugin_id);
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Batch load complete"
        );
        Ok(report)
    }

    // ================================================================
    // Execution
    // ================================================================

    /// Runs `operation` in the instance's sandbox. Only `running` instances
    /// accept work. A plugin failure counts against the instance and is
    /// handed to the recovery policy before the error is returned.
    pub async fn execute_plugin<T, F, Fut>(
        &self,
        instance_id: InstanceId,
        operation: F,
        timeout: Option<Duration>,
    ) -> Result<T, PluginHostError>
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = Result<T, PluginFailure>>,
    {
        let (plugin_id, sandbox_id) = {
            let instances = self.instances.read().await;
            let instance = instances
                .get(&instance_id)
                .ok_or(PluginHostError::InstanceNotFound(instance_id))?;
            if instance.status != InstanceStatus::Running {
                return Err(PluginHostError::InvalidInstanceState {
                    instance_id,
                    status: instance.status,
                    expected: InstanceStatus::Running,
                });
            }
            (instance.plugin_id.clone(), instance.sandbox_id)
        };

        let before = self.sandbox_usage(sandbox_id);
        let started = Instant::now();
        let result = self
            .sandboxes
            .execute_in_sandbox(sandbox_id, operation, timeout)
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let after = self.sandbox_usage(sandbox_id);

        self.perf.update_metrics(
            &plugin_id,
            MetricsSample {
                memory_mb: after.map(|u| u.memory_mb as f64),
                network_requests: after.map(|u| {
                    u.network_requests
                        .saturating_sub(before.map_or(0, |b| b.network_requests))
                }),
                ..MetricsSample::execution(elapsed_ms, result.is_err())
            },
        );

        match result.as_ref().err().and_then(PluginHostError::failure_kind) {
            Some((kind, recoverable)) => self.handle_failure(instance_id, kind, recoverable).await,
            None => {
                if let Some(instance) = self.instances.write().await.get_mut(&instance_id) {
                    instance.touch();
                }
            }
        }
        result
    }

    /// Forwards `request` to the plugin's unit of work.
    pub async fn invoke_plugin(
        &self,
        instance_id: InstanceId,
        request: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, PluginHostError> {
        let plugin_id = self
            .instances
            .read()
            .await
            .get(&instance_id)
            .map(|i| i.plugin_id.clone())
            .ok_or(PluginHostError::InstanceNotFound(instance_id))?;
        let unit = self
            .registrations
            .read()
            .get(&plugin_id)
            .map(|r| Arc::clone(&r.unit))
            .ok_or(PluginHostError::PluginNotFound(plugin_id))?;

        self.execute_plugin(
            instance_id,
            move |ctx| async move { unit.handle(ctx, request).await },
            timeout,
        )
        .await
    }

    fn sandbox_usage(&self, sandbox_id: SandboxId) -> Option<ResourceUsage> {
        self.sandboxes
            .get_sandbox_info(sandbox_id)
            .map(|info| info.resource_usage)
    }

    async fn handle_failure(&self, instance_id: InstanceId, kind: ErrorKind, recoverable: bool) {
        let (plugin_id, error_count, restart_count) = {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(&instance_id) else {
                return;
            };
            instance.error_count += 1;
            (
                instance.plugin_id.clone(),
                instance.error_count,
                instance.restart_count,
            )
        };
        self.set_status(instance_id, InstanceStatus::Error).await;

        let action = self
            .recovery
            .decide(kind, recoverable, error_count, restart_count);
        info!(
            plugin_id = %plugin_id,
            instance_id = %instance_id,
            kind = %kind,
            error_count,
            restart_count,
            action = %action,
            "Applying recovery"
        );
        self.events.publish(RuntimeEvent::RecoveryApplied {
            plugin_id: plugin_id.clone(),
            instance_id,
            action,
        });

        let outcome = match action {
            RecoveryAction::PauseAll => {
                self.pause_all(&plugin_id).await;
                Ok(())
            }
            RecoveryAction::Restart => self.restart_plugin(instance_id).await.map(|_| ()),
            RecoveryAction::Unload => self.unload_plugin(instance_id).await,
            RecoveryAction::UnloadAll => {
                self.unload_all(&plugin_id).await;
                Ok(())
            }
        };
        if let Err(e) = outcome {
            warn!(plugin_id = %plugin_id, instance_id = %instance_id, action = %action, error = %e, "Recovery failed");
        }
    }

    // ================================================================
    // Lifecycle
    // ================================================================

    async fn set_status(&self, instance_id: InstanceId, to: InstanceStatus) {
        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(&instance_id) else {
            return;
        };
        let from = instance.status;
        instance.status = to;
        instance.touch();
        drop(instances);
        if from != to {
            debug!(instance_id = %instance_id, from = %from, to = %to, "Instance transition");
            self.events
                .publish(RuntimeEvent::InstanceStatusChanged {
                    instance_id,
                    from,
                    to,
                });
        }
    }

    /// Pauses a `running` (or failed) instance and its sandbox.
    pub async fn pause_plugin(&self, instance_id: InstanceId) -> Result<(), PluginHostError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&instance_id)
            .ok_or(PluginHostError::InstanceNotFound(instance_id))?;
        let from = instance.status;
        if !matches!(from, InstanceStatus::Running | InstanceStatus::Error) {
            return Err(PluginHostError::InvalidInstanceState {
                instance_id,
                status: from,
                expected: InstanceStatus::Running,
            });
        }
        self.sandboxes.pause_sandbox(instance.sandbox_id)?;
        instance.status = InstanceStatus::Paused;
        instance.touch();
        drop(instances);

        info!(instance_id = %instance_id, "Plugin paused");
        self.events.publish(RuntimeEvent::InstanceStatusChanged {
            instance_id,
            from,
            to: InstanceStatus::Paused,
        });
        Ok(())
    }

    pub async fn resume_plugin(&self, instance_id: InstanceId) -> Result<(), PluginHostError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&instance_id)
            .ok_or(PluginHostError::InstanceNotFound(instance_id))?;
        if instance.status != InstanceStatus::Paused {
            return Err(PluginHostError::InvalidInstanceState {
                instance_id,
                status: instance.status,
                expected: InstanceStatus::Paused,
            });
        }
        self.sandboxes.resume_sandbox(instance.sandbox_id)?;
        instance.status = InstanceStatus::Running;
        instance.touch();
        drop(instances);

        info!(instance_id = %instance_id, "Plugin resumed");
        self.events.publish(RuntimeEvent::InstanceStatusChanged {
            instance_id,
            from: InstanceStatus::Paused,
            to: InstanceStatus::Running,
        });
        Ok(())
    }

    async fn pause_all(&self, plugin_id: &str) {
        let targets: Vec<InstanceId> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| {
                i.plugin_id == plugin_id
                    && matches!(i.status, InstanceStatus::Running | InstanceStatus::Error)
            })
            .map(|i| i.id)
            .collect();
        for instance_id in targets {
            if let Err(e) = self.pause_plugin(instance_id).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to pause instance");
            }
        }
    }

    async fn unload_all(&self, plugin_id: &str) {
        let targets: Vec<InstanceId> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.plugin_id == plugin_id)
            .map(|i| i.id)
            .collect();
        for instance_id in targets {
            if let Err(e) = self.unload_plugin(instance_id).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to unload instance");
            }
        }
    }

    /// Runs `on_unload` (failures are logged), then always terminates the
    /// sandbox and removes the instance. Unloading the plugin's last
    /// instance also drops its memoized load and pending tasks.
    pub async fn unload_plugin(&self, instance_id: InstanceId) -> Result<(), PluginHostError> {
        let (plugin_id, sandbox_id, from) = {
            let mut instances = self.instances.write().await;
            let instance = instances
                .get_mut(&instance_id)
                .ok_or(PluginHostError::InstanceNotFound(instance_id))?;
            if instance.status == InstanceStatus::Terminated {
                debug!(instance_id = %instance_id, "Instance already unloading");
                return Ok(());
            }
            let from = instance.status;
            instance.status = InstanceStatus::Terminated;
            (instance.plugin_id.clone(), instance.sandbox_id, from)
        };
        self.events.publish(RuntimeEvent::InstanceStatusChanged {
            instance_id,
            from,
            to: InstanceStatus::Terminated,
        });

        let hooks = self
            .registrations
            .read()
            .get(&plugin_id)
            .and_then(|r| r.hooks.clone());
        if let Some(hooks) = hooks {
            let unloaded = self
                .sandboxes
                .run(
                    sandbox_id,
                    move |ctx| async move { hooks.on_unload(ctx).await },
                    None,
                )
                .await;
            if let Err(failure) = unloaded {
                warn!(
                    plugin_id = %plugin_id,
                    instance_id = %instance_id,
                    "on_unload failed, terminating anyway: {}",
                    failure.into_message()
                );
            }
        }

        self.sandboxes.terminate_sandbox(sandbox_id);
        let last = {
            let mut instances = self.instances.write().await;
            instances.remove(&instance_id);
            !instances.values().any(|i| i.plugin_id == plugin_id)
        };
        if last {
            self.perf.evict_lazy_load(&plugin_id);
            let cancelled = self.perf.cancel_plugin_tasks(&plugin_id);
            if cancelled > 0 {
                debug!(plugin_id = %plugin_id, cancelled, "Cancelled pending tasks");
            }
        }

        info!(plugin_id = %plugin_id, instance_id = %instance_id, "Plugin unloaded");
        self.events.publish(RuntimeEvent::InstanceUnloaded {
            plugin_id,
            instance_id,
        });
        Ok(())
    }

    /// Unloads the instance and loads the same plugin again under the same
    /// instance id, keeping its error count and bumping its restart count.
    pub async fn restart_plugin(
        &self,
        instance_id: InstanceId,
    ) -> Result<InstanceId, PluginHostError> {
        self.ensure_open()?;
        let (plugin_id, initial_data, error_count, restart_count) = {
            let instances = self.instances.read().await;
            let instance = instances
                .get(&instance_id)
                .ok_or(PluginHostError::InstanceNotFound(instance_id))?;
            (
                instance.plugin_id.clone(),
                instance.initial_data.clone(),
                instance.error_count,
                instance.restart_count,
            )
        };

        self.unload_plugin(instance_id).await?;
        self.resolve(&plugin_id)?;
        let restart_count = restart_count + 1;
        self.spawn_instance(&plugin_id, instance_id, initial_data, error_count, restart_count)
            .await?;

        info!(plugin_id = %plugin_id, instance_id = %instance_id, restart_count, "Plugin restarted");
        self.events.publish(RuntimeEvent::InstanceRestarted {
            instance_id,
            restart_count,
        });
        Ok(instance_id)
    }

    /// Unloads every instance and cancels the runtime token. Later
    /// registrations and loads fail with [`PluginHostError::ShuttingDown`].
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids: Vec<InstanceId> = self.instances.read().await.keys().copied().collect();
        info!(instances = ids.len(), "Shutting down plugin runtime");
        for instance_id in ids {
            if let Err(e) = self.unload_plugin(instance_id).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to unload during shutdown");
            }
        }
        self.token.cancel();
    }

    // ================================================================
    // Observability
    // ================================================================

    /// Aggregates the plugin's instances into a health classification.
    pub async fn get_plugin_health(&self, plugin_id: &str) -> Result<PluginHealth, PluginHostError> {
        if !self.is_registered(plugin_id) {
            return Err(PluginHostError::PluginNotFound(plugin_id.to_string()));
        }

        let instances = self.instances_of(plugin_id).await;
        let running = instances.iter().filter(|i| i.is_running()).count();
        let errors: u64 = instances.iter().map(|i| u64::from(i.error_count)).sum();
        let restarts: u64 = instances.iter().map(|i| u64::from(i.restart_count)).sum();
        let resource_usage = instances
            .iter()
            .filter_map(|i| self.sandbox_usage(i.sandbox_id))
            .fold(ResourceUsage::default(), |acc, usage| acc + usage);

        Ok(PluginHealth {
            plugin_id: plugin_id.to_string(),
            status: self.config.health.classify(errors, restarts, running),
            instances: instances.len(),
            running,
            errors,
            restarts,
            resource_usage,
        })
    }

    /// Adds an error handler for `plugin_id`, invoked in failure order.
    pub fn on_plugin_error(&self, plugin_id: &str, callback: ErrorCallback) {
        self.sandboxes.register_error_handler(plugin_id, callback);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Arc<RuntimeEvent>> {
        self.events.subscribe()
    }

    pub async fn get_instance(&self, instance_id: InstanceId) -> Option<PluginInstance> {
        self.instances.read().await.get(&instance_id).cloned()
    }

    /// All instances, oldest first.
    pub async fn list_instances(&self) -> Vec<PluginInstance> {
        let mut instances: Vec<PluginInstance> =
            self.instances.read().await.values().cloned().collect();
        instances.sort_by_key(|i| i.start_time);
        instances
    }

    async fn instances_of(&self, plugin_id: &str) -> Vec<PluginInstance> {
        self.instances
            .read()
            .await
            .values()
            .filter(|i| i.plugin_id == plugin_id)
            .cloned()
            .collect()
    }

    pub async fn get_instance_sandbox(&self, instance_id: InstanceId) -> Option<SandboxInfo> {
        let sandbox_id = self.instances.read().await.get(&instance_id)?.sandbox_id;
        self.sandboxes.get_sandbox_info(sandbox_id)
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    pub fn performance(&self) -> &PerformanceManager {
        &self.perf
    }

    pub fn get_metrics(&self, plugin_id: &str) -> Option<PluginMetrics> {
        self.perf.get_metrics(plugin_id)
    }

    pub fn get_resource_pool_status(&self) -> Vec<PoolStatus> {
        self.perf.get_resource_pool_status()
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.perf.get_cache_stats()
    }

    pub fn get_background_tasks(&self) -> Vec<BackgroundTask> {
        self.perf.get_background_tasks()
    }

    // ================================================================
    // Dependency queries
    // ================================================================

    pub fn check_dependencies(&self, plugin_id: &str) -> Result<Compatibility, PluginHostError> {
        self.resolver
            .read()
            .check_dependencies(plugin_id)
            .map_err(host_error)
    }

    pub fn get_dependency_tree(&self, plugin_id: &str) -> Result<DependencyNode, PluginHostError> {
        self.resolver
            .read()
            .get_dependency_tree(plugin_id)
            .map_err(host_error)
    }

    pub fn get_dependency_registry_info(&self) -> RegistryInfo {
        self.resolver.read().get_registry_info()
    }

    /// Installs a new version and reports dependents it breaks. Loaded
    /// instances keep running; the new version applies to later loads.
    pub fn update_plugin_version(
        &self,
        plugin_id: &str,
        version: PluginVersion,
    ) -> Result<VersionUpdate, PluginHostError> {
        self.resolver
            .write()
            .update_plugin_version(plugin_id, version)
            .map_err(host_error)
    }
}
