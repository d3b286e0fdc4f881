//! What plugin code sees: the unit-of-work and lifecycle traits, the
//! per-operation context, and the failure type plugin code returns.

use crate::permissions::{Denial, PermissionSet};
use atrium_perf::PerformanceManager;
use atrium_types::{ErrorKind, Permission, ResourceLimits, SandboxId};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A failure raised by plugin code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} failure: {message}")]
pub struct PluginFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub stack: Option<String>,
    pub recoverable: bool,
}

impl PluginFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
            recoverable,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message, true)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message, true)
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Security, message, false)
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    #[must_use]
    pub fn unrecoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

impl From<anyhow::Error> for PluginFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::runtime(err.to_string()).with_stack(format!("{err:?}"))
    }
}

/// Usage counters shared by every operation of one sandbox.
#[derive(Debug, Default)]
pub struct UsageMeter {
    memory_mb: AtomicU64,
    cpu_percent: AtomicU64,
    network_requests: AtomicU64,
}

/// Snapshot of a sandbox's resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub memory_mb: u64,
    pub cpu_percent: u64,
    pub network_requests: u64,
    pub execution_time_ms: u64,
}

impl UsageMeter {
    pub fn snapshot(&self, execution_time_ms: u64) -> ResourceUsage {
        ResourceUsage {
            memory_mb: self.memory_mb.load(Ordering::Relaxed),
            cpu_percent: self.cpu_percent.load(Ordering::Relaxed),
            network_requests: self.network_requests.load(Ordering::Relaxed),
            execution_time_ms,
        }
    }
}

impl std::ops::Add for ResourceUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            memory_mb: self.memory_mb + rhs.memory_mb,
            cpu_percent: self.cpu_percent + rhs.cpu_percent,
            network_requests: self.network_requests + rhs.network_requests,
            execution_time_ms: self.execution_time_ms + rhs.execution_time_ms,
        }
    }
}

/// Handed to every operation run inside a sandbox.
///
/// Carries the operation's cancellation token, which fires when the
/// operation times out or the sandbox is terminated, plus the capability
/// and metering checks that turn misuse into `security` or `resource`
/// failures. Cached values are scoped to the plugin, so every instance of
/// a plugin shares them and no other plugin sees them.
#[derive(Clone)]
pub struct OperationContext {
    plugin_id: Arc<str>,
    sandbox_id: SandboxId,
    token: CancellationToken,
    permissions: Arc<PermissionSet>,
    limits: ResourceLimits,
    usage: Arc<UsageMeter>,
    perf: Arc<PerformanceManager>,
}

impl OperationContext {
    pub(crate) fn new(
        plugin_id: Arc<str>,
        sandbox_id: SandboxId,
        token: CancellationToken,
        permissions: Arc<PermissionSet>,
        limits: ResourceLimits,
        usage: Arc<UsageMeter>,
        perf: Arc<PerformanceManager>,
    ) -> Self {
        Self {
            plugin_id,
            sandbox_id,
            token,
            permissions,
            limits,
            usage,
            perf,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn sandbox_id(&self) -> SandboxId {
        self.sandbox_id
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the operation is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Fails with a `security` failure unless `permission` is granted.
    pub fn require(&self, permission: Permission) -> Result<(), PluginFailure> {
        match self.permissions.check(permission) {
            Ok(()) => Ok(()),
            Err(Denial::NotGranted) => Err(PluginFailure::security(format!(
                "plugin '{}' lacks '{}' permission",
                self.plugin_id,
                permission.name()
            ))),
            Err(Denial::DeniedByPolicy) => Err(PluginFailure::security(format!(
                "'{}' permission denied by policy for plugin '{}'",
                permission.name(),
                self.plugin_id
            ))),
        }
    }

    /// Counts one outbound request against the sandbox's network budget.
    pub fn record_network_request(&self) -> Result<(), PluginFailure> {
        self.require(Permission::Network)?;
        let used = self.usage.network_requests.fetch_add(1, Ordering::Relaxed) + 1;
        if used > self.limits.max_network_requests {
            self.usage.network_requests.fetch_sub(1, Ordering::Relaxed);
            return Err(PluginFailure::resource(format!(
                "network request limit of {} reached",
                self.limits.max_network_requests
            )));
        }
        Ok(())
    }

    /// Claims `mb` of the sandbox's memory ceiling.
    pub fn allocate_memory(&self, mb: u64) -> Result<(), PluginFailure> {
        let max = self.limits.max_memory_mb;
        self.usage
            .memory_mb
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(mb).filter(|total| *total <= max)
            })
            .map(|_| ())
            .map_err(|current| {
                PluginFailure::resource(format!(
                    "allocating {mb}MB would exceed the {max}MB limit ({current}MB in use)"
                ))
            })
    }

    pub fn release_memory(&self, mb: u64) {
        let _ = self
            .usage
            .memory_mb
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(mb))
            });
    }

    /// Looks up `key` in this plugin's result cache.
    pub fn cache_get(&self, key: &str) -> Option<Value> {
        self.perf.cache().get(&self.plugin_id, key)
    }

    /// Caches `value` under `key` for this plugin with the configured TTL.
    pub fn cache_set(&self, key: &str, value: Value) {
        self.perf.cache().set(&self.plugin_id, key, value);
    }

    /// Reports the operation's CPU share; above the ceiling it fails.
    pub fn report_cpu(&self, percent: u64) -> Result<(), PluginFailure> {
        self.usage.cpu_percent.store(percent, Ordering::Relaxed);
        if percent > self.limits.max_cpu_percent {
            return Err(PluginFailure::resource(format!(
                "cpu usage {percent}% exceeds the {}% limit",
                self.limits.max_cpu_percent
            )));
        }
        Ok(())
    }
}

/// The capability a plugin exposes to the host. The runtime never
/// inspects it; it only forwards requests.
pub trait UnitOfWork: Send + Sync {
    fn handle(
        &self,
        ctx: OperationContext,
        request: Value,
    ) -> BoxFuture<'_, Result<Value, PluginFailure>>;
}

/// Optional load and unload hooks. Both default to no-ops.
pub trait LifecycleHooks: Send + Sync {
    fn on_load(
        &self,
        _ctx: OperationContext,
        _initial_data: Option<Value>,
    ) -> BoxFuture<'_, Result<(), PluginFailure>> {
        Box::pin(async { Ok(()) })
    }

    fn on_unload(&self, _ctx: OperationContext) -> BoxFuture<'_, Result<(), PluginFailure>> {
        Box::pin(async { Ok(()) })
    }
}
