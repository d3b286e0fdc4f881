//! Sandboxes: the execution units plugin code runs in.
//!
//! Each sandbox owns:
//! - a lifecycle status (`initializing → running ⇄ paused`, `→ error`,
//!   `→ terminated`)
//! - its resource ceilings, reserved in the shared pools for its lifetime
//! - a usage meter fed through [`OperationContext`]
//! - a bounded ring of recorded [`PluginError`]s
//! - a cancellation token, parent of every operation's token
//!
//! Isolation is in-process: operations are futures raced against a
//! deadline, with panics caught at the sandbox boundary.

use crate::config::{SandboxConfig, SecurityConfig};
use crate::error::PluginHostError;
use crate::permissions::PermissionSet;
use crate::unit::{OperationContext, PluginFailure, ResourceUsage, UsageMeter};
use atrium_perf::PerformanceManager;
use atrium_types::{ErrorKind, Permission, PluginError, ResourceLimits, SandboxId};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Initializing,
    Running,
    Paused,
    Error,
    Terminated,
}

impl SandboxStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    /// Staying in the same non-terminal state is allowed.
    pub fn can_transition_to(self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (from, to) if from == to => true,
            (Initializing, Running | Error) => true,
            (Running, Paused | Error) => true,
            (Paused, Running | Error) => true,
            (Error, Running | Paused) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Error => write!(f, "error"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Callback notified of every error recorded for a plugin.
pub type ErrorCallback = Arc<dyn Fn(&PluginError) + Send + Sync>;

/// Read-only view of a sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxInfo {
    pub id: SandboxId,
    pub plugin_id: String,
    pub status: SandboxStatus,
    pub resource_limits: ResourceLimits,
    pub resource_usage: ResourceUsage,
    /// Effective permissions, sorted by name.
    pub permissions: Vec<Permission>,
    /// Most recent last.
    pub errors: Vec<PluginError>,
    pub created_at: DateTime<Utc>,
}

struct SandboxRecord {
    plugin_id: Arc<str>,
    status: SandboxStatus,
    limits: ResourceLimits,
    permissions: Arc<PermissionSet>,
    usage: Arc<UsageMeter>,
    execution_time_ms: u64,
    errors: VecDeque<PluginError>,
    created_at: DateTime<Utc>,
    token: CancellationToken,
}

impl SandboxRecord {
    fn info(&self, id: SandboxId) -> SandboxInfo {
        SandboxInfo {
            id,
            plugin_id: self.plugin_id.to_string(),
            status: self.status,
            resource_limits: self.limits,
            resource_usage: self.usage.snapshot(self.execution_time_ms),
            permissions: {
                let mut granted: Vec<Permission> =
                    self.permissions.granted_permissions().iter().copied().collect();
                granted.sort_by_key(|p| p.name());
                granted
            },
            errors: self.errors.iter().cloned().collect(),
            created_at: self.created_at,
        }
    }
}

/// Outcome of [`SandboxManager::run`] when it does not produce a value.
pub(crate) enum RunFailure {
    Host(PluginHostError),
    Timeout { timeout_ms: u64 },
    Plugin(PluginFailure),
}

impl RunFailure {
    pub(crate) fn into_message(self) -> String {
        match self {
            Self::Host(e) => e.to_string(),
            Self::Timeout { timeout_ms } => format!("exceeded {timeout_ms}ms deadline"),
            Self::Plugin(failure) => failure.message,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("plugin panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("plugin panicked: {s}")
    } else {
        "plugin panicked".to_string()
    }
}

/// Owns every live sandbox of a runtime.
pub struct SandboxManager {
    sandboxes: RwLock<HashMap<SandboxId, SandboxRecord>>,
    handlers: RwLock<HashMap<String, Vec<ErrorCallback>>>,
    /// Held while an error is recorded and fanned out, so callbacks of a
    /// plugin observe failures in the order they were recorded.
    dispatch: Mutex<()>,
    perf: Arc<PerformanceManager>,
    error_history: usize,
    denied_permissions: HashSet<Permission>,
    token: CancellationToken,
}

impl SandboxManager {
    pub fn new(
        perf: Arc<PerformanceManager>,
        config: &SandboxConfig,
        security: &SecurityConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            sandboxes: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            dispatch: Mutex::new(()),
            perf,
            error_history: config.error_history.max(1),
            denied_permissions: security.denied_permissions.clone(),
            token,
        }
    }

    // ================================================================
    // Lifecycle
    // ================================================================

    /// Creates a sandbox in `initializing` and reserves its ceilings in the
    /// shared pools, waiting up to `limits.timeout_ms` for capacity.
    pub async fn create_sandbox(
        &self,
        plugin_id: &str,
        limits: ResourceLimits,
        declared: &HashSet<Permission>,
    ) -> Result<SandboxId, PluginHostError> {
        let id = SandboxId::new();
        let record = SandboxRecord {
            plugin_id: Arc::from(plugin_id),
            status: SandboxStatus::Initializing,
            limits,
            permissions: Arc::new(PermissionSet::new(declared, &self.denied_permissions)),
            usage: Arc::new(UsageMeter::default()),
            execution_time_ms: 0,
            errors: VecDeque::new(),
            created_at: Utc::now(),
            token: self.token.child_token(),
        };
        self.sandboxes.write().insert(id, record);

        let wait = Duration::from_millis(limits.timeout_ms);
        if let Err(source) = self.perf.reserve_resources(id, &limits, wait).await {
            self.sandboxes.write().remove(&id);
            warn!(plugin_id = %plugin_id, sandbox_id = %id, error = %source, "Sandbox resource reservation failed");
            return Err(PluginHostError::Resource {
                plugin_id: plugin_id.to_string(),
                source,
            });
        }

        // Terminated while waiting for capacity.
        if !self.sandboxes.read().contains_key(&id) {
            self.perf.release_resources(id);
            return Err(PluginHostError::SandboxNotFound(id));
        }

        info!(plugin_id = %plugin_id, sandbox_id = %id, "Sandbox created");
        Ok(id)
    }

    /// Moves a freshly created sandbox to `running`.
    pub fn activate(&self, sandbox_id: SandboxId) -> Result<(), PluginHostError> {
        self.transition(sandbox_id, SandboxStatus::Running, |from| {
            matches!(from, SandboxStatus::Initializing | SandboxStatus::Running)
        })
    }

    /// `running → paused`; also accepted from `error` to contain a plugin.
    pub fn pause_sandbox(&self, sandbox_id: SandboxId) -> Result<(), PluginHostError> {
        self.transition(sandbox_id, SandboxStatus::Paused, |from| {
            matches!(from, SandboxStatus::Running | SandboxStatus::Error)
        })
    }

    /// `paused → running`.
    pub fn resume_sandbox(&self, sandbox_id: SandboxId) -> Result<(), PluginHostError> {
        self.transition(sandbox_id, SandboxStatus::Running, |from| {
            from == SandboxStatus::Paused
        })
    }

    fn transition(
        &self,
        sandbox_id: SandboxId,
        to: SandboxStatus,
        allowed_from: impl Fn(SandboxStatus) -> bool,
    ) -> Result<(), PluginHostError> {
        let mut sandboxes = self.sandboxes.write();
        let record = sandboxes
            .get_mut(&sandbox_id)
            .ok_or(PluginHostError::SandboxNotFound(sandbox_id))?;
        let from = record.status;
        if !allowed_from(from) || !from.can_transition_to(to) {
            return Err(PluginHostError::InvalidTransition {
                sandbox_id,
                from,
                to,
            });
        }
        record.status = to;
        debug!(sandbox_id = %sandbox_id, from = %from, to = %to, "Sandbox transition");
        Ok(())
    }

    /// Cancels the sandbox's token, releases its pooled resources and
    /// removes it. Terminating an unknown or already terminated sandbox
    /// is a no-op returning `false`.
    pub fn terminate_sandbox(&self, sandbox_id: SandboxId) -> bool {
        let Some(record) = self.sandboxes.write().remove(&sandbox_id) else {
            debug!(sandbox_id = %sandbox_id, "Sandbox already terminated");
            return false;
        };
        record.token.cancel();
        self.perf.release_resources(sandbox_id);
        info!(
            sandbox_id = %sandbox_id,
            plugin_id = %record.plugin_id,
            from = %record.status,
            "Sandbox terminated"
        );
        true
    }

    // ================================================================
    // Execution
    // ================================================================

    /// Runs `operation` inside the sandbox, racing it against `timeout`
    /// (default: the sandbox's `timeout_ms`).
    ///
    /// On timeout the operation's token is cancelled and its future
    /// dropped. Timeouts, failures and panics move the sandbox to `error`,
    /// record a [`PluginError`] and notify the plugin's error handlers
    /// before the error is returned. Success moves it back to `running`.
    pub async fn execute_in_sandbox<T, F, Fut>(
        &self,
        sandbox_id: SandboxId,
        operation: F,
        timeout: Option<Duration>,
    ) -> Result<T, PluginHostError>
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = Result<T, PluginFailure>>,
    {
        let plugin_id = {
            let sandboxes = self.sandboxes.read();
            let record = sandboxes
                .get(&sandbox_id)
                .ok_or(PluginHostError::SandboxNotFound(sandbox_id))?;
            if record.status == SandboxStatus::Paused {
                return Err(PluginHostError::InvalidTransition {
                    sandbox_id,
                    from: SandboxStatus::Paused,
                    to: SandboxStatus::Running,
                });
            }
            record.plugin_id.to_string()
        };

        match self.run(sandbox_id, operation, timeout).await {
            Ok(value) => Ok(value),
            Err(RunFailure::Host(e)) => Err(e),
            Err(RunFailure::Timeout { timeout_ms }) => {
                self.record_failure(
                    sandbox_id,
                    PluginError::new(
                        plugin_id.as_str(),
                        ErrorKind::Timeout,
                        format!("operation exceeded {timeout_ms}ms"),
                        true,
                    ),
                );
                Err(PluginHostError::Timeout {
                    plugin_id,
                    timeout_ms,
                })
            }
            Err(RunFailure::Plugin(failure)) => {
                let mut error = PluginError::new(
                    plugin_id.as_str(),
                    failure.kind,
                    failure.message.clone(),
                    failure.recoverable,
                );
                error.stack = failure.stack;
                self.record_failure(sandbox_id, error);
                Err(PluginHostError::PluginFailed {
                    plugin_id,
                    kind: failure.kind,
                    message: failure.message,
                    recoverable: failure.recoverable,
                })
            }
        }
    }

    /// Runs `operation` without recording failures. Used directly for
    /// lifecycle hooks, whose failures the manager classifies itself.
    pub(crate) async fn run<T, F, Fut>(
        &self,
        sandbox_id: SandboxId,
        operation: F,
        timeout: Option<Duration>,
    ) -> Result<T, RunFailure>
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = Result<T, PluginFailure>>,
    {
        let (ctx, timeout) = {
            let sandboxes = self.sandboxes.read();
            let record = sandboxes
                .get(&sandbox_id)
                .ok_or(RunFailure::Host(PluginHostError::SandboxNotFound(sandbox_id)))?;
            let ctx = OperationContext::new(
                Arc::clone(&record.plugin_id),
                sandbox_id,
                record.token.child_token(),
                Arc::clone(&record.permissions),
                record.limits,
                Arc::clone(&record.usage),
                Arc::clone(&self.perf),
            );
            let timeout = timeout.unwrap_or(Duration::from_millis(record.limits.timeout_ms));
            (ctx, timeout)
        };

        let op_token = ctx.cancellation_token().clone();
        let started = Instant::now();
        let guarded = AssertUnwindSafe(async move { operation(ctx).await }).catch_unwind();
        let outcome = tokio::time::timeout(timeout, guarded).await;

        match outcome {
            Err(_) => {
                op_token.cancel();
                Err(RunFailure::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(payload)) => Err(RunFailure::Plugin(PluginFailure::runtime(panic_message(
                payload.as_ref(),
            )))),
            Ok(Ok(Err(failure))) => Err(RunFailure::Plugin(failure)),
            Ok(Ok(Ok(value))) => {
                self.record_success(sandbox_id, started.elapsed());
                Ok(value)
            }
        }
    }

    fn record_success(&self, sandbox_id: SandboxId, elapsed: Duration) {
        if let Some(record) = self.sandboxes.write().get_mut(&sandbox_id) {
            record.execution_time_ms += elapsed.as_millis() as u64;
            // A pause issued while the operation ran is kept.
            if matches!(
                record.status,
                SandboxStatus::Initializing | SandboxStatus::Error
            ) {
                record.status = SandboxStatus::Running;
            }
        }
    }

    /// Moves the sandbox to `error`, appends `error` to its ring and fans it
    /// out to the plugin's handlers.
    pub fn record_failure(&self, sandbox_id: SandboxId, error: PluginError) {
        let _order = self.dispatch.lock();
        if let Some(record) = self.sandboxes.write().get_mut(&sandbox_id) {
            if record.status.can_transition_to(SandboxStatus::Error) {
                record.status = SandboxStatus::Error;
            }
            if record.errors.len() >= self.error_history {
                record.errors.pop_front();
            }
            record.errors.push_back(error.clone());
        }
        warn!(
            sandbox_id = %sandbox_id,
            plugin_id = %error.plugin_id,
            kind = %error.kind,
            "Plugin error: {}",
            error.message
        );

        let handlers = self
            .handlers
            .read()
            .get(&error.plugin_id)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(&error);
        }
    }

    // ================================================================
    // Error handlers
    // ================================================================

    /// Adds a handler for every sandbox of `plugin_id`, present or future.
    pub fn register_error_handler(&self, plugin_id: &str, callback: ErrorCallback) {
        self.handlers
            .write()
            .entry(plugin_id.to_string())
            .or_default()
            .push(callback);
    }

    pub fn remove_error_handlers(&self, plugin_id: &str) {
        self.handlers.write().remove(plugin_id);
    }

    // ================================================================
    // Queries
    // ================================================================

    pub fn get_sandbox_info(&self, sandbox_id: SandboxId) -> Option<SandboxInfo> {
        self.sandboxes
            .read()
            .get(&sandbox_id)
            .map(|record| record.info(sandbox_id))
    }

    pub fn status(&self, sandbox_id: SandboxId) -> Option<SandboxStatus> {
        self.sandboxes.read().get(&sandbox_id).map(|r| r.status)
    }

    /// Sandboxes of `plugin_id`, oldest first.
    pub fn get_plugin_sandboxes(&self, plugin_id: &str) -> Vec<SandboxInfo> {
        let mut infos: Vec<SandboxInfo> = self
            .sandboxes
            .read()
            .iter()
            .filter(|(_, record)| &*record.plugin_id == plugin_id)
            .map(|(id, record)| record.info(*id))
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn len(&self) -> usize {
        self.sandboxes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sandboxes.read().is_empty()
    }
}
