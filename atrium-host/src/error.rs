//! Error types for the plugin host.

use crate::instance::InstanceStatus;
use crate::sandbox::SandboxStatus;
use atrium_deps::DependencyError;
use atrium_perf::PerfError;
use atrium_types::{ErrorKind, InstanceId, SandboxId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginHostError {
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("plugin already registered: {0}")]
    AlreadyRegistered(String),

    #[error("plugin instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("sandbox not found: {0}")]
    SandboxNotFound(SandboxId),

    #[error("invalid manifest: {0}")]
    InvalidManifest(#[from] atrium_types::Error),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("sandbox {sandbox_id} cannot go from {from} to {to}")]
    InvalidTransition {
        sandbox_id: SandboxId,
        from: SandboxStatus,
        to: SandboxStatus,
    },

    #[error("instance {instance_id} is {status}, expected {expected}")]
    InvalidInstanceState {
        instance_id: InstanceId,
        status: InstanceStatus,
        expected: InstanceStatus,
    },

    #[error("resource reservation failed for '{plugin_id}': {source}")]
    Resource {
        plugin_id: String,
        #[source]
        source: PerfError,
    },

    #[error("timeout: plugin '{plugin_id}' exceeded {timeout_ms}ms deadline")]
    Timeout { plugin_id: String, timeout_ms: u64 },

    #[error("plugin '{plugin_id}' failed ({kind}): {message}")]
    PluginFailed {
        plugin_id: String,
        kind: ErrorKind,
        message: String,
        recoverable: bool,
    },

    #[error("plugin initialization failed: {plugin_id} (instance {instance_id}): {message}")]
    InitializationFailed {
        plugin_id: String,
        instance_id: InstanceId,
        message: String,
    },

    #[error("plugin '{plugin_id}' is in use: {reason}")]
    PluginInUse { plugin_id: String, reason: String },

    #[error("runtime is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),
}

impl PluginHostError {
    /// Classification of a failure raised by plugin code, `None` for host
    /// errors (missing ids, bad state, ...).
    pub fn failure_kind(&self) -> Option<(ErrorKind, bool)> {
        match self {
            Self::Timeout { .. } => Some((ErrorKind::Timeout, true)),
            Self::PluginFailed {
                kind, recoverable, ..
            } => Some((*kind, *recoverable)),
            _ => None,
        }
    }
}
