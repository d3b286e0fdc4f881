//! Plugin instances: one per successful `load_plugin` call.

use atrium_types::{InstanceId, SandboxId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Loading,
    Running,
    Paused,
    Error,
    Terminated,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loading => write!(f, "loading"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Error => write!(f, "error"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// A loaded plugin bound to exactly one live sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInstance {
    pub id: InstanceId,
    pub plugin_id: String,
    pub sandbox_id: SandboxId,
    pub status: InstanceStatus,
    pub error_count: u32,
    pub restart_count: u32,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Passed to `on_load`; replayed on restart.
    #[serde(skip)]
    pub initial_data: Option<Value>,
}

impl PluginInstance {
    pub(crate) fn new(
        id: InstanceId,
        plugin_id: impl Into<String>,
        sandbox_id: SandboxId,
        initial_data: Option<Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            plugin_id: plugin_id.into(),
            sandbox_id,
            status: InstanceStatus::Loading,
            error_count: 0,
            restart_count: 0,
            start_time: now,
            last_activity: now,
            initial_data,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}

/// Outcome of [`crate::PluginManager::load_plugins_in_order`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchLoadReport {
    /// Plugin id and the instance created for it, in load order.
    pub loaded: Vec<(String, InstanceId)>,
    /// Plugin id and the reason its load failed.
    pub failed: Vec<(String, String)>,
    /// Plugins not attempted because a dependency failed or was skipped.
    pub skipped: Vec<String>,
}

impl BatchLoadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}
