//! Typed lifecycle notifications.

use crate::instance::InstanceStatus;
use crate::recovery::RecoveryAction;
use atrium_types::{InstanceId, PluginError};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    PluginRegistered {
        plugin_id: String,
    },
    PluginUnregistered {
        plugin_id: String,
    },
    InstanceLoaded {
        plugin_id: String,
        instance_id: InstanceId,
    },
    InstanceStatusChanged {
        instance_id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
    },
    InstanceRestarted {
        instance_id: InstanceId,
        restart_count: u32,
    },
    InstanceUnloaded {
        plugin_id: String,
        instance_id: InstanceId,
    },
    PluginError {
        error: PluginError,
    },
    RecoveryApplied {
        plugin_id: String,
        instance_id: InstanceId,
        action: RecoveryAction,
    },
}

impl RuntimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PluginRegistered { .. } => "plugin_registered",
            Self::PluginUnregistered { .. } => "plugin_unregistered",
            Self::InstanceLoaded { .. } => "instance_loaded",
            Self::InstanceStatusChanged { .. } => "instance_status_changed",
            Self::InstanceRestarted { .. } => "instance_restarted",
            Self::InstanceUnloaded { .. } => "instance_unloaded",
            Self::PluginError { .. } => "plugin_error",
            Self::RecoveryApplied { .. } => "recovery_applied",
        }
    }
}

/// Broadcasts [`RuntimeEvent`]s to every subscriber. Slow subscribers lag
/// and lose the oldest events; publishers never block.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<RuntimeEvent>>,
}

impl EventBus {
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of receivers the event reached.
    pub fn publish(&self, event: RuntimeEvent) -> usize {
        let name = event.name();
        match self.sender.send(Arc::new(event)) {
            Ok(count) => count,
            Err(_) => {
                trace!(event = name, "No receivers for event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RuntimeEvent>> {
        self.sender.subscribe()
    }
}
