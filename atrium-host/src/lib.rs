//! Sandboxed plugin runtime for Atrium.
//!
//! [`PluginManager`] is the entry point: it registers plugin descriptors,
//! resolves their dependencies, runs each loaded instance in its own
//! sandbox with resource reservations and per-operation deadlines, and
//! applies a failure-class recovery policy when plugin code fails.
//!
//! Plugin code implements [`UnitOfWork`] (and optionally
//! [`LifecycleHooks`]) and receives an [`OperationContext`] carrying its
//! cancellation token, permission checks and usage meter.

mod config;
mod error;
mod events;
mod health;
mod instance;
mod manager;
mod permissions;
mod recovery;
mod sandbox;
mod unit;

pub use config::{HealthConfig, RecoveryConfig, RuntimeConfig, SandboxConfig, SecurityConfig};
pub use error::PluginHostError;
pub use events::{EventBus, RuntimeEvent};
pub use health::{HealthStatus, PluginHealth};
pub use instance::{BatchLoadReport, InstanceStatus, PluginInstance};
pub use manager::{PluginDescriptor, PluginManager};
pub use permissions::{Denial, PermissionSet};
pub use recovery::{RecoveryAction, RecoveryPolicy};
pub use sandbox::{ErrorCallback, SandboxInfo, SandboxManager, SandboxStatus};
pub use unit::{
    LifecycleHooks, OperationContext, PluginFailure, ResourceUsage, UnitOfWork, UsageMeter,
};

pub type Result<T> = std::result::Result<T, PluginHostError>;
