//! Core type definitions for the Atrium plugin runtime.
//!
//! This crate defines the plugin-agnostic vocabulary shared by every other
//! runtime crate:
//! - Instance, sandbox, error and task identifiers (UUID v7)
//! - Plugin versions and the dependency compatibility rule
//! - Plugin manifests: identity, dependencies, resource limits, permissions
//! - Immutable plugin error records and their classification
//!
//! Executable parts of a plugin (its unit of work and lifecycle hooks) live
//! in `atrium-host`; everything here is plain data.

mod error_record;
mod ids;
mod manifest;
mod version;

pub use error_record::{ErrorKind, PluginError};
pub use ids::{ErrorId, InstanceId, SandboxId, TaskId};
pub use manifest::{Dependency, Permission, PluginManifest, ResourceLimits};
pub use version::PluginVersion;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid version '{input}': {source}")]
    InvalidVersion {
        input: String,
        #[source]
        source: semver::Error,
    },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
}
