//! Error types for dependency resolution.

use crate::report::VersionConflict;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("plugin not registered: {0}")]
    PluginNotFound(String),

    #[error("plugin already registered: {0}")]
    AlreadyRegistered(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(#[from] atrium_types::Error),

    #[error(
        "unresolved dependencies for '{plugin_id}': missing {missing:?}, incompatible {}",
        format_conflicts(incompatible)
    )]
    Unresolved {
        plugin_id: String,
        missing: Vec<String>,
        incompatible: Vec<VersionConflict>,
    },

    #[error("circular dependency: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },
}

fn format_conflicts(conflicts: &[VersionConflict]) -> String {
    let parts: Vec<String> = conflicts.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}
