//! Result types returned by the resolver.

use atrium_types::PluginVersion;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// A dependency whose installed version fails the compatibility rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionConflict {
    pub plugin_id: String,
    pub required: PluginVersion,
    pub installed: PluginVersion,
}

impl fmt::Display for VersionConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (requires {}, installed {})",
            self.plugin_id, self.required, self.installed
        )
    }
}

/// Outcome of [`crate::DependencyResolver::check_dependencies`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Compatibility {
    pub compatible: bool,
    pub missing_dependencies: Vec<String>,
    pub incompatible_versions: Vec<VersionConflict>,
    /// Fallback plugins substituted for unavailable dependencies.
    pub available_fallbacks: Vec<String>,
    pub warnings: Vec<String>,
}

/// Outcome of [`crate::DependencyResolver::resolve_dependencies`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resolution {
    /// Plugins that satisfy the dependencies, fallbacks included.
    pub resolved: Vec<String>,
    /// Dependency id -> fallback id actually substituted.
    pub fallbacks: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

/// Outcome of [`crate::DependencyResolver::update_plugin_version`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionUpdate {
    pub success: bool,
    /// Dependents whose declared minimum the new version no longer meets.
    pub affected_plugins: Vec<String>,
    pub warnings: Vec<String>,
}

/// Registry-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryInfo {
    pub total_plugins: usize,
    pub total_dependencies: usize,
    pub fallback_mappings: usize,
    /// Plugins that sit on at least one dependency cycle.
    pub circular_dependencies: Vec<String>,
}

/// One node of a dependency tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyNode {
    pub plugin_id: String,
    /// Installed version, `None` when the plugin is not registered.
    pub version: Option<PluginVersion>,
    /// Version the parent requires, `None` for the root.
    pub required: Option<PluginVersion>,
    pub optional: bool,
    pub available: bool,
    pub compatible: bool,
    pub fallback: Option<String>,
    /// Set when this edge closes a cycle; its children are not expanded.
    pub circular: bool,
    pub dependencies: Vec<DependencyNode>,
}

impl DependencyNode {
    /// Total number of nodes in this subtree.
    pub fn size(&self) -> usize {
        1 + self.dependencies.iter().map(Self::size).sum::<usize>()
    }
}
