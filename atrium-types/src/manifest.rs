//! Plugin manifests: the declarative half of a plugin descriptor.

use crate::{Error, PluginVersion};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A dependency edge declared by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Id of the plugin depended upon.
    pub plugin_id: String,
    /// Minimum compatible version.
    pub version: PluginVersion,
    /// Optional dependencies only produce warnings when unavailable.
    #[serde(default)]
    pub optional: bool,
    /// Plugin substituted when the dependency is unavailable or incompatible.
    #[serde(default)]
    pub fallback: Option<String>,
}

impl Dependency {
    /// A required dependency on `plugin_id` at or above `version`.
    pub fn required(plugin_id: impl Into<String>, version: PluginVersion) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version,
            optional: false,
            fallback: None,
        }
    }

    /// An optional dependency on `plugin_id` at or above `version`.
    pub fn optional(plugin_id: impl Into<String>, version: PluginVersion) -> Self {
        Self {
            optional: true,
            ..Self::required(plugin_id, version)
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }
}

/// Resource ceilings for one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_cpu_percent: u64,
    pub max_network_requests: u64,
    pub max_storage_kb: u64,
    /// Default per-operation deadline in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 50,
            max_cpu_percent: 10,
            max_network_requests: 100,
            max_storage_kb: 1024,
            timeout_ms: 5_000,
        }
    }
}

impl ResourceLimits {
    /// Tighter limits for plugins that do not come from the host vendor.
    pub fn third_party() -> Self {
        Self {
            max_memory_mb: 32,
            max_cpu_percent: 5,
            max_network_requests: 20,
            max_storage_kb: 512,
            timeout_ms: 3_000,
        }
    }
}

/// Capability a plugin may hold inside its sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    Network,
    Storage,
    Clipboard,
    Notifications,
    CrossPlugin,
}

impl Permission {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Clipboard => "clipboard",
            Self::Notifications => "notifications",
            Self::CrossPlugin => "cross-plugin",
        }
    }
}

/// Identity, version, dependencies and limits of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier (e.g., "calc").
    pub id: String,
    /// Human-readable plugin name.
    pub name: String,
    pub version: PluginVersion,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Capabilities granted to the plugin's sandbox.
    #[serde(default)]
    pub permissions: HashSet<Permission>,
}

impl PluginManifest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: PluginVersion) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version,
            dependencies: Vec::new(),
            resource_limits: ResourceLimits::default(),
            permissions: HashSet::new(),
        }
    }

    #[must_use]
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    #[must_use]
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    /// Validates required fields and constraints.
    pub fn validate(&self) -> Result<(), Error> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidManifest("id is required".into()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidManifest(format!(
                "{}: name is required",
                self.id
            )));
        }
        if self.resource_limits.timeout_ms == 0 {
            return Err(Error::InvalidManifest(format!(
                "{}: timeout_ms must be positive",
                self.id
            )));
        }
        for dep in &self.dependencies {
            if dep.plugin_id.trim().is_empty() {
                return Err(Error::InvalidManifest(format!(
                    "{}: dependency id is required",
                    self.id
                )));
            }
            if dep.plugin_id == self.id {
                return Err(Error::InvalidManifest(format!(
                    "{}: plugin cannot depend on itself",
                    self.id
                )));
            }
            if dep.fallback.as_deref().is_some_and(|f| f.trim().is_empty()) {
                return Err(Error::InvalidManifest(format!(
                    "{}: fallback for '{}' is empty",
                    self.id, dep.plugin_id
                )));
            }
        }
        Ok(())
    }

    /// Ids of the plugins this manifest requires (optional edges excluded).
    pub fn required_dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| !d.optional)
            .map(|d| d.plugin_id.as_str())
    }
}
