//! The dependency resolver: registered manifests plus the graph built from
//! their declared dependencies.

use crate::error::DependencyError;
use crate::graph::{self, Manifests};
use crate::report::{
    Compatibility, DependencyNode, RegistryInfo, Resolution, VersionConflict, VersionUpdate,
};
use atrium_types::{Dependency, PluginManifest, PluginVersion};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// How one declared dependency resolved.
enum EdgeOutcome {
    Satisfied,
    Fallback(String),
    Missing,
    Incompatible(VersionConflict),
    OptionalUnavailable(String),
}

/// Registry of plugin manifests and their dependency graph.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    plugins: Manifests,
    /// Registration order, used for deterministic listings.
    order: Vec<String>,
    /// Adjacency list: plugin id -> ids it depends on.
    graph: HashMap<String, Vec<String>>,
    /// Dependency id -> fallback ids declared anywhere in the registry.
    fallbacks: HashMap<String, Vec<String>>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    // ================================================================
    // Registration
    // ================================================================

    /// Records a manifest, indexes its dependencies and declared fallbacks.
    pub fn register_plugin(&mut self, manifest: PluginManifest) -> Result<(), DependencyError> {
        manifest.validate()?;
        if self.plugins.contains_key(&manifest.id) {
            return Err(DependencyError::AlreadyRegistered(manifest.id));
        }

        let id = manifest.id.clone();
        self.graph.insert(
            id.clone(),
            manifest
                .dependencies
                .iter()
                .map(|d| d.plugin_id.clone())
                .collect(),
        );
        for dep in &manifest.dependencies {
            if let Some(fallback) = &dep.fallback {
                let entry = self.fallbacks.entry(dep.plugin_id.clone()).or_default();
                if !entry.contains(fallback) {
                    entry.push(fallback.clone());
                }
            }
        }

        info!(
            plugin_id = %id,
            version = %manifest.version,
            dependencies = manifest.dependencies.len(),
            "Plugin registered with dependency resolver"
        );
        self.order.push(id.clone());
        self.plugins.insert(id, manifest);
        Ok(())
    }

    /// Removes a manifest and its edges. Fallback mappings are rebuilt from
    /// the remaining manifests.
    pub fn unregister_plugin(&mut self, plugin_id: &str) -> Result<PluginManifest, DependencyError> {
        let manifest = self
            .plugins
            .remove(plugin_id)
            .ok_or_else(|| DependencyError::PluginNotFound(plugin_id.to_string()))?;
        self.graph.remove(plugin_id);
        self.order.retain(|id| id != plugin_id);

        self.fallbacks.clear();
        for id in &self.order {
            for dep in &self.plugins[id].dependencies {
                if let Some(fallback) = &dep.fallback {
                    let entry = self.fallbacks.entry(dep.plugin_id.clone()).or_default();
                    if !entry.contains(fallback) {
                        entry.push(fallback.clone());
                    }
                }
            }
        }

        info!(plugin_id = %plugin_id, "Plugin removed from dependency resolver");
        Ok(manifest)
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.plugins.contains_key(plugin_id)
    }

    pub fn manifest(&self, plugin_id: &str) -> Option<&PluginManifest> {
        self.plugins.get(plugin_id)
    }

    /// Registered plugin ids in registration order.
    pub fn plugin_ids(&self) -> &[String] {
        &self.order
    }

    fn require(&self, plugin_id: &str) -> Result<&PluginManifest, DependencyError> {
        self.plugins
            .get(plugin_id)
            .ok_or_else(|| DependencyError::PluginNotFound(plugin_id.to_string()))
    }

    // ================================================================
    // Compatibility
    // ================================================================

    /// Finds a registered fallback for `dep`, preferring the edge's own
    /// `fallback` over the registry-wide map.
    fn find_fallback(&self, dependent: &str, dep: &Dependency) -> Option<String> {
        let declared = dep.fallback.iter();
        let global = self
            .fallbacks
            .get(&dep.plugin_id)
            .into_iter()
            .flat_map(|ids| ids.iter());
        declared
            .chain(global)
            .find(|candidate| {
                candidate.as_str() != dependent
                    && candidate.as_str() != dep.plugin_id
                    && self.plugins.contains_key(candidate.as_str())
            })
            .cloned()
    }

    fn evaluate(&self, dependent: &str, dep: &Dependency) -> EdgeOutcome {
        match self.plugins.get(&dep.plugin_id) {
            Some(installed) if installed.version.satisfies(&dep.version) => EdgeOutcome::Satisfied,
            Some(installed) => {
                let conflict = VersionConflict {
                    plugin_id: dep.plugin_id.clone(),
                    required: dep.version.clone(),
                    installed: installed.version.clone(),
                };
                if dep.optional {
                    return EdgeOutcome::OptionalUnavailable(format!(
                        "optional dependency {conflict} is incompatible"
                    ));
                }
                match self.find_fallback(dependent, dep) {
                    Some(fallback) => EdgeOutcome::Fallback(fallback),
                    None => EdgeOutcome::Incompatible(conflict),
                }
            }
            None if dep.optional => EdgeOutcome::OptionalUnavailable(format!(
                "optional dependency '{}' is not available",
                dep.plugin_id
            )),
            None => match self.find_fallback(dependent, dep) {
                Some(fallback) => EdgeOutcome::Fallback(fallback),
                None => EdgeOutcome::Missing,
            },
        }
    }

    /// Checks every declared dependency of `plugin_id`.
    pub fn check_dependencies(&self, plugin_id: &str) -> Result<Compatibility, DependencyError> {
        let manifest = self.require(plugin_id)?;
        let mut report = Compatibility::default();

        for dep in &manifest.dependencies {
            match self.evaluate(plugin_id, dep) {
                EdgeOutcome::Satisfied => {}
                EdgeOutcome::Fallback(fallback) => {
                    report.warnings.push(format!(
                        "using fallback '{}' for dependency '{}'",
                        fallback, dep.plugin_id
                    ));
                    report.available_fallbacks.push(fallback);
                }
                EdgeOutcome::Missing => report.missing_dependencies.push(dep.plugin_id.clone()),
                EdgeOutcome::Incompatible(conflict) => report.incompatible_versions.push(conflict),
                EdgeOutcome::OptionalUnavailable(warning) => report.warnings.push(warning),
            }
        }

        report.compatible =
            report.missing_dependencies.is_empty() && report.incompatible_versions.is_empty();
        debug!(
            plugin_id = %plugin_id,
            compatible = report.compatible,
            missing = report.missing_dependencies.len(),
            incompatible = report.incompatible_versions.len(),
            "Dependency check complete"
        );
        Ok(report)
    }

    /// Resolves the dependencies of `plugin_id`, substituting fallbacks.
    /// Fails if a required dependency cannot be resolved at all, or if the
    /// plugin sits on or above a cycle of load edges.
    pub fn resolve_dependencies(&self, plugin_id: &str) -> Result<Resolution, DependencyError> {
        let manifest = self.require(plugin_id)?;
        if let Some(cycle) = self.find_load_cycle(plugin_id) {
            warn!(plugin_id = %plugin_id, cycle = ?cycle, "Dependency cycle blocks resolution");
            return Err(DependencyError::CircularDependency { cycle });
        }
        let mut resolution = Resolution::default();
        let mut missing = Vec::new();
        let mut incompatible = Vec::new();

        for dep in &manifest.dependencies {
            match self.evaluate(plugin_id, dep) {
                EdgeOutcome::Satisfied => resolution.resolved.push(dep.plugin_id.clone()),
                EdgeOutcome::Fallback(fallback) => {
                    resolution.warnings.push(format!(
                        "dependency '{}' resolved via fallback '{}'",
                        dep.plugin_id, fallback
                    ));
                    resolution.resolved.push(fallback.clone());
                    resolution.fallbacks.insert(dep.plugin_id.clone(), fallback);
                }
                EdgeOutcome::Missing => missing.push(dep.plugin_id.clone()),
                EdgeOutcome::Incompatible(conflict) => incompatible.push(conflict),
                EdgeOutcome::OptionalUnavailable(warning) => resolution.warnings.push(warning),
            }
        }

        if !missing.is_empty() || !incompatible.is_empty() {
            warn!(
                plugin_id = %plugin_id,
                missing = ?missing,
                incompatible = incompatible.len(),
                "Unresolvable dependencies"
            );
            return Err(DependencyError::Unresolved {
                plugin_id: plugin_id.to_string(),
                missing,
                incompatible,
            });
        }
        Ok(resolution)
    }

    // ================================================================
    // Graph queries
    // ================================================================

    /// Returns true if a dependency cycle is reachable from `plugin_id`.
    /// Every declared edge is followed, optional ones included.
    pub fn check_circular_dependencies(&self, plugin_id: &str) -> bool {
        graph::has_cycle_from(&self.plugins, plugin_id)
    }

    /// Plugins `plugin_id` must load after: its required dependencies, each
    /// one redirected to the fallback resolution would substitute for it.
    /// Edges that cannot resolve at all are dropped.
    fn load_edges(&self, plugin_id: &str) -> Vec<String> {
        let Some(manifest) = self.plugins.get(plugin_id) else {
            return Vec::new();
        };
        manifest
            .dependencies
            .iter()
            .filter(|dep| !dep.optional)
            .filter_map(|dep| match self.evaluate(plugin_id, dep) {
                EdgeOutcome::Satisfied | EdgeOutcome::Incompatible(_) => Some(dep.plugin_id.clone()),
                EdgeOutcome::Fallback(fallback) => Some(fallback),
                EdgeOutcome::Missing | EdgeOutcome::OptionalUnavailable(_) => None,
            })
            .collect()
    }

    /// The first cycle of load edges reachable from `plugin_id`, if any.
    /// Optional edges never close a load cycle.
    pub fn find_load_cycle(&self, plugin_id: &str) -> Option<Vec<String>> {
        graph::find_cycle_from(plugin_id, |id| self.load_edges(id))
    }

    /// Topological order of `plugin_ids` over their load edges: required
    /// dependencies, followed through any fallback in use. Edges leaving
    /// the given set are ignored; a cycle is an error.
    pub fn get_load_order(&self, plugin_ids: &[String]) -> Result<Vec<String>, DependencyError> {
        let mut unique: Vec<String> = Vec::with_capacity(plugin_ids.len());
        for id in plugin_ids {
            if !unique.contains(id) {
                unique.push(id.clone());
            }
        }
        graph::topological_order(&self.plugins, &unique, |id| self.load_edges(id))
    }

    /// Direct dependents of `plugin_id`, in registration order.
    pub fn find_dependents(&self, plugin_id: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.graph
                    .get(id.as_str())
                    .is_some_and(|deps| deps.iter().any(|d| d == plugin_id))
            })
            .cloned()
            .collect()
    }

    pub fn get_dependency_tree(&self, plugin_id: &str) -> Result<DependencyNode, DependencyError> {
        let manifest = self.require(plugin_id)?;
        Ok(graph::dependency_tree(&self.plugins, manifest))
    }

    pub fn get_registry_info(&self) -> RegistryInfo {
        RegistryInfo {
            total_plugins: self.plugins.len(),
            total_dependencies: self.graph.values().map(Vec::len).sum(),
            fallback_mappings: self.fallbacks.values().map(Vec::len).sum(),
            circular_dependencies: self
                .order
                .iter()
                .filter(|id| graph::on_cycle(&self.plugins, id))
                .cloned()
                .collect(),
        }
    }

    // ================================================================
    // Version updates
    // ================================================================

    /// Installs `new_version` for `plugin_id` and reports dependents whose
    /// declared minimum it no longer satisfies. The update is never blocked.
    pub fn update_plugin_version(
        &mut self,
        plugin_id: &str,
        new_version: PluginVersion,
    ) -> Result<VersionUpdate, DependencyError> {
        let previous = self.require(plugin_id)?.version.clone();
        let mut affected_plugins = Vec::new();
        let mut warnings = Vec::new();

        if new_version < previous {
            warnings.push(format!(
                "'{plugin_id}' downgraded from {previous} to {new_version}"
            ));
        }

        for dependent in self.find_dependents(plugin_id) {
            let Some(manifest) = self.plugins.get(&dependent) else {
                continue;
            };
            for dep in manifest.dependencies.iter().filter(|d| d.plugin_id == plugin_id) {
                if !new_version.satisfies(&dep.version) {
                    warnings.push(format!(
                        "'{}' requires {} {} but {} would be installed",
                        dependent, plugin_id, dep.version, new_version
                    ));
                    if !affected_plugins.contains(&dependent) {
                        affected_plugins.push(dependent.clone());
                    }
                }
            }
        }

        if let Some(manifest) = self.plugins.get_mut(plugin_id) {
            manifest.version = new_version.clone();
        }

        info!(
            plugin_id = %plugin_id,
            from = %previous,
            to = %new_version,
            affected = affected_plugins.len(),
            "Plugin version updated"
        );
        Ok(VersionUpdate {
            success: true,
            affected_plugins,
            warnings,
        })
    }
}
