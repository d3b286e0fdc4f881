//! Plugin catalogs and the demo runtime behind the `atrium` binary.
//!
//! A catalog is a TOML file with one `[[plugin]]` table per manifest:
//!
//! ```toml
//! [[plugin]]
//! id = "adv-calc"
//! name = "Advanced Calculator"
//! version = "1.2.0"
//! permissions = ["storage"]
//!
//! [[plugin.dependencies]]
//! plugin_id = "calc"
//! version = "1.0.0"
//! fallback = "simple-calc"
//! ```

use anyhow::{Context, Result};
use atrium_deps::{DependencyNode, DependencyResolver};
use atrium_host::{OperationContext, PluginDescriptor, PluginFailure, PluginManager, UnitOfWork};
use atrium_types::PluginManifest;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default, rename = "plugin")]
    pub plugins: Vec<PluginManifest>,
}

impl Catalog {
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse plugin catalog")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid catalog {}", path.display()))
    }

    /// Plugin ids in catalog order.
    pub fn ids(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.id.clone()).collect()
    }

    /// A resolver holding every catalog manifest.
    pub fn resolver(&self) -> Result<DependencyResolver> {
        let mut resolver = DependencyResolver::new();
        for manifest in &self.plugins {
            resolver
                .register_plugin(manifest.clone())
                .with_context(|| format!("Failed to register '{}'", manifest.id))?;
        }
        Ok(resolver)
    }

    /// Registers every catalog plugin with `manager`, each backed by an
    /// [`EchoUnit`].
    pub fn register_all(&self, manager: &PluginManager) -> Result<()> {
        for manifest in &self.plugins {
            manager
                .register_plugin(PluginDescriptor::new(manifest.clone(), Arc::new(EchoUnit)))
                .with_context(|| format!("Failed to register '{}'", manifest.id))?;
        }
        Ok(())
    }
}

/// Unit of work that answers every request with the request itself.
pub struct EchoUnit;

impl UnitOfWork for EchoUnit {
    fn handle(
        &self,
        _ctx: OperationContext,
        request: Value,
    ) -> BoxFuture<'_, Result<Value, PluginFailure>> {
        Box::pin(async move { Ok(request) })
    }
}

/// Renders a dependency tree as indented text.
pub fn render_tree(node: &DependencyNode) -> String {
    let mut out = String::new();
    render_node(node, 0, &mut out);
    out
}

fn render_node(node: &DependencyNode, depth: usize, out: &mut String) {
    let version = node
        .version
        .as_ref()
        .map_or_else(|| "not installed".to_string(), ToString::to_string);
    let _ = write!(out, "{}{} ({})", "  ".repeat(depth), node.plugin_id, version);
    if let Some(required) = &node.required {
        let _ = write!(out, " requires {required}");
    }
    if node.optional {
        out.push_str(" [optional]");
    }
    if node.available && !node.compatible {
        out.push_str(" [incompatible]");
    }
    if let Some(fallback) = &node.fallback {
        let _ = write!(out, " [fallback: {fallback}]");
    }
    if node.circular {
        out.push_str(" [cycle]");
    }
    out.push('\n');
    for child in &node.dependencies {
        render_node(child, depth + 1, out);
    }
}
