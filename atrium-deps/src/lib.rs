//! Dependency resolution for Atrium plugins.
//!
//! The [`DependencyResolver`] owns the registered plugin manifests and the
//! dependency graph built from them (an adjacency list keyed by plugin id).
//! It answers availability and version-compatibility questions, substitutes
//! fallbacks for unavailable dependencies, detects cycles, and computes a
//! topological load order.
//!
//! The resolver is a plain synchronous data structure; the host wraps it in
//! a lock. The graph is written only on registration and version updates.

mod error;
mod graph;
mod report;
mod resolver;

pub use error::DependencyError;
pub use report::{
    Compatibility, DependencyNode, RegistryInfo, Resolution, VersionConflict, VersionUpdate,
};
pub use resolver::DependencyResolver;
