//! Graph algorithms over the registered manifests.
//!
//! Edges point from a dependent to the plugins it depends on. Edges to
//! unregistered plugins are leaves.

use crate::error::DependencyError;
use crate::report::DependencyNode;
use atrium_types::PluginManifest;
use std::collections::{HashMap, HashSet};

pub(crate) type Manifests = HashMap<String, PluginManifest>;

/// Every declared edge out of `id`, optional ones included, that lands on a
/// registered plugin.
fn neighbours<'a>(plugins: &'a Manifests, id: &str) -> impl Iterator<Item = &'a str> + use<'a> {
    plugins
        .get(id)
        .into_iter()
        .flat_map(|m| m.dependencies.iter())
        .map(|d| d.plugin_id.as_str())
        .filter(move |dep| plugins.contains_key(*dep))
}

/// Depth-first search from `start`, returning true as soon as a node already
/// on the current path is revisited.
///
/// `path` holds only the nodes of the active branch, so diamonds
/// (A -> B, A -> C, B -> D, C -> D) are not reported. `clean` memoizes
/// nodes whose whole subtree was explored without finding a cycle.
pub(crate) fn has_cycle_from(plugins: &Manifests, start: &str) -> bool {
    fn visit<'a>(
        plugins: &'a Manifests,
        node: &'a str,
        path: &mut HashSet<&'a str>,
        clean: &mut HashSet<&'a str>,
    ) -> bool {
        if path.contains(node) {
            return true;
        }
        if clean.contains(node) {
            return false;
        }
        path.insert(node);
        for next in neighbours(plugins, node) {
            if visit(plugins, next, path, clean) {
                return true;
            }
        }
        path.remove(node);
        clean.insert(node);
        false
    }

    let mut path = HashSet::new();
    let mut clean = HashSet::new();
    visit(plugins, start, &mut path, &mut clean)
}

/// Returns true if `node` can reach itself through at least one edge.
pub(crate) fn on_cycle(plugins: &Manifests, node: &str) -> bool {
    let mut stack: Vec<&str> = neighbours(plugins, node).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(current) = stack.pop() {
        if current == node {
            return true;
        }
        if seen.insert(current) {
            stack.extend(neighbours(plugins, current));
        }
    }
    false
}

/// Depth-first search from `start` over the edges produced by `edges`.
/// Returns the first cycle found as a path that starts and ends on the
/// same node.
pub(crate) fn find_cycle_from<F>(start: &str, edges: F) -> Option<Vec<String>>
where
    F: Fn(&str) -> Vec<String>,
{
    fn visit<F: Fn(&str) -> Vec<String>>(
        node: &str,
        edges: &F,
        stack: &mut Vec<String>,
        clean: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        if let Some(start) = stack.iter().position(|n| n == node) {
            let mut cycle = stack[start..].to_vec();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if clean.contains(node) {
            return None;
        }
        stack.push(node.to_string());
        for next in edges(node) {
            if let Some(cycle) = visit(&next, edges, stack, clean) {
                return Some(cycle);
            }
        }
        stack.pop();
        clean.insert(node.to_string());
        None
    }

    visit(start, &edges, &mut Vec::new(), &mut HashSet::new())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Topological order of `ids` over the edges produced by `edges`,
/// restricted to `ids`.
///
/// Dependencies precede dependents; among independent plugins the input
/// order is kept. Fails with the offending cycle if one exists.
pub(crate) fn topological_order<F>(
    plugins: &Manifests,
    ids: &[String],
    edges: F,
) -> Result<Vec<String>, DependencyError>
where
    F: Fn(&str) -> Vec<String>,
{
    fn visit<F: Fn(&str) -> Vec<String>>(
        node: &str,
        edges: &F,
        in_set: &HashSet<&str>,
        marks: &mut HashMap<String, Mark>,
        stack: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<(), DependencyError> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| n == node).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(node.to_string());
                return Err(DependencyError::CircularDependency { cycle });
            }
            None => {}
        }

        marks.insert(node.to_string(), Mark::Visiting);
        stack.push(node.to_string());
        for dep in edges(node) {
            if in_set.contains(dep.as_str()) {
                visit(&dep, edges, in_set, marks, stack, order)?;
            }
        }
        stack.pop();
        marks.insert(node.to_string(), Mark::Done);
        order.push(node.to_string());
        Ok(())
    }

    for id in ids {
        if !plugins.contains_key(id) {
            return Err(DependencyError::PluginNotFound(id.clone()));
        }
    }

    let in_set: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    let mut order = Vec::with_capacity(in_set.len());
    for id in ids {
        visit(id, &edges, &in_set, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}

/// Builds the dependency tree rooted at `root`. Edges that close a cycle are
/// marked `circular` and not expanded.
pub(crate) fn dependency_tree(plugins: &Manifests, root: &PluginManifest) -> DependencyNode {
    fn expand(plugins: &Manifests, manifest: &PluginManifest, path: &mut Vec<String>) -> Vec<DependencyNode> {
        path.push(manifest.id.clone());
        let children = manifest
            .dependencies
            .iter()
            .map(|dep| {
                let installed = plugins.get(&dep.plugin_id);
                let circular = path.contains(&dep.plugin_id);
                let dependencies = match installed {
                    Some(child) if !circular => expand(plugins, child, path),
                    _ => Vec::new(),
                };
                DependencyNode {
                    plugin_id: dep.plugin_id.clone(),
                    version: installed.map(|m| m.version.clone()),
                    required: Some(dep.version.clone()),
                    optional: dep.optional,
                    available: installed.is_some(),
                    compatible: installed.is_some_and(|m| m.version.satisfies(&dep.version)),
                    fallback: dep.fallback.clone(),
                    circular,
                    dependencies,
                }
            })
            .collect();
        path.pop();
        children
    }

    let mut path = Vec::new();
    DependencyNode {
        plugin_id: root.id.clone(),
        version: Some(root.version.clone()),
        required: None,
        optional: false,
        available: true,
        compatible: true,
        fallback: None,
        circular: false,
        dependencies: expand(plugins, root, &mut path),
    }
}
