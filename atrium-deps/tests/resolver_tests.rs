//! Resolver behaviour over realistic plugin catalogs.

use atrium_deps::{DependencyError, DependencyResolver};
use atrium_types::{Dependency, PluginManifest, PluginVersion};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn v(s: &str) -> PluginVersion {
    PluginVersion::parse(s).unwrap()
}

fn plugin(id: &str, version: &str) -> PluginManifest {
    PluginManifest::new(id, id, v(version))
}

fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

/// `adv-calc` depends on `calc@1.0.0` with `simple-calc` as fallback.
fn adv_calc() -> PluginManifest {
    plugin("adv-calc", "1.0.0")
        .with_dependency(Dependency::required("calc", v("1.0.0")).with_fallback("simple-calc"))
}

// ── Fallbacks ───────────────────────────────────────────────────

#[test]
fn calc_scenario_uses_fallback() {
    let mut resolver = DependencyResolver::new();
    resolver.register_plugin(adv_calc()).unwrap();
    resolver.register_plugin(plugin("simple-calc", "1.0.0")).unwrap();

    let check = resolver.check_dependencies("adv-calc").unwrap();
    assert!(check.compatible);
    assert_eq!(check.available_fallbacks, vec!["simple-calc"]);
    assert!(check.missing_dependencies.is_empty());

    let resolution = resolver.resolve_dependencies("adv-calc").unwrap();
    assert_eq!(resolution.resolved, vec!["simple-calc"]);
    assert_eq!(
        resolution.fallbacks.get("calc").map(String::as_str),
        Some("simple-calc")
    );
}

#[test]
fn calc_scenario_prefers_real_dependency() {
    let mut resolver = DependencyResolver::new();
    resolver.register_plugin(plugin("calc", "1.2.0")).unwrap();
    resolver.register_plugin(plugin("simple-calc", "1.0.0")).unwrap();
    resolver.register_plugin(adv_calc()).unwrap();

    let resolution = resolver.resolve_dependencies("adv-calc").unwrap();
    assert_eq!(resolution.resolved, vec!["calc"]);
    assert!(resolution.fallbacks.is_empty());
}

#[test]
fn unregistered_fallback_does_not_resolve() {
    let mut resolver = DependencyResolver::new();
    resolver.register_plugin(adv_calc()).unwrap();

    let check = resolver.check_dependencies("adv-calc").unwrap();
    assert!(!check.compatible);
    assert_eq!(check.missing_dependencies, vec!["calc"]);

    match resolver.resolve_dependencies("adv-calc") {
        Err(DependencyError::Unresolved { plugin_id, missing, .. }) => {
            assert_eq!(plugin_id, "adv-calc");
            assert_eq!(missing, vec!["calc"]);
        }
        other => panic!("expected unresolved, got {other:?}"),
    }
}

// ── Version gate ────────────────────────────────────────────────

#[test]
fn installed_version_gate() {
    let cases = [
        ("2.0.9", false),
        ("3.0.0", false),
        ("2.1.5", true),
        ("2.2.0", true),
    ];
    for (installed, expected) in cases {
        let mut resolver = DependencyResolver::new();
        resolver.register_plugin(plugin("lib", installed)).unwrap();
        resolver
            .register_plugin(
                plugin("app", "1.0.0").with_dependency(Dependency::required("lib", v("2.1.0"))),
            )
            .unwrap();

        let check = resolver.check_dependencies("app").unwrap();
        assert_eq!(check.compatible, expected, "installed {installed}");
        if !expected {
            assert_eq!(check.incompatible_versions.len(), 1);
            assert_eq!(check.incompatible_versions[0].installed, v(installed));
            assert_eq!(check.incompatible_versions[0].required, v("2.1.0"));
        }
    }
}

#[test]
fn optional_incompatible_only_warns() {
    let mut resolver = DependencyResolver::new();
    resolver.register_plugin(plugin("theme", "1.0.0")).unwrap();
    resolver
        .register_plugin(
            plugin("app", "1.0.0").with_dependency(Dependency::optional("theme", v("2.0.0"))),
        )
        .unwrap();

    let check = resolver.check_dependencies("app").unwrap();
    assert!(check.compatible);
    assert!(check.incompatible_versions.is_empty());
    assert_eq!(check.warnings.len(), 1);
}

// ── Cycles and ordering ─────────────────────────────────────────

#[test]
fn two_plugin_cycle_rejected() {
    let mut resolver = DependencyResolver::new();
    resolver
        .register_plugin(plugin("A", "1.0.0").with_dependency(Dependency::required("B", v("1.0.0"))))
        .unwrap();
    resolver
        .register_plugin(plugin("B", "1.0.0").with_dependency(Dependency::required("A", v("1.0.0"))))
        .unwrap();

    assert!(resolver.check_circular_dependencies("A"));
    assert!(matches!(
        resolver.get_load_order(&ids(&["A", "B"])),
        Err(DependencyError::CircularDependency { .. })
    ));
    assert_eq!(resolver.get_registry_info().circular_dependencies, ids(&["A", "B"]));
}

#[test]
fn fallback_in_use_loads_first() {
    let mut resolver = DependencyResolver::new();
    resolver.register_plugin(adv_calc()).unwrap();
    resolver.register_plugin(plugin("simple-calc", "1.0.0")).unwrap();
    assert_eq!(
        resolver.get_load_order(&ids(&["adv-calc", "simple-calc"])).unwrap(),
        ids(&["simple-calc", "adv-calc"])
    );

    // Once the real dependency is installed the fallback edge disappears.
    resolver.register_plugin(plugin("calc", "1.0.0")).unwrap();
    assert_eq!(
        resolver
            .get_load_order(&ids(&["adv-calc", "simple-calc", "calc"]))
            .unwrap(),
        ids(&["calc", "adv-calc", "simple-calc"])
    );
}

#[test]
fn required_cycle_blocks_resolution_of_dependents() {
    let mut resolver = DependencyResolver::new();
    resolver
        .register_plugin(plugin("A", "1.0.0").with_dependency(Dependency::required("B", v("1.0.0"))))
        .unwrap();
    resolver
        .register_plugin(plugin("B", "1.0.0").with_dependency(Dependency::required("A", v("1.0.0"))))
        .unwrap();
    resolver
        .register_plugin(plugin("app", "1.0.0").with_dependency(Dependency::required("A", v("1.0.0"))))
        .unwrap();

    for id in ["A", "B", "app"] {
        assert!(matches!(
            resolver.resolve_dependencies(id),
            Err(DependencyError::CircularDependency { .. })
        ));
    }
    assert_eq!(
        resolver.find_load_cycle("app"),
        Some(ids(&["A", "B", "A"]))
    );
}

#[test]
fn optional_back_edge_does_not_block_ordering() {
    let mut resolver = DependencyResolver::new();
    resolver
        .register_plugin(plugin("A", "1.0.0").with_dependency(Dependency::required("B", v("1.0.0"))))
        .unwrap();
    resolver
        .register_plugin(plugin("B", "1.0.0").with_dependency(Dependency::optional("A", v("1.0.0"))))
        .unwrap();

    assert!(resolver.check_circular_dependencies("A"));
    assert_eq!(resolver.get_load_order(&ids(&["A", "B"])).unwrap(), ids(&["B", "A"]));
    assert!(resolver.resolve_dependencies("A").is_ok());
    assert_eq!(resolver.find_load_cycle("A"), None);
}

#[test]
fn diamond_has_no_cycle() {
    let mut resolver = DependencyResolver::new();
    resolver.register_plugin(plugin("core", "1.0.0")).unwrap();
    resolver
        .register_plugin(plugin("left", "1.0.0").with_dependency(Dependency::required("core", v("1.0.0"))))
        .unwrap();
    resolver
        .register_plugin(plugin("right", "1.0.0").with_dependency(Dependency::required("core", v("1.0.0"))))
        .unwrap();
    resolver
        .register_plugin(
            plugin("top", "1.0.0")
                .with_dependency(Dependency::required("left", v("1.0.0")))
                .with_dependency(Dependency::required("right", v("1.0.0"))),
        )
        .unwrap();

    assert!(!resolver.check_circular_dependencies("top"));
    assert!(resolver.get_registry_info().circular_dependencies.is_empty());

    let order = resolver
        .get_load_order(&ids(&["top", "right", "left", "core"]))
        .unwrap();
    assert_eq!(order, ids(&["core", "left", "right", "top"]));
}

#[test]
fn load_order_ignores_out_of_set_dependencies() {
    let mut resolver = DependencyResolver::new();
    resolver.register_plugin(plugin("core", "1.0.0")).unwrap();
    resolver
        .register_plugin(plugin("ui", "1.0.0").with_dependency(Dependency::required("core", v("1.0.0"))))
        .unwrap();

    assert_eq!(resolver.get_load_order(&ids(&["ui"])).unwrap(), ids(&["ui"]));
    assert!(matches!(
        resolver.get_load_order(&ids(&["ui", "ghost"])),
        Err(DependencyError::PluginNotFound(id)) if id == "ghost"
    ));
}

// ── Updates and queries ─────────────────────────────────────────

#[test]
fn version_update_flags_broken_dependents() {
    let mut resolver = DependencyResolver::new();
    resolver.register_plugin(plugin("core", "1.4.0")).unwrap();
    resolver
        .register_plugin(plugin("ui", "1.0.0").with_dependency(Dependency::required("core", v("1.2.0"))))
        .unwrap();
    resolver
        .register_plugin(plugin("chart", "1.0.0").with_dependency(Dependency::required("core", v("1.4.0"))))
        .unwrap();

    let update = resolver.update_plugin_version("core", v("1.3.0")).unwrap();
    assert!(update.success);
    assert_eq!(update.affected_plugins, vec!["chart"]);
    assert_eq!(update.warnings.len(), 2, "downgrade plus broken dependent");
    assert_eq!(resolver.manifest("core").unwrap().version, v("1.3.0"));

    let major = resolver.update_plugin_version("core", v("2.0.0")).unwrap();
    assert_eq!(major.affected_plugins, vec!["ui", "chart"]);
}

#[test]
fn update_unknown_plugin_fails() {
    let mut resolver = DependencyResolver::new();
    assert!(matches!(
        resolver.update_plugin_version("ghost", v("1.0.0")),
        Err(DependencyError::PluginNotFound(_))
    ));
}

#[test]
fn dependents_and_tree() {
    let mut resolver = DependencyResolver::new();
    resolver.register_plugin(plugin("core", "1.0.0")).unwrap();
    resolver
        .register_plugin(
            plugin("ui", "1.0.0")
                .with_dependency(Dependency::required("core", v("1.0.0")))
                .with_dependency(Dependency::optional("icons", v("1.0.0"))),
        )
        .unwrap();

    assert_eq!(resolver.find_dependents("core"), vec!["ui"]);
    assert!(resolver.find_dependents("ui").is_empty());

    let tree = resolver.get_dependency_tree("ui").unwrap();
    assert_eq!(tree.size(), 3);
    let icons = tree
        .dependencies
        .iter()
        .find(|n| n.plugin_id == "icons")
        .unwrap();
    assert!(!icons.available);
    assert!(icons.optional);
}

#[test]
fn registry_info_counts() {
    let mut resolver = DependencyResolver::new();
    resolver.register_plugin(plugin("simple-calc", "1.0.0")).unwrap();
    resolver.register_plugin(adv_calc()).unwrap();
    resolver
        .register_plugin(
            plugin("sci-calc", "1.0.0")
                .with_dependency(Dependency::required("calc", v("1.0.0")).with_fallback("simple-calc")),
        )
        .unwrap();

    let info = resolver.get_registry_info();
    assert_eq!(info.total_plugins, 3);
    assert_eq!(info.total_dependencies, 2);
    assert_eq!(info.fallback_mappings, 1, "same fallback declared twice");

    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["total_plugins"], 3);
}

// ── Properties ──────────────────────────────────────────────────

proptest! {
    /// A chain registered in any order always loads dependencies first.
    #[test]
    fn chain_order_is_topological(len in 2usize..8, seed in any::<u64>()) {
        let mut resolver = DependencyResolver::new();
        let names: Vec<String> = (0..len).map(|i| format!("p{i}")).collect();
        for (i, name) in names.iter().enumerate() {
            let mut m = plugin(name, "1.0.0");
            if i > 0 {
                m = m.with_dependency(Dependency::required(names[i - 1].clone(), v("1.0.0")));
            }
            resolver.register_plugin(m).unwrap();
        }

        let mut shuffled = names.clone();
        shuffled.rotate_left((seed as usize) % len);
        let order = resolver.get_load_order(&shuffled).unwrap();
        prop_assert_eq!(order, names);
    }
}
