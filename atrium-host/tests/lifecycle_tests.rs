//! Plugin lifecycle through the `PluginManager` API.

use atrium_host::{
    HealthStatus, InstanceStatus, LifecycleHooks, OperationContext, PluginDescriptor, PluginFailure,
    PluginHostError, PluginManager, UnitOfWork,
};
use atrium_deps::DependencyError;
use atrium_types::{Dependency, ErrorKind, PluginManifest, PluginVersion};
use futures::future::{BoxFuture, join_all};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

// ================================================================
// Test plugins
// ================================================================

struct Echo;

impl UnitOfWork for Echo {
    fn handle(
        &self,
        _ctx: OperationContext,
        request: Value,
    ) -> BoxFuture<'_, Result<Value, PluginFailure>> {
        Box::pin(async move { Ok(request) })
    }
}

#[derive(Default)]
struct Hooks {
    loads: AtomicUsize,
    unloads: AtomicUsize,
    fail_load: bool,
    fail_unload: bool,
}

impl LifecycleHooks for Hooks {
    fn on_load(
        &self,
        _ctx: OperationContext,
        _initial_data: Option<Value>,
    ) -> BoxFuture<'_, Result<(), PluginFailure>> {
        Box::pin(async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_load {
                return Err(PluginFailure::runtime("database unavailable"));
            }
            Ok(())
        })
    }

    fn on_unload(&self, _ctx: OperationContext) -> BoxFuture<'_, Result<(), PluginFailure>> {
        Box::pin(async move {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            if self.fail_unload {
                return Err(PluginFailure::runtime("flush failed"));
            }
            Ok(())
        })
    }
}

fn v(s: &str) -> PluginVersion {
    PluginVersion::parse(s).unwrap()
}

fn manifest(id: &str) -> PluginManifest {
    PluginManifest::new(id, id, v("1.0.0"))
}

fn descriptor(manifest: PluginManifest) -> PluginDescriptor {
    PluginDescriptor::new(manifest, Arc::new(Echo))
}

fn with_hooks(manifest: PluginManifest, hooks: &Arc<Hooks>) -> PluginDescriptor {
    descriptor(manifest).with_hooks(Arc::clone(hooks) as Arc<dyn LifecycleHooks>)
}

fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

// ================================================================
// Registration
// ================================================================

#[tokio::test]
async fn duplicate_registration_rejected() {
    let manager = PluginManager::default();
    manager.register_plugin(descriptor(manifest("calc"))).unwrap();
    let err = manager
        .register_plugin(descriptor(manifest("calc")))
        .unwrap_err();
    assert!(matches!(err, PluginHostError::AlreadyRegistered(id) if id == "calc"));
}

#[tokio::test]
async fn invalid_manifest_rejected() {
    let manager = PluginManager::default();
    let err = manager
        .register_plugin(descriptor(PluginManifest::new("calc", " ", v("1.0.0"))))
        .unwrap_err();
    assert!(matches!(err, PluginHostError::InvalidManifest(_)));
    assert!(!manager.is_registered("calc"));
}

#[tokio::test]
async fn unregister_refused_while_in_use() {
    let manager = PluginManager::default();
    manager.register_plugin(descriptor(manifest("calc"))).unwrap();
    manager
        .register_plugin(descriptor(
            manifest("adv-calc").with_dependency(Dependency::required("calc", v("1.0.0"))),
        ))
        .unwrap();

    let err = manager.unregister_plugin("calc").await.unwrap_err();
    assert!(matches!(err, PluginHostError::PluginInUse { .. }));

    let instance = manager.load_plugin("adv-calc", None).await.unwrap();
    assert_err!(manager.unregister_plugin("adv-calc").await);

    manager.unload_plugin(instance).await.unwrap();
    manager.unregister_plugin("adv-calc").await.unwrap();
    manager.unregister_plugin("calc").await.unwrap();
    assert!(!manager.is_registered("calc"));
}

// ================================================================
// Loading
// ================================================================

#[tokio::test]
async fn calc_scenario_loads_through_fallback() {
    let manager = PluginManager::default();
    manager
        .register_plugin(descriptor(manifest("adv-calc").with_dependency(
            Dependency::required("calc", v("1.0.0")).with_fallback("simple-calc"),
        )))
        .unwrap();
    manager
        .register_plugin(descriptor(manifest("simple-calc")))
        .unwrap();

    let check = manager.check_dependencies("adv-calc").unwrap();
    assert!(check.compatible);
    assert_eq!(check.available_fallbacks, vec!["simple-calc"]);

    let instance = manager.load_plugin("adv-calc", None).await.unwrap();
    let loaded = manager.get_instance(instance).await.unwrap();
    assert_eq!(loaded.status, InstanceStatus::Running);
    assert_eq!(
        manager
            .invoke_plugin(instance, json!({"op": "add", "args": [1, 2]}), None)
            .await
            .unwrap(),
        json!({"op": "add", "args": [1, 2]})
    );
}

#[tokio::test]
async fn unresolved_dependency_fails_before_sandbox() {
    let manager = PluginManager::default();
    manager
        .register_plugin(descriptor(
            manifest("charts").with_dependency(Dependency::required("renderer", v("2.0.0"))),
        ))
        .unwrap();

    let err = manager.load_plugin("charts", None).await.unwrap_err();
    assert!(matches!(err, PluginHostError::Dependency(_)));
    assert!(manager.sandboxes().is_empty());
    assert!(manager.list_instances().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_loads_run_on_load_once() {
    let manager = PluginManager::default();
    let hooks = Arc::new(Hooks::default());
    manager
        .register_plugin(with_hooks(manifest("calc"), &hooks))
        .unwrap();

    let results = join_all((0..5).map(|_| manager.load_plugin("calc", None))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(hooks.loads.load(Ordering::SeqCst), 1);
    assert_eq!(manager.list_instances().await.len(), 5);
    assert_eq!(manager.sandboxes().get_plugin_sandboxes("calc").len(), 5);
}

#[tokio::test(start_paused = true)]
async fn failed_on_load_leaves_instance_in_error() {
    let manager = PluginManager::default();
    let hooks = Arc::new(Hooks {
        fail_load: true,
        ..Hooks::default()
    });
    manager
        .register_plugin(with_hooks(manifest("calc"), &hooks))
        .unwrap();

    let err = manager.load_plugin("calc", None).await.unwrap_err();
    let (instance_id, message) = match err {
        PluginHostError::InitializationFailed {
            instance_id,
            message,
            ..
        } => (instance_id, message),
        other => panic!("expected initialization failure, got {other:?}"),
    };
    assert_eq!(message, "database unavailable");

    let instance = manager.get_instance(instance_id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Error);
    assert_eq!(instance.error_count, 1);

    let sandbox = manager.get_instance_sandbox(instance_id).await.unwrap();
    assert_eq!(sandbox.errors.len(), 1);
    assert_eq!(sandbox.errors[0].kind, ErrorKind::Runtime);

    // Failures are not memoized: the next load runs the hook again.
    let _ = manager.load_plugin("calc", None).await;
    assert_eq!(hooks.loads.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn batch_load_skips_dependents_of_failures() {
    let manager = PluginManager::default();
    let broken = Arc::new(Hooks {
        fail_load: true,
        ..Hooks::default()
    });
    manager
        .register_plugin(with_hooks(manifest("storage"), &broken))
        .unwrap();
    manager
        .register_plugin(descriptor(
            manifest("sync").with_dependency(Dependency::required("storage", v("1.0.0"))),
        ))
        .unwrap();
    manager
        .register_plugin(descriptor(
            manifest("backup").with_dependency(Dependency::required("sync", v("1.0.0"))),
        ))
        .unwrap();
    manager.register_plugin(descriptor(manifest("clock"))).unwrap();

    let report = manager
        .load_plugins_in_order(&ids(&["backup", "sync", "storage", "clock"]))
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "storage");
    assert_eq!(report.skipped, ids(&["sync", "backup"]));
    assert_eq!(report.loaded.len(), 1);
    assert_eq!(report.loaded[0].0, "clock");
    assert!(!report.is_complete());
}

#[tokio::test]
async fn load_order_rejects_cycles() {
    let manager = PluginManager::default();
    manager
        .register_plugin(descriptor(
            manifest("a").with_dependency(Dependency::required("b", v("1.0.0"))),
        ))
        .unwrap();
    manager
        .register_plugin(descriptor(
            manifest("b").with_dependency(Dependency::required("a", v("1.0.0"))),
        ))
        .unwrap();

    assert!(manager.get_load_order(&ids(&["a", "b"])).is_err());
    assert!(
        manager
            .load_plugins_in_order(&ids(&["a", "b"]))
            .await
            .is_err()
    );
    assert_eq!(
        manager.get_dependency_registry_info().circular_dependencies,
        ids(&["a", "b"])
    );
}

#[tokio::test]
async fn cyclic_plugins_never_load() {
    let manager = PluginManager::default();
    manager
        .register_plugin(descriptor(
            manifest("a").with_dependency(Dependency::required("b", v("1.0.0"))),
        ))
        .unwrap();
    manager
        .register_plugin(descriptor(
            manifest("b").with_dependency(Dependency::required("a", v("1.0.0"))),
        ))
        .unwrap();
    manager
        .register_plugin(descriptor(
            manifest("dashboard").with_dependency(Dependency::required("a", v("1.0.0"))),
        ))
        .unwrap();

    for plugin_id in ["a", "b", "dashboard"] {
        let err = manager.load_plugin(plugin_id, None).await.unwrap_err();
        assert!(
            matches!(
                err,
                PluginHostError::Dependency(DependencyError::CircularDependency { .. })
            ),
            "{plugin_id}: {err:?}"
        );
    }
    assert!(manager.sandboxes().is_empty());
    assert!(manager.list_instances().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn batch_load_follows_fallbacks() {
    let manager = PluginManager::default();
    let broken = Arc::new(Hooks {
        fail_load: true,
        ..Hooks::default()
    });
    manager
        .register_plugin(descriptor(manifest("adv-calc").with_dependency(
            Dependency::required("calc", v("1.0.0")).with_fallback("simple-calc"),
        )))
        .unwrap();
    manager
        .register_plugin(with_hooks(manifest("simple-calc"), &broken))
        .unwrap();

    let requested = ids(&["adv-calc", "simple-calc"]);
    assert_eq!(
        manager.get_load_order(&requested).unwrap(),
        ids(&["simple-calc", "adv-calc"])
    );

    let report = manager.load_plugins_in_order(&requested).await.unwrap();
    assert!(report.loaded.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "simple-calc");
    assert_eq!(report.skipped, ids(&["adv-calc"]));
}

// ================================================================
// Pause / resume / unload
// ================================================================

#[tokio::test]
async fn paused_instance_rejects_execution() {
    let manager = PluginManager::default();
    manager.register_plugin(descriptor(manifest("calc"))).unwrap();
    let instance = manager.load_plugin("calc", None).await.unwrap();

    manager.pause_plugin(instance).await.unwrap();
    let err = manager
        .invoke_plugin(instance, json!(1), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PluginHostError::InvalidInstanceState {
            status: InstanceStatus::Paused,
            ..
        }
    ));
    assert!(manager.pause_plugin(instance).await.is_err());

    manager.resume_plugin(instance).await.unwrap();
    assert_eq!(
        manager.invoke_plugin(instance, json!(1), None).await.unwrap(),
        json!(1)
    );
}

#[tokio::test]
async fn unload_terminates_even_when_on_unload_fails() {
    let manager = PluginManager::default();
    let hooks = Arc::new(Hooks {
        fail_unload: true,
        ..Hooks::default()
    });
    manager
        .register_plugin(with_hooks(manifest("calc"), &hooks))
        .unwrap();
    let instance = manager.load_plugin("calc", None).await.unwrap();

    assert_ok!(manager.unload_plugin(instance).await);
    assert_eq!(hooks.unloads.load(Ordering::SeqCst), 1);
    assert!(manager.get_instance(instance).await.is_none());
    assert!(manager.sandboxes().is_empty());
    assert!(
        manager
            .get_resource_pool_status()
            .iter()
            .all(|pool| pool.used == 0)
    );
    assert!(matches!(
        manager.unload_plugin(instance).await,
        Err(PluginHostError::InstanceNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn last_unload_evicts_memoized_load() {
    let manager = PluginManager::default();
    let hooks = Arc::new(Hooks::default());
    manager
        .register_plugin(with_hooks(manifest("calc"), &hooks))
        .unwrap();

    let first = manager.load_plugin("calc", None).await.unwrap();
    let second = manager.load_plugin("calc", None).await.unwrap();
    assert_eq!(hooks.loads.load(Ordering::SeqCst), 1);

    manager.unload_plugin(first).await.unwrap();
    manager.unload_plugin(second).await.unwrap();
    manager.load_plugin("calc", None).await.unwrap();
    assert_eq!(hooks.loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_unloads_everything() {
    let manager = PluginManager::default();
    manager.register_plugin(descriptor(manifest("calc"))).unwrap();
    manager.register_plugin(descriptor(manifest("notes"))).unwrap();
    manager.load_plugin("calc", None).await.unwrap();
    manager.load_plugin("notes", None).await.unwrap();

    manager.shutdown().await;
    assert!(manager.list_instances().await.is_empty());
    assert!(manager.sandboxes().is_empty());
    assert!(matches!(
        manager.load_plugin("calc", None).await,
        Err(PluginHostError::ShuttingDown)
    ));
}

// ================================================================
// Observability
// ================================================================

#[tokio::test]
async fn events_follow_the_lifecycle() {
    let manager = PluginManager::default();
    let mut events = manager.subscribe();
    manager.register_plugin(descriptor(manifest("calc"))).unwrap();
    let instance = manager.load_plugin("calc", None).await.unwrap();
    manager.unload_plugin(instance).await.unwrap();

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec![
            "plugin_registered",
            "instance_status_changed",
            "instance_loaded",
            "instance_status_changed",
            "instance_unloaded",
        ]
    );
}

#[tokio::test]
async fn executions_feed_metrics() {
    let manager = PluginManager::default();
    manager
        .register_plugin(descriptor(
            manifest("feeds").with_permission(atrium_types::Permission::Network),
        ))
        .unwrap();
    let instance = manager.load_plugin("feeds", None).await.unwrap();

    for _ in 0..2 {
        manager
            .execute_plugin(
                instance,
                |ctx| async move {
                    ctx.record_network_request()?;
                    ctx.allocate_memory(12)?;
                    ctx.release_memory(12);
                    Ok(())
                },
                None,
            )
            .await
            .unwrap();
    }

    let metrics = manager.get_metrics("feeds").unwrap();
    assert_eq!(metrics.executions, 2);
    assert_eq!(metrics.network_requests, 2);
    assert_eq!(metrics.errors, 0);

    let health = manager.get_plugin_health("feeds").await.unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.resource_usage.network_requests, 2);
}

#[tokio::test]
async fn instances_share_the_plugin_cache() {
    let manager = PluginManager::default();
    manager.register_plugin(descriptor(manifest("calc"))).unwrap();
    let first = manager.load_plugin("calc", None).await.unwrap();
    let second = manager.load_plugin("calc", None).await.unwrap();

    let computed = manager
        .execute_plugin(
            first,
            |ctx| async move {
                if let Some(hit) = ctx.cache_get("sum:1+2") {
                    return Ok(hit);
                }
                ctx.cache_set("sum:1+2", json!(3));
                Ok(json!(3))
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(computed, json!(3));

    let cached = manager
        .execute_plugin(second, |ctx| async move { Ok(ctx.cache_get("sum:1+2")) }, None)
        .await
        .unwrap();
    assert_eq!(cached, Some(json!(3)));

    let stats = manager.get_cache_stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);

    manager.unload_plugin(first).await.unwrap();
    manager.unload_plugin(second).await.unwrap();
    manager.unregister_plugin("calc").await.unwrap();
    assert_eq!(manager.get_cache_stats().size, 0);
}
