//! Lazy-load memoization.

use crate::{PerfError, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, warn};

type LoadFuture = Shared<BoxFuture<'static, std::result::Result<Value, String>>>;

/// Deduplicates plugin initialization: the first caller's loader runs, every
/// concurrent or later caller awaits the same shared future.
///
/// A successful result stays memoized until [`LazyLoader::evict`]. A failed
/// load is forgotten so the next caller retries.
#[derive(Default)]
pub struct LazyLoader {
    loads: Mutex<HashMap<String, LoadFuture>>,
}

impl LazyLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load<F, Fut>(&self, plugin_id: &str, loader: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        let load = {
            let mut loads = self.loads.lock();
            match loads.get(plugin_id) {
                Some(existing) => {
                    debug!(plugin_id = %plugin_id, "Joining in-flight plugin load");
                    existing.clone()
                }
                None => {
                    let load = loader().boxed().shared();
                    loads.insert(plugin_id.to_string(), load.clone());
                    load
                }
            }
        };

        match load.clone().await {
            Ok(value) => Ok(value),
            Err(message) => {
                let mut loads = self.loads.lock();
                if loads.get(plugin_id).is_some_and(|current| current.ptr_eq(&load)) {
                    loads.remove(plugin_id);
                }
                drop(loads);
                warn!(plugin_id = %plugin_id, error = %message, "Plugin load failed");
                Err(PerfError::LoadFailed {
                    plugin_id: plugin_id.to_string(),
                    message,
                })
            }
        }
    }

    /// Forgets the memoized load of `plugin_id`.
    pub fn evict(&self, plugin_id: &str) -> bool {
        self.loads.lock().remove(plugin_id).is_some()
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.loads
            .lock()
            .get(plugin_id)
            .and_then(|load| load.peek())
            .is_some_and(|result| result.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_loads_run_loader_once() {
        let lazy = Arc::new(LazyLoader::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let calls = (0..5).map(|_| {
            let lazy = Arc::clone(&lazy);
            let runs = Arc::clone(&runs);
            async move {
                lazy.load("calc", move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(json!("ready"))
                })
                .await
            }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|v| v == "ready")));
        assert!(lazy.is_loaded("calc"));
    }

    #[tokio::test]
    async fn failure_is_not_memoized() {
        let lazy = LazyLoader::new();
        let err = lazy
            .load("calc", || async { Err("bad config".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, PerfError::LoadFailed { .. }));
        assert!(!lazy.is_loaded("calc"));

        let value = lazy.load("calc", || async { Ok(json!(1)) }).await.unwrap();
        assert_eq!(value, json!(1));
    }

    #[tokio::test]
    async fn evict_allows_reload() {
        let lazy = LazyLoader::new();
        lazy.load("calc", || async { Ok(json!(1)) }).await.unwrap();
        assert_eq!(
            lazy.load("calc", || async { Ok(json!(2)) }).await.unwrap(),
            json!(1)
        );
        assert!(lazy.evict("calc"));
        assert_eq!(
            lazy.load("calc", || async { Ok(json!(2)) }).await.unwrap(),
            json!(2)
        );
    }
}
