//! TTL cache for plugin results, namespaced by plugin id.

use crate::CacheConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Snapshot returned by [`PluginCache::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 when nothing was looked up yet.
    pub hit_rate: f64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

struct Entry {
    value: Value,
    inserted: Instant,
    expires: Instant,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<(String, String), Entry>,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn purge_expired(&mut self, now: Instant) {
        self.entries.retain(|_, e| e.expires > now);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.inserted)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

pub struct PluginCache {
    ttl: Duration,
    max_entries: usize,
    state: Mutex<CacheState>,
}

impl PluginCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            ttl: config.ttl(),
            max_entries: config.max_entries.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Looks up `key` for `plugin_id`. Expired entries count as misses.
    pub fn get(&self, plugin_id: &str, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let lookup = (plugin_id.to_string(), key.to_string());
        match state.entries.get(&lookup) {
            Some(entry) if entry.expires > now => {
                let value = entry.value.clone();
                state.hits += 1;
                Some(value)
            }
            Some(_) => {
                state.entries.remove(&lookup);
                state.misses += 1;
                None
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Stores a value with the default TTL.
    pub fn set(&self, plugin_id: &str, key: &str, value: Value) {
        self.set_with_ttl(plugin_id, key, value, self.ttl);
    }

    pub fn set_with_ttl(&self, plugin_id: &str, key: &str, value: Value, ttl: Duration) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let slot = (plugin_id.to_string(), key.to_string());
        if !state.entries.contains_key(&slot) && state.entries.len() >= self.max_entries {
            state.purge_expired(now);
            if state.entries.len() >= self.max_entries {
                state.evict_oldest();
            }
        }
        state.entries.insert(
            slot,
            Entry {
                value,
                inserted: now,
                expires: now + ttl,
                created_at: Utc::now(),
            },
        );
    }

    pub fn remove(&self, plugin_id: &str, key: &str) -> Option<Value> {
        self.state
            .lock()
            .entries
            .remove(&(plugin_id.to_string(), key.to_string()))
            .map(|e| e.value)
    }

    /// Drops every entry of `plugin_id`, leaving other plugins untouched.
    pub fn clear_plugin_cache(&self, plugin_id: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|(owner, _), _| owner != plugin_id);
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(plugin_id = %plugin_id, removed, "Plugin cache cleared");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        let lookups = state.hits + state.misses;
        CacheStats {
            size: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
            oldest_entry: state.entries.values().map(|e| e.created_at).min(),
            newest_entry: state.entries.values().map(|e| e.created_at).max(),
        }
    }
}
