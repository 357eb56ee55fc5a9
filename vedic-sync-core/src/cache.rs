//! Expiring in-memory content cache, fed by applied data changes.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::event::{record_id_of, ChangeKind};
use crate::events::DataChanged;
use crate::platform::Clock;

/// Default time to live for cached entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
struct CacheEntry {
    data: Value,
    stored_at: i64,
    expires_at: i64,
}

/// Hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
}

impl CacheMetrics {
    /// Percentage of lookups that hit, 0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

/// `(store, key) -> value` cache with per-entry expiry.
#[derive(Debug)]
pub struct ContentCache<C: Clock> {
    clock: C,
    default_ttl: Duration,
    stores: BTreeMap<String, HashMap<String, CacheEntry>>,
    metrics: CacheMetrics,
}

impl<C: Clock> ContentCache<C> {
    pub fn new(clock: C) -> Self {
        Self::with_default_ttl(clock, DEFAULT_TTL)
    }

    pub fn with_default_ttl(clock: C, default_ttl: Duration) -> Self {
        Self {
            clock,
            default_ttl,
            stores: BTreeMap::new(),
            metrics: CacheMetrics::default(),
        }
    }

    /// Stores a value, replacing any previous one. `ttl` defaults to the
    /// cache's default.
    pub fn set(&mut self, store: &str, key: &str, data: Value, ttl: Option<Duration>) {
        let now = self.clock.now_millis();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry {
            data,
            stored_at: now,
            expires_at: now.saturating_add(ttl.as_millis() as i64),
        };
        self.stores
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), entry);
    }

    /// Returns a live value. An expired entry is removed and reported as
    /// missing.
    pub fn get(&mut self, store: &str, key: &str) -> Option<&Value> {
        let now = self.clock.now_millis();
        let entries = self.stores.get_mut(store);
        let Some(entries) = entries else {
            self.metrics.misses += 1;
            return None;
        };

        if entries.get(key).is_some_and(|e| now > e.expires_at) {
            entries.remove(key);
        }
        match entries.get(key) {
            Some(entry) => {
                self.metrics.hits += 1;
                Some(&entry.data)
            }
            None => {
                self.metrics.misses += 1;
                None
            }
        }
    }

    /// When the live entry for a key was stored.
    pub fn stored_at(&self, store: &str, key: &str) -> Option<i64> {
        let now = self.clock.now_millis();
        self.stores
            .get(store)?
            .get(key)
            .filter(|e| now <= e.expires_at)
            .map(|e| e.stored_at)
    }

    pub fn delete(&mut self, store: &str, key: &str) -> bool {
        self.stores
            .get_mut(store)
            .is_some_and(|entries| entries.remove(key).is_some())
    }

    /// Empties one store.
    pub fn clear(&mut self, store: &str) {
        if let Some(entries) = self.stores.get_mut(store) {
            entries.clear();
        }
    }

    pub fn clear_all(&mut self) {
        self.stores.clear();
    }

    /// Removes every expired entry. Returns how many were removed.
    pub fn clean_expired(&mut self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        for entries in self.stores.values_mut() {
            let before = entries.len();
            entries.retain(|_, e| now <= e.expires_at);
            removed += before - entries.len();
        }
        removed
    }

    /// Number of entries held per store.
    pub fn stats(&self) -> BTreeMap<String, usize> {
        self.stores
            .iter()
            .map(|(store, entries)| (store.clone(), entries.len()))
            .collect()
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = CacheMetrics::default();
    }

    /// Cache key used for an applied change: `<entity>_<id>`, or
    /// `<entity>_current` when the payload has no id.
    pub fn key_for(change: &DataChanged) -> String {
        let id = record_id_of(change.kind, &change.data).unwrap_or_else(|| "current".to_string());
        format!("{}_{}", change.entity, id)
    }

    /// Mirrors an applied change: create/update store the payload, delete
    /// removes it. Control events are ignored.
    pub fn apply(&mut self, change: &DataChanged) {
        let key = Self::key_for(change);
        match change.kind {
            ChangeKind::Create | ChangeKind::Update => {
                self.set(&change.entity, &key, change.data.clone(), None);
            }
            ChangeKind::Delete => {
                self.delete(&change.entity, &key);
            }
            ChangeKind::SyncRequest | ChangeKind::SyncResponse => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ManualClock;
    use serde_json::json;

    fn change(kind: ChangeKind, data: Value) -> DataChanged {
        DataChanged {
            kind,
            entity: "offering".to_string(),
            data,
            timestamp: 0,
        }
    }

    #[test]
    fn test_get_expires_entries() {
        let clock = ManualClock::new(0);
        let mut cache = ContentCache::new(clock.clone());
        cache.set("teacher", "profile", json!({"name": "A"}), Some(Duration::from_secs(60)));

        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.get("teacher", "profile"), Some(&json!({"name": "A"})));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get("teacher", "profile"), None);
        assert_eq!(cache.stats().get("teacher"), Some(&0));
        assert_eq!(cache.metrics(), CacheMetrics { hits: 1, misses: 1 });
        assert_eq!(cache.metrics().hit_rate(), 50.0);
    }

    #[test]
    fn test_clean_expired_sweeps_every_store() {
        let clock = ManualClock::new(0);
        let mut cache = ContentCache::with_default_ttl(clock.clone(), Duration::from_secs(10));
        cache.set("content", "master", json!(1), None);
        cache.set("metadata", "m", json!(2), Some(Duration::from_secs(100)));
        cache.set("offerings", "current", json!(3), None);

        clock.advance(Duration::from_secs(11));
        assert_eq!(cache.clean_expired(), 2);
        let stats = cache.stats();
        assert_eq!(stats["content"], 0);
        assert_eq!(stats["metadata"], 1);
    }

    #[test]
    fn test_apply_mirrors_changes() {
        let mut cache = ContentCache::new(ManualClock::new(0));
        cache.apply(&change(ChangeKind::Create, json!({"id": "x", "price": 1})));
        assert_eq!(
            cache.get("offering", "offering_x"),
            Some(&json!({"id": "x", "price": 1}))
        );

        cache.apply(&change(ChangeKind::Update, json!({"price": 2})));
        assert_eq!(cache.get("offering", "offering_current"), Some(&json!({"price": 2})));

        cache.apply(&change(ChangeKind::Delete, json!({"id": "x"})));
        assert_eq!(cache.get("offering", "offering_x"), None);
        assert_eq!(cache.stored_at("offering", "offering_current"), Some(0));
    }

    #[test]
    fn test_apply_delete_by_bare_id() {
        let mut cache = ContentCache::new(ManualClock::new(0));
        cache.apply(&change(ChangeKind::Create, json!({"id": "x"})));
        assert_eq!(
            ContentCache::<ManualClock>::key_for(&change(ChangeKind::Delete, json!("x"))),
            "offering_x"
        );

        cache.apply(&change(ChangeKind::Delete, json!("x")));
        assert_eq!(cache.get("offering", "offering_x"), None);
    }

    #[test]
    fn test_clear() {
        let mut cache = ContentCache::new(ManualClock::new(0));
        cache.set("a", "k", json!(1), None);
        cache.set("b", "k", json!(1), None);
        cache.clear("a");
        assert_eq!(cache.stats()["a"], 0);
        assert_eq!(cache.stats()["b"], 1);
        cache.clear_all();
        assert!(cache.stats().is_empty());
    }
}
