//! Response Cache
//!
//! Small keyed cache with a per-cache TTL for upstream REST responses
//! (quotes snapshots, symbol metadata). Keys are derived from a namespace and
//! the request parameters, so the same parameters in any field order hit the
//! same entry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Thread-safe TTL cache.
#[derive(Debug)]
pub struct ResponseCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    ttl: Duration,
}

impl<V: Clone> ResponseCache<V> {
    /// Create a cache whose entries live for `ttl`.
    ///
    /// A zero TTL disables the cache: `set` becomes a no-op.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Entry lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Build a stable key from a namespace and request parameters.
    ///
    /// Object keys are sorted at every depth; array order is kept.
    #[must_use]
    pub fn generate_key(namespace: &str, params: &Value) -> String {
        let mut key = String::with_capacity(namespace.len() + 32);
        key.push_str(namespace);
        key.push(':');
        write_canonical(params, &mut key);
        key
    }

    /// Cached value for `key` if present and not expired.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_at(key.into(), value, Instant::now());
    }

    /// Drop expired entries and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        self.entries
            .read()
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone())
    }

    fn set_at(&self, key: String, value: V, now: Instant) {
        if self.ttl.is_zero() {
            return;
        }

        let entry = CacheEntry {
            value,
            expires_at: now + self.ttl,
        };
        self.entries.write().insert(key, entry);
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        let purged = before - entries.len();
        drop(entries);

        if purged > 0 {
            tracing::debug!(purged, "Purged expired cache entries");
        }
        purged
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    type Cache = ResponseCache<String>;

    #[test]
    fn key_ignores_field_order() {
        let a = Cache::generate_key("quotes", &json!({"symbol": "EURUSD", "range": "1d"}));
        let b = Cache::generate_key("quotes", &json!({"range": "1d", "symbol": "EURUSD"}));
        assert_eq!(a, b);
        assert_eq!(a, r#"quotes:{"range":"1d","symbol":"EURUSD"}"#);
    }

    #[test]
    fn key_sorts_nested_objects_and_keeps_arrays() {
        let key = Cache::generate_key(
            "batch",
            &json!({"symbols": ["USDJPY", "EURUSD"], "opts": {"z": 1, "a": true}}),
        );
        assert_eq!(
            key,
            r#"batch:{"opts":{"a":true,"z":1},"symbols":["USDJPY","EURUSD"]}"#
        );
    }

    #[test]
    fn namespaces_do_not_collide() {
        let params = json!({"symbol": "XAUUSD"});
        assert_ne!(
            Cache::generate_key("quotes", &params),
            Cache::generate_key("profile", &params)
        );
    }

    #[test]
    fn get_and_overwrite() {
        let cache = Cache::new(Duration::from_secs(60));
        assert!(cache.get("k").is_none());

        cache.set("k", "v1".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("v1"));

        cache.set("k", "v2".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("v2"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = Cache::new(Duration::from_secs(30));
        let start = Instant::now();
        cache.set_at("k".to_string(), "v".to_string(), start);

        assert!(cache.get_at("k", start + Duration::from_secs(29)).is_some());
        assert!(cache.get_at("k", start + Duration::from_secs(30)).is_none());
    }

    #[test]
    fn purge_removes_only_expired() {
        let cache = Cache::new(Duration::from_secs(10));
        let start = Instant::now();
        cache.set_at("old".to_string(), "a".to_string(), start);
        cache.set_at("new".to_string(), "b".to_string(), start + Duration::from_secs(8));

        assert_eq!(cache.purge_expired_at(start + Duration::from_secs(12)), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_at("new", start + Duration::from_secs(12)).is_some());
    }

    #[test]
    fn zero_ttl_disables() {
        let cache = Cache::new(Duration::ZERO);
        cache.set("k", "v".to_string());
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_empties() {
        let cache = Cache::new(Duration::from_secs(60));
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());
        cache.clear();
        assert!(cache.is_empty());
    }
}
