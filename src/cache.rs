// =============================================================================
// TTL Cache — ephemeral key/value state with per-entry expiry
// =============================================================================
//
// Backs the order table snapshots and ticker caches. Entries expire lazily on
// read; `sweep` exists for the periodic janitor task.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;

/// Default TTL for durable-ish entries (orders, strategies, rules): 24 h.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

/// TTL for ticker snapshots: 5 minutes.
pub const TICKER_TTL: Duration = Duration::from_secs(300);

struct Entry {
    value: Value,
    expires_at: Instant,
}

/// Thread-safe in-memory key/value cache with per-entry TTL.
pub struct TtlCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Store `value` under `key` for `ttl`.
    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().insert(key.into(), entry);
    }

    /// Fetch a live entry; expired entries read as absent and are dropped.
    pub fn get(&self, key: &str) -> Option<Value> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(e) if e.expires_at > Instant::now() => return Some(e.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: upgrade to a write lock and evict.
        self.entries.write().remove(key);
        None
    }

    /// Remove a key. Returns `true` when it existed and was live.
    pub fn del(&self, key: &str) -> bool {
        self.entries
            .write()
            .remove(key)
            .map(|e| e.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Drop all expired entries; returns the number evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    /// Live entry count (may include not-yet-swept expired entries).
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_del_round_trip() {
        let cache = TtlCache::new();
        cache.set("order:1", json!({"status": "open"}), DEFAULT_TTL);

        assert_eq!(cache.get("order:1").unwrap()["status"], "open");
        assert!(cache.del("order:1"));
        assert!(cache.get("order:1").is_none());
        assert!(!cache.del("order:1"));
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let cache = TtlCache::new();
        cache.set("t", json!(1), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get("t").is_none());
        // Lazy eviction removed the entry on read.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn sweep_evicts_only_expired() {
        let cache = TtlCache::new();
        cache.set("dead", json!(1), Duration::from_millis(0));
        cache.set("live", json!(2), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("live").is_some());
    }
}
