//! Bounded in-memory cache with LRU eviction.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(expiry) if now > expiry)
    }
}

/// Capacity-bounded key-value cache held entirely in memory.
///
/// When full, inserting a new key evicts the least-recently-accessed
/// entry. An optional per-entry TTL makes `get` return `None` once it
/// elapses, without any explicit cleanup.
pub struct MemoryCache<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
    max_entries: usize,
}

impl<V: Clone> MemoryCache<V> {
    /// Creates a cache holding at most `max_entries` values.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Returns the value for `key` if present and unexpired, marking it
    /// as recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            return None;
        }

        let entry = entries.get_mut(key)?;
        entry.last_accessed = now;
        Some(entry.value.clone())
    }

    /// Inserts `value`, evicting the least-recently-accessed entry if
    /// the cache is full and `key` is new. `ttl == None` never expires.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
            {
                tracing::debug!("memory cache full, evicting {}", oldest);
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at: now,
                last_accessed: now,
                expires_at: ttl.map(|d| now + d),
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Whether `key` is present and unexpired.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            return false;
        }
        entries.contains_key(key)
    }

    /// Drops every expired entry.
    pub fn clean_expired(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .retain(|_, e| !e.is_expired(now));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of the entry for `key`, if present.
    pub fn age(&self, key: &str) -> Option<Duration> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|e| e.created_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_after_set_roundtrips() {
        let cache = MemoryCache::new(10);
        cache.set("key", 42u32, None);
        assert_eq!(cache.get("key"), Some(42));
        assert_eq!(cache.get("key"), Some(42));
    }

    #[test]
    fn test_ttl_zero_expires_immediately() {
        let cache = MemoryCache::new(10);
        cache.set("key", 1u32, Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get("key"), None);
        assert!(!cache.has("key"));
    }

    #[test]
    fn test_long_ttl_still_fresh() {
        let cache = MemoryCache::new(10);
        cache.set("key", 1u32, Some(Duration::from_secs(60)));
        assert_eq!(cache.get("key"), Some(1));
    }

    #[test]
    fn test_lru_eviction_on_full_insert() {
        let cache = MemoryCache::new(2);
        cache.set("a", 1u32, None);
        cache.set("b", 2u32, None);

        // Touch "a" so "b" becomes the least recently used.
        assert_eq!(cache.get("a"), Some(1));

        cache.set("c", 3u32, None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_overwriting_existing_key_does_not_evict() {
        let cache = MemoryCache::new(2);
        cache.set("a", 1u32, None);
        cache.set("b", 2u32, None);
        cache.set("a", 10u32, None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn test_clean_expired_removes_only_expired() {
        let cache = MemoryCache::new(10);
        cache.set("stale", 1u32, Some(Duration::ZERO));
        cache.set("fresh", 2u32, Some(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(2));

        cache.clean_expired();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fresh"), Some(2));
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = MemoryCache::new(10);
        cache.set("a", 1u32, None);
        cache.set("b", 2u32, None);
        cache.remove("a");
        assert_eq!(cache.get("a"), None);
        cache.clear();
        assert!(cache.is_empty());
    }
}
