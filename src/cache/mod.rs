//! Per-domain persistent caching.
//!
//! Each data domain owns a [`CacheStore`] bound to its own key
//! namespace; no domain ever reads another's entries. Entries are full
//! replacements carrying their fetch time and an optional expiry, and
//! an expired entry is only served when the caller explicitly opts into
//! the stale-fallback path.

mod memory;

pub use memory::MemoryCache;

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Local, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::storage::KeyValueStore;

/// A cached value with its freshness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub cached_at: DateTime<Utc>,
    /// `None` means the entry never expires by time.
    pub expires_at: Option<DateTime<Utc>>,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if now > expiry)
    }
}

/// When a freshly written cache entry stops being served as fresh.
///
/// The board payload historically expired "at sundown"; the production
/// source shipped with a fixed 18:00 fallback instead. Both are policy
/// choices here: `DailyAt` covers the fixed cutoff and `Custom` is the
/// hook for an astronomically-correct provider.
pub enum CacheCutoff {
    /// Entry never expires by time.
    Never,
    /// Entry expires a fixed duration after the write.
    After(Duration),
    /// Entry expires at the next occurrence of a wall-clock time in
    /// the given UTC offset. The board's evening cutoff is a local
    /// time, not a UTC one.
    DailyAt {
        hour: u32,
        minute: u32,
        offset: FixedOffset,
    },
    /// Entry expires at a caller-computed instant.
    Custom(Box<dyn Fn(DateTime<Utc>) -> DateTime<Utc> + Send + Sync>),
}

impl CacheCutoff {
    /// Daily cutoff at the device's current local offset.
    pub fn daily_local(hour: u32, minute: u32) -> Self {
        CacheCutoff::DailyAt {
            hour,
            minute,
            offset: *Local::now().offset(),
        }
    }

    /// Computes the expiry instant for an entry written at `now`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CacheCutoff::Never => None,
            CacheCutoff::After(ttl) => Some(now + *ttl),
            CacheCutoff::DailyAt {
                hour,
                minute,
                offset,
            } => {
                let local_now = now.with_timezone(offset);
                // An out-of-range wall-clock time degrades to a one-day TTL.
                let cutoff = match local_now
                    .date_naive()
                    .and_hms_opt(*hour, *minute, 0)
                    .and_then(|t| t.and_local_timezone(*offset).single())
                {
                    Some(t) => t.with_timezone(&Utc),
                    None => return Some(now + Duration::days(1)),
                };
                if cutoff > now {
                    Some(cutoff)
                } else {
                    Some(cutoff + Duration::days(1))
                }
            }
            CacheCutoff::Custom(f) => Some(f(now)),
        }
    }
}

impl std::fmt::Debug for CacheCutoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheCutoff::Never => write!(f, "Never"),
            CacheCutoff::After(ttl) => write!(f, "After({})", ttl),
            CacheCutoff::DailyAt {
                hour,
                minute,
                offset,
            } => {
                write!(f, "DailyAt({:02}:{:02} {})", hour, minute, offset)
            }
            CacheCutoff::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Namespaced persistent cache for one data domain.
///
/// Values are serialized as JSON [`CacheEntry`]s through the injected
/// [`KeyValueStore`]. Storage failures degrade to cache misses: a
/// broken storage layer must never take a fetch path down with it.
pub struct CacheStore<T> {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> CacheStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            _payload: PhantomData,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn index_key(&self) -> String {
        format!("{}:__keys", self.namespace)
    }

    /// Returns the value for `key` if present and not expired.
    pub async fn get(&self, key: &str) -> Option<T> {
        let entry = self.entry(key).await?;
        if entry.is_expired() {
            tracing::debug!("cache entry {}:{} expired", self.namespace, key);
            return None;
        }
        Some(entry.value)
    }

    /// Returns the entry for `key` regardless of expiry. Used by the
    /// offline/stale fallback path.
    pub async fn get_ignoring_expiry(&self, key: &str) -> Option<CacheEntry<T>> {
        self.entry(key).await
    }

    async fn entry(&self, key: &str) -> Option<CacheEntry<T>> {
        let raw = match self.store.get(&self.storage_key(key)).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!("cache read failed for {}:{}: {}", self.namespace, key, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("cache entry {}:{} corrupt: {}", self.namespace, key, e);
                None
            }
        }
    }

    /// Stores `value`, fully replacing any previous entry.
    pub async fn set(&self, key: &str, value: &T, cutoff: &CacheCutoff) -> Result<(), DataCacheError> {
        let now = Utc::now();
        let entry = CacheEntry {
            value,
            cached_at: now,
            expires_at: cutoff.expires_at(now),
        };
        let json = serde_json::to_string(&entry).map_err(|e| DataCacheError(e.to_string()))?;
        self.store
            .set(&self.storage_key(key), &json)
            .await
            .map_err(|e| DataCacheError(e.to_string()))?;
        self.track_key(key).await;
        Ok(())
    }

    pub async fn remove(&self, key: &str) {
        if let Err(e) = self.store.remove(&self.storage_key(key)).await {
            tracing::warn!("cache remove failed for {}:{}: {}", self.namespace, key, e);
        }
        let mut keys = self.tracked_keys().await;
        keys.retain(|k| k != key);
        self.write_index(&keys).await;
    }

    /// Removes every entry in this namespace.
    pub async fn clear(&self) {
        for key in self.tracked_keys().await {
            if let Err(e) = self.store.remove(&self.storage_key(&key)).await {
                tracing::warn!("cache clear failed for {}:{}: {}", self.namespace, key, e);
            }
        }
        if let Err(e) = self.store.remove(&self.index_key()).await {
            tracing::warn!("cache index clear failed for {}: {}", self.namespace, e);
        }
    }

    async fn track_key(&self, key: &str) {
        let mut keys = self.tracked_keys().await;
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
            self.write_index(&keys).await;
        }
    }

    async fn tracked_keys(&self) -> Vec<String> {
        match self.store.get(&self.index_key()).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("cache index read failed for {}: {}", self.namespace, e);
                Vec::new()
            }
        }
    }

    async fn write_index(&self, keys: &[String]) {
        match serde_json::to_string(keys) {
            Ok(json) => {
                if let Err(e) = self.store.set(&self.index_key(), &json).await {
                    tracing::warn!("cache index write failed for {}: {}", self.namespace, e);
                }
            }
            Err(e) => tracing::warn!("cache index encode failed for {}: {}", self.namespace, e),
        }
    }
}

/// Error writing a cache entry. Callers treat this as non-fatal.
#[derive(Debug, thiserror::Error)]
#[error("cache write failed: {0}")]
pub struct DataCacheError(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{testing::FailingStore, MemoryStore};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        text: String,
        count: u32,
    }

    fn payload() -> Payload {
        Payload {
            text: "zmanim".into(),
            count: 7,
        }
    }

    fn cache() -> CacheStore<Payload> {
        CacheStore::new(Arc::new(MemoryStore::new()), "db")
    }

    #[tokio::test]
    async fn test_get_after_set_roundtrips() {
        let cache = cache();
        cache.set("data", &payload(), &CacheCutoff::Never).await.unwrap();
        assert_eq!(cache.get("data").await, Some(payload()));
        // Idempotent: a second read returns the same value.
        assert_eq!(cache.get("data").await, Some(payload()));
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        assert_eq!(cache().get("data").await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_not_served_fresh() {
        let cache = cache();
        // Negative TTL puts the expiry in the past immediately.
        let cutoff = CacheCutoff::After(Duration::seconds(-1));
        cache.set("data", &payload(), &cutoff).await.unwrap();

        assert_eq!(cache.get("data").await, None);

        // Stale fallback still sees it.
        let entry = cache.get_ignoring_expiry("data").await.unwrap();
        assert_eq!(entry.value, payload());
        assert!(entry.is_expired());
    }

    #[tokio::test]
    async fn test_unexpired_ttl_entry_served() {
        let cache = cache();
        let cutoff = CacheCutoff::After(Duration::minutes(30));
        cache.set("data", &payload(), &cutoff).await.unwrap();
        assert_eq!(cache.get("data").await, Some(payload()));
    }

    #[tokio::test]
    async fn test_set_fully_replaces() {
        let cache = cache();
        cache.set("data", &payload(), &CacheCutoff::Never).await.unwrap();
        let newer = Payload {
            text: "tfila".into(),
            count: 1,
        };
        cache.set("data", &newer, &CacheCutoff::Never).await.unwrap();
        assert_eq!(cache.get("data").await, Some(newer));
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let cache = cache();
        cache.set("a", &payload(), &CacheCutoff::Never).await.unwrap();
        cache.set("b", &payload(), &CacheCutoff::Never).await.unwrap();

        cache.remove("a").await;
        assert_eq!(cache.get("a").await, None);
        assert!(cache.get("b").await.is_some());

        cache.clear().await;
        assert_eq!(cache.get("b").await, None);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = Arc::new(MemoryStore::new());
        let db: CacheStore<Payload> = CacheStore::new(store.clone(), "db");
        let omer: CacheStore<Payload> = CacheStore::new(store, "omer");

        db.set("data", &payload(), &CacheCutoff::Never).await.unwrap();
        assert_eq!(omer.get("data").await, None);

        omer.clear().await;
        assert!(db.get("data").await.is_some());
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_to_miss() {
        let cache: CacheStore<Payload> = CacheStore::new(Arc::new(FailingStore), "db");
        assert_eq!(cache.get("data").await, None);
        assert!(cache.get_ignoring_expiry("data").await.is_none());
        assert!(cache.set("data", &payload(), &CacheCutoff::Never).await.is_err());
    }

    fn israel_cutoff() -> CacheCutoff {
        CacheCutoff::DailyAt {
            hour: 18,
            minute: 0,
            offset: FixedOffset::east_opt(2 * 3600).unwrap(),
        }
    }

    #[test]
    fn test_daily_cutoff_rolls_to_tomorrow() {
        let cutoff = israel_cutoff();

        // 11:00 local: expires at 18:00 local, which is 16:00 UTC.
        let morning = "2026-03-10T09:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(
            cutoff.expires_at(morning),
            Some("2026-03-10T16:00:00Z".parse().unwrap())
        );

        // 22:30 local, past the cutoff: rolls to tomorrow's.
        let evening = "2026-03-10T20:30:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(
            cutoff.expires_at(evening),
            Some("2026-03-11T16:00:00Z".parse().unwrap())
        );
    }

    #[test]
    fn test_daily_cutoff_uses_local_wall_clock() {
        // 17:00 UTC is 19:00 local, already past an 18:00 cutoff even
        // though the UTC clock has not reached 18:00 yet.
        let cutoff = israel_cutoff();
        let evening = "2026-03-10T17:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(
            cutoff.expires_at(evening),
            Some("2026-03-11T16:00:00Z".parse().unwrap())
        );
    }

    #[test]
    fn test_daily_local_cutoff_is_within_a_day() {
        let now = Utc::now();
        let expiry = CacheCutoff::daily_local(18, 0).expires_at(now).unwrap();
        assert!(expiry > now);
        assert!(expiry <= now + Duration::days(1));
    }

    #[test]
    fn test_custom_cutoff_hook() {
        let sundown = "2026-03-10T17:43:00Z".parse::<DateTime<Utc>>().unwrap();
        let cutoff = CacheCutoff::Custom(Box::new(move |_now| sundown));
        assert_eq!(cutoff.expires_at(Utc::now()), Some(sundown));
    }
}
