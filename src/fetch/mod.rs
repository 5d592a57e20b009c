//! Per-domain fetch orchestration.
//!
//! A [`DomainFetcher`] runs the offline-first sequence for one data
//! domain: serve fresh cache, otherwise check connectivity, fetch from
//! the remote source with bounded retries, write through to the cache,
//! and fall back to stale cache when the network path fails. Fetchers
//! never panic on failure; every outcome is a [`DomainResult`].

mod http;
pub mod sources;

pub use http::HttpClient;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::cache::{CacheCutoff, CacheEntry, CacheStore};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{DataError, ErrorInfo, ErrorLog};
use crate::retry::RetryController;

/// Storage key for the single payload each domain caches.
const DATA_KEY: &str = "data";

/// The data domains the engine aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Core board payload from the community server.
    CoreDb,
    /// Daily halacha text.
    Halacha,
    /// Hebrew calendar events.
    Calendar,
    /// Omer count.
    Omer,
    /// Weekly Torah portion.
    Parasha,
    /// Detailed halachic times.
    Zmanim,
}

impl Domain {
    /// Cache namespace for the domain.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::CoreDb => "db",
            Domain::Halacha => "halacha",
            Domain::Calendar => "calendar",
            Domain::Omer => "omer",
            Domain::Parasha => "parasha",
            Domain::Zmanim => "zmanim",
        }
    }

    pub const ALL: [Domain; 6] = [
        Domain::CoreDb,
        Domain::Halacha,
        Domain::Calendar,
        Domain::Omer,
        Domain::Parasha,
        Domain::Zmanim,
    ];
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote endpoint for one domain's payload.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    type Payload;

    async fn fetch(&self) -> Result<Self::Payload, DataError>;
}

/// Outcome of one domain fetch.
///
/// `data` and `error` can both be set: a stale cache entry served after
/// a failed network attempt carries the data alongside the error that
/// forced the fallback.
#[derive(Debug, Clone)]
pub struct DomainResult<T> {
    pub domain: Domain,
    pub data: Option<T>,
    pub error: Option<DataError>,
    /// True when `data` came from the cache rather than a live fetch.
    pub is_from_cache: bool,
    /// Retry attempts consumed beyond the initial one.
    pub retry_count: u32,
    /// When `data` was originally fetched.
    pub updated_at: Option<DateTime<Utc>>,
}

impl<T> DomainResult<T> {
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    fn live(domain: Domain, data: T, retry_count: u32) -> Self {
        Self {
            domain,
            data: Some(data),
            error: None,
            is_from_cache: false,
            retry_count,
            updated_at: Some(Utc::now()),
        }
    }

    fn cached(domain: Domain, entry: CacheEntry<T>, error: Option<DataError>) -> Self {
        Self {
            domain,
            data: Some(entry.value),
            error,
            is_from_cache: true,
            retry_count: 0,
            updated_at: Some(entry.cached_at),
        }
    }

    fn failed(domain: Domain, error: DataError, retry_count: u32) -> Self {
        Self {
            domain,
            data: None,
            error: Some(error),
            is_from_cache: false,
            retry_count,
            updated_at: None,
        }
    }
}

/// Offline-first fetcher for one data domain.
pub struct DomainFetcher<T> {
    domain: Domain,
    source: Arc<dyn RemoteSource<Payload = T>>,
    cache: CacheStore<T>,
    connectivity: Arc<ConnectivityMonitor>,
    error_log: Arc<ErrorLog>,
    retry: RetryController,
    cutoff: CacheCutoff,
    /// Serializes in-flight fetches so concurrent callers coalesce onto
    /// the cache entry the first one writes.
    in_flight: Mutex<()>,
}

impl<T> DomainFetcher<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync,
{
    pub fn new(
        domain: Domain,
        source: Arc<dyn RemoteSource<Payload = T>>,
        cache: CacheStore<T>,
        connectivity: Arc<ConnectivityMonitor>,
        error_log: Arc<ErrorLog>,
        retry: RetryController,
        cutoff: CacheCutoff,
    ) -> Self {
        Self {
            domain,
            source,
            cache,
            connectivity,
            error_log,
            retry,
            cutoff,
            in_flight: Mutex::new(()),
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Runs the fetch sequence. `force` skips the fresh-cache shortcut
    /// and always goes to the network when one is available.
    pub async fn fetch(&self, force: bool) -> DomainResult<T> {
        let _guard = self.in_flight.lock().await;

        // A fetch that finished while we waited for the guard already
        // refreshed the cache; the re-read below picks that up.
        let entry = self.cache.get_ignoring_expiry(DATA_KEY).await;
        if !force {
            if let Some(entry) = &entry {
                if !entry.is_expired() {
                    tracing::debug!("{}: serving fresh cache", self.domain);
                    return DomainResult::cached(self.domain, entry.clone(), None);
                }
            }
        }

        if !self.connectivity.is_online().await {
            return self.fall_back(entry, DataError::Offline, 0).await;
        }

        let source = self.source.clone();
        let outcome = self.retry.run(|| {
            let source = source.clone();
            async move { source.fetch().await }
        });
        let outcome = outcome.await;
        let retry_count = outcome.retry_count();

        match outcome.result {
            Ok(payload) => {
                if let Err(e) = self.cache.set(DATA_KEY, &payload, &self.cutoff).await {
                    // A failed write-through degrades persistence, not
                    // the result.
                    tracing::warn!("{}: cache write-through failed: {}", self.domain, e);
                }
                tracing::debug!(
                    "{}: live fetch succeeded after {} retries",
                    self.domain,
                    retry_count
                );
                DomainResult::live(self.domain, payload, retry_count)
            }
            Err(error) => self.fall_back(entry, error, retry_count).await,
        }
    }

    /// Serves the stale cache entry if one exists, otherwise reports
    /// the failure. Either way the triggering error is logged.
    async fn fall_back(
        &self,
        entry: Option<CacheEntry<T>>,
        error: DataError,
        retry_count: u32,
    ) -> DomainResult<T> {
        self.error_log
            .record(&ErrorInfo::new(error.clone(), self.domain.as_str()))
            .await;

        match entry {
            Some(entry) => {
                tracing::debug!("{}: serving stale cache after {}", self.domain, error);
                let mut result = DomainResult::cached(self.domain, entry, Some(error));
                result.retry_count = retry_count;
                result
            }
            None => {
                let error = match error {
                    DataError::Offline => DataError::Offline,
                    _ => DataError::NoCachedData,
                };
                tracing::warn!("{}: no data available ({})", self.domain, error);
                DomainResult::failed(self.domain, error, retry_count)
            }
        }
    }

    /// Cached entry regardless of expiry, without touching the network.
    pub async fn cached(&self) -> Option<CacheEntry<T>> {
        self.cache.get_ignoring_expiry(DATA_KEY).await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    /// Cancels a pending retry backoff.
    pub fn cancel(&self) {
        self.retry.cancel();
    }

    /// Re-arms retries after a cancellation. Manual refresh paths call
    /// this before fetching.
    pub fn reset_retries(&self) {
        self.retry.reset();
    }

    pub fn is_retrying(&self) -> bool {
        self.retry.is_retrying()
    }

    pub fn subscribe_retrying(&self) -> tokio::sync::watch::Receiver<bool> {
        self.retry.subscribe_retrying()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ReachabilityProbe;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Payload {
        n: u32,
    }

    struct FakeSource {
        calls: AtomicU32,
        fail: AtomicBool,
    }

    impl FakeSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: AtomicBool::new(false),
            })
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteSource for FakeSource {
        type Payload = Payload;

        async fn fetch(&self) -> Result<Payload, DataError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(DataError::Http { status: 503 })
            } else {
                Ok(Payload { n })
            }
        }
    }

    struct FakeProbe(AtomicBool);

    #[async_trait]
    impl ReachabilityProbe for FakeProbe {
        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Fixture {
        fetcher: DomainFetcher<Payload>,
        source: Arc<FakeSource>,
        probe: Arc<FakeProbe>,
        connectivity: Arc<ConnectivityMonitor>,
    }

    fn fixture(cutoff: CacheCutoff) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let source = FakeSource::new();
        let probe = Arc::new(FakeProbe(AtomicBool::new(true)));
        let connectivity = Arc::new(ConnectivityMonitor::new(probe.clone(), store.clone()));
        let fetcher = DomainFetcher::new(
            Domain::CoreDb,
            source.clone(),
            CacheStore::new(store.clone(), Domain::CoreDb.as_str()),
            connectivity.clone(),
            Arc::new(ErrorLog::new(store)),
            RetryController::new(2, Duration::from_millis(1)),
            cutoff,
        );
        Fixture {
            fetcher,
            source,
            probe,
            connectivity,
        }
    }

    #[tokio::test]
    async fn test_live_fetch_writes_through_to_cache() {
        let fx = fixture(CacheCutoff::After(chrono::Duration::minutes(30)));

        let result = fx.fetcher.fetch(false).await;
        assert!(!result.is_from_cache);
        assert_eq!(result.data, Some(Payload { n: 0 }));
        assert!(result.updated_at.is_some());

        let cached = fx.fetcher.cached().await.unwrap();
        assert_eq!(cached.value, Payload { n: 0 });
    }

    #[tokio::test]
    async fn test_fresh_cache_short_circuits_network() {
        let fx = fixture(CacheCutoff::After(chrono::Duration::minutes(30)));

        fx.fetcher.fetch(false).await;
        let result = fx.fetcher.fetch(false).await;

        assert!(result.is_from_cache);
        assert_eq!(result.data, Some(Payload { n: 0 }));
        assert!(result.error.is_none());
        assert_eq!(fx.source.calls(), 1);
    }

    #[tokio::test]
    async fn test_force_bypasses_fresh_cache() {
        let fx = fixture(CacheCutoff::After(chrono::Duration::minutes(30)));

        fx.fetcher.fetch(false).await;
        let result = fx.fetcher.fetch(true).await;

        assert!(!result.is_from_cache);
        assert_eq!(result.data, Some(Payload { n: 1 }));
        assert_eq!(fx.source.calls(), 2);
    }

    #[tokio::test]
    async fn test_expired_cache_triggers_refetch() {
        let fx = fixture(CacheCutoff::After(chrono::Duration::seconds(-1)));

        fx.fetcher.fetch(false).await;
        let result = fx.fetcher.fetch(false).await;

        assert!(!result.is_from_cache);
        assert_eq!(fx.source.calls(), 2);
    }

    #[tokio::test]
    async fn test_offline_serves_stale_cache() {
        let fx = fixture(CacheCutoff::After(chrono::Duration::seconds(-1)));

        fx.fetcher.fetch(false).await;
        // Push the offline observation the way a platform network
        // change hook would; a fresh probe would be reused as online.
        fx.probe.0.store(false, Ordering::SeqCst);
        fx.connectivity.update(false).await;

        let result = fx.fetcher.fetch(false).await;
        assert!(result.is_from_cache);
        assert_eq!(result.data, Some(Payload { n: 0 }));
        assert_eq!(result.error, Some(DataError::Offline));
        assert_eq!(fx.source.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_falls_back_to_stale_cache() {
        let fx = fixture(CacheCutoff::After(chrono::Duration::seconds(-1)));

        fx.fetcher.fetch(false).await;
        fx.source.set_failing(true);

        let result = fx.fetcher.fetch(false).await;
        assert!(result.is_from_cache);
        assert_eq!(result.data, Some(Payload { n: 0 }));
        assert_eq!(result.error, Some(DataError::Http { status: 503 }));
        // Initial attempt plus two automatic retries.
        assert_eq!(result.retry_count, 2);
    }

    #[tokio::test]
    async fn test_failure_without_cache_reports_no_data() {
        let fx = fixture(CacheCutoff::Never);
        fx.source.set_failing(true);

        let result = fx.fetcher.fetch(false).await;
        assert!(result.data.is_none());
        assert_eq!(result.error, Some(DataError::NoCachedData));
    }

    #[tokio::test]
    async fn test_offline_without_cache_reports_offline() {
        let fx = fixture(CacheCutoff::Never);
        fx.probe.0.store(false, Ordering::SeqCst);

        let result = fx.fetcher.fetch(false).await;
        assert!(result.data.is_none());
        assert_eq!(result.error, Some(DataError::Offline));
        assert_eq!(fx.source.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_coalesce() {
        let fx = fixture(CacheCutoff::After(chrono::Duration::minutes(30)));
        let fetcher = Arc::new(fx.fetcher);

        let a = fetcher.clone();
        let b = fetcher.clone();
        let (ra, rb) = tokio::join!(a.fetch(false), b.fetch(false));

        // One caller fetched live; the other observed its write.
        assert!(ra.has_data() && rb.has_data());
        assert_eq!(fx.source.calls(), 1);
        assert!(ra.is_from_cache != rb.is_from_cache);
    }

    #[tokio::test]
    async fn test_clear_cache_forgets_data() {
        let fx = fixture(CacheCutoff::Never);
        fx.fetcher.fetch(false).await;
        assert!(fx.fetcher.cached().await.is_some());

        fx.fetcher.clear_cache().await;
        assert!(fx.fetcher.cached().await.is_none());
    }
}
