//! The sync engine: concurrent multi-domain refresh and aggregation.
//!
//! One engine owns a fetcher per data domain and refreshes them all
//! concurrently. Domains fail independently; the aggregate carries
//! whatever data survived, and only a core-board outage with nothing
//! cached is fatal to the caller.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

use crate::cache::{CacheCutoff, CacheEntry, CacheStore};
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivitySubscription, HttpProbe, ReachabilityProbe};
use crate::error::{DataError, ErrorInfo, ErrorLog};
use crate::fetch::sources::{
    CalendarSource, CoreDbSource, HalachaSource, OmerSource, ParashaSource, ZmanimSource,
};
use crate::fetch::{Domain, DomainFetcher, DomainResult, HttpClient, RemoteSource};
use crate::models::{
    CalendarFeed, DbPayload, HalachaPayload, OmerStatus, ParashaInfo, ZmanimDetail,
};
use crate::refresh::{RefreshPolicy, RefreshSource, RefreshStatus};
use crate::retry::RetryController;
use crate::storage::{FileStore, KeyValueStore, MemoryStore};

/// Availability of one domain in an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Data from a live fetch.
    Live,
    /// Data served from the cache.
    Cached,
    /// No data at all.
    Unavailable,
}

/// Everything one full refresh produced.
#[derive(Debug)]
pub struct AggregatedState {
    pub db: DomainResult<DbPayload>,
    pub halacha: DomainResult<HalachaPayload>,
    pub calendar: DomainResult<CalendarFeed>,
    pub omer: DomainResult<OmerStatus>,
    pub parasha: DomainResult<ParashaInfo>,
    pub zmanim: DomainResult<ZmanimDetail>,
}

impl AggregatedState {
    /// Whether any domain produced data, live or cached.
    pub fn has_any_data(&self) -> bool {
        self.db.has_data()
            || self.halacha.has_data()
            || self.calendar.has_data()
            || self.omer.has_data()
            || self.parasha.has_data()
            || self.zmanim.has_data()
    }

    /// Whether any domain's data came from the cache. Mixed freshness
    /// is surfaced, not hidden behind the freshest domain.
    pub fn is_from_cache(&self) -> bool {
        [
            (self.db.has_data(), self.db.is_from_cache),
            (self.halacha.has_data(), self.halacha.is_from_cache),
            (self.calendar.has_data(), self.calendar.is_from_cache),
            (self.omer.has_data(), self.omer.is_from_cache),
            (self.parasha.has_data(), self.parasha.is_from_cache),
            (self.zmanim.has_data(), self.zmanim.is_from_cache),
        ]
        .into_iter()
        .any(|(has_data, from_cache)| has_data && from_cache)
    }

    /// Most recent origin fetch time across domains with data.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        [
            data_timestamp(&self.db),
            data_timestamp(&self.halacha),
            data_timestamp(&self.calendar),
            data_timestamp(&self.omer),
            data_timestamp(&self.parasha),
            data_timestamp(&self.zmanim),
        ]
        .into_iter()
        .flatten()
        .max()
    }

    pub fn availability(&self, domain: Domain) -> Availability {
        match domain {
            Domain::CoreDb => availability_of(&self.db),
            Domain::Halacha => availability_of(&self.halacha),
            Domain::Calendar => availability_of(&self.calendar),
            Domain::Omer => availability_of(&self.omer),
            Domain::Parasha => availability_of(&self.parasha),
            Domain::Zmanim => availability_of(&self.zmanim),
        }
    }

    /// The error that makes the whole board unusable, if any.
    ///
    /// Only the core board payload is load-bearing; the other domains
    /// degrade to empty screens. Offline outranks every other failure
    /// because it describes the device, not the server.
    pub fn fatal_error(&self) -> Option<&DataError> {
        if self.db.has_data() {
            return None;
        }
        self.db.error.as_ref()
    }
}

fn data_timestamp<T>(result: &DomainResult<T>) -> Option<DateTime<Utc>> {
    if result.has_data() {
        result.updated_at
    } else {
        None
    }
}

fn availability_of<T>(result: &DomainResult<T>) -> Availability {
    match (result.has_data(), result.is_from_cache) {
        (true, false) => Availability::Live,
        (true, true) => Availability::Cached,
        (false, _) => Availability::Unavailable,
    }
}

/// Cache-only view of the board, served without touching the network.
#[derive(Debug)]
pub struct BoardSnapshot {
    pub db: Option<CacheEntry<DbPayload>>,
    pub halacha: Option<CacheEntry<HalachaPayload>>,
    pub calendar: Option<CacheEntry<CalendarFeed>>,
    pub omer: Option<CacheEntry<OmerStatus>>,
    pub parasha: Option<CacheEntry<ParashaInfo>>,
    pub zmanim: Option<CacheEntry<ZmanimDetail>>,
}

impl BoardSnapshot {
    pub fn has_any_data(&self) -> bool {
        self.db.is_some()
            || self.halacha.is_some()
            || self.calendar.is_some()
            || self.omer.is_some()
            || self.parasha.is_some()
            || self.zmanim.is_some()
    }

    /// Most recent cache write across populated domains.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        [
            self.db.as_ref().map(|e| e.cached_at),
            self.halacha.as_ref().map(|e| e.cached_at),
            self.calendar.as_ref().map(|e| e.cached_at),
            self.omer.as_ref().map(|e| e.cached_at),
            self.parasha.as_ref().map(|e| e.cached_at),
            self.zmanim.as_ref().map(|e| e.cached_at),
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

/// Remote sources for every domain, injectable for tests.
pub struct EngineSources {
    pub db: Arc<dyn RemoteSource<Payload = DbPayload>>,
    pub halacha: Arc<dyn RemoteSource<Payload = HalachaPayload>>,
    pub calendar: Arc<dyn RemoteSource<Payload = CalendarFeed>>,
    pub omer: Arc<dyn RemoteSource<Payload = OmerStatus>>,
    pub parasha: Arc<dyn RemoteSource<Payload = ParashaInfo>>,
    pub zmanim: Arc<dyn RemoteSource<Payload = ZmanimDetail>>,
}

impl EngineSources {
    /// Production sources per the configured backends.
    pub fn from_config(config: &SyncConfig) -> Self {
        let client = HttpClient::new(config.fetch_timeout);
        Self {
            db: Arc::new(CoreDbSource::new(client.clone(), config)),
            halacha: Arc::new(HalachaSource::new(client.clone(), config)),
            calendar: Arc::new(CalendarSource::new(client.clone(), config)),
            omer: Arc::new(OmerSource::new(client.clone(), config)),
            parasha: Arc::new(ParashaSource::new(client.clone(), config)),
            zmanim: Arc::new(ZmanimSource::new(client, config)),
        }
    }
}

/// Cutoffs for the feed domains. The core board cutoff comes from
/// configuration; these are inherent to how often each feed changes.
const HALACHA_TTL_HOURS: i64 = 1;
const CALENDAR_TTL_HOURS: i64 = 24;
const OMER_TTL_HOURS: i64 = 12;
const PARASHA_TTL_HOURS: i64 = 24;
const ZMANIM_TTL_HOURS: i64 = 12;

/// Orchestrates offline-first refresh across all data domains.
pub struct SyncEngine {
    connectivity: Arc<ConnectivityMonitor>,
    refresh: RefreshPolicy,
    error_log: Arc<ErrorLog>,
    refresh_interval_minutes: i64,
    db: DomainFetcher<DbPayload>,
    halacha: DomainFetcher<HalachaPayload>,
    calendar: DomainFetcher<CalendarFeed>,
    omer: DomainFetcher<OmerStatus>,
    parasha: DomainFetcher<ParashaInfo>,
    zmanim: DomainFetcher<ZmanimDetail>,
}

impl SyncEngine {
    /// Builds an engine over the configured backends, with a
    /// file-backed store when `data_dir` is set.
    pub fn new(config: SyncConfig) -> Self {
        let store: Arc<dyn KeyValueStore> = match &config.data_dir {
            Some(dir) => Arc::new(FileStore::new(dir.clone())),
            None => Arc::new(MemoryStore::new()),
        };
        let probe = Arc::new(HttpProbe::new(&config.base_url));
        let sources = EngineSources::from_config(&config);
        Self::from_parts(config, store, probe, sources)
    }

    /// Builds an engine from injected capabilities. Tests use this with
    /// fake probes and sources.
    pub fn from_parts(
        config: SyncConfig,
        store: Arc<dyn KeyValueStore>,
        probe: Arc<dyn ReachabilityProbe>,
        sources: EngineSources,
    ) -> Self {
        let connectivity = Arc::new(ConnectivityMonitor::new(probe, store.clone()));
        let error_log = Arc::new(ErrorLog::new(store.clone()));

        let max_retries = config.max_retries;
        let retry_delay = config.retry_delay;
        let fetcher = |domain: Domain| FetcherParts {
            store: store.clone(),
            connectivity: connectivity.clone(),
            error_log: error_log.clone(),
            retry: RetryController::new(max_retries, retry_delay),
            domain,
        };

        let hours = |h: i64| CacheCutoff::After(Duration::hours(h));

        Self {
            refresh: RefreshPolicy::new(store.clone()),
            refresh_interval_minutes: config.refresh_interval_minutes,
            db: fetcher(Domain::CoreDb).build(sources.db, config.db_cutoff),
            halacha: fetcher(Domain::Halacha).build(sources.halacha, hours(HALACHA_TTL_HOURS)),
            calendar: fetcher(Domain::Calendar).build(sources.calendar, hours(CALENDAR_TTL_HOURS)),
            omer: fetcher(Domain::Omer).build(sources.omer, hours(OMER_TTL_HOURS)),
            parasha: fetcher(Domain::Parasha).build(sources.parasha, hours(PARASHA_TTL_HOURS)),
            zmanim: fetcher(Domain::Zmanim).build(sources.zmanim, hours(ZMANIM_TTL_HOURS)),
            connectivity,
            error_log,
        }
    }

    /// Refreshes every domain concurrently and records the outcome.
    ///
    /// The refresh ledger follows the core board only: a live core
    /// fetch completes the refresh, a cache-served core leaves it
    /// pending for the next opportunity, and no core data at all marks
    /// it failed.
    pub async fn refresh_all(&self, source: RefreshSource, force: bool) -> AggregatedState {
        if source == RefreshSource::Manual {
            // A manual refresh overrides any earlier cancellation.
            self.reset_retries();
        }

        let started = Instant::now();
        let (db, halacha, calendar, omer, parasha, zmanim) = tokio::join!(
            self.db.fetch(force),
            self.halacha.fetch(force),
            self.calendar.fetch(force),
            self.omer.fetch(force),
            self.parasha.fetch(force),
            self.zmanim.fetch(force),
        );
        let duration_ms = started.elapsed().as_millis() as u64;

        if db.has_data() && !db.is_from_cache {
            self.refresh
                .mark_refresh_complete(source, Some(duration_ms))
                .await;
        } else if db.has_data() && db.error.is_some() {
            // Served stale after a failed network path: try again at
            // the next opportunity. A fresh cache hit needs no mark.
            self.refresh.mark_refresh_needed().await;
        } else if !db.has_data() {
            self.refresh
                .mark_refresh_failed(source, Some(duration_ms))
                .await;
        }

        let state = AggregatedState {
            db,
            halacha,
            calendar,
            omer,
            parasha,
            zmanim,
        };
        tracing::info!(
            "refresh ({}) finished in {}ms, data={}, cached={}",
            source,
            duration_ms,
            state.has_any_data(),
            state.is_from_cache()
        );
        state
    }

    /// Runs [`refresh_all`](Self::refresh_all) only when the refresh
    /// interval elapsed or a deferred refresh is pending. A due refresh
    /// always goes to the network; serving cache would defeat it.
    pub async fn refresh_if_due(&self, source: RefreshSource) -> Option<AggregatedState> {
        if !self
            .refresh
            .should_refresh(self.refresh_interval_minutes, false)
            .await
        {
            return None;
        }
        Some(self.refresh_all(source, true).await)
    }

    /// Reads every domain's cache without any network activity.
    pub async fn cached_snapshot(&self) -> BoardSnapshot {
        let (db, halacha, calendar, omer, parasha, zmanim) = tokio::join!(
            self.db.cached(),
            self.halacha.cached(),
            self.calendar.cached(),
            self.omer.cached(),
            self.parasha.cached(),
            self.zmanim.cached(),
        );
        BoardSnapshot {
            db,
            halacha,
            calendar,
            omer,
            parasha,
            zmanim,
        }
    }

    /// Forces one domain to refetch, bypassing its cache. The typed
    /// payload lands in the domain's cache; the caller learns how the
    /// fetch went.
    pub async fn refresh_domain(&self, domain: Domain) -> Availability {
        match domain {
            Domain::CoreDb => availability_of(&self.db.fetch(true).await),
            Domain::Halacha => availability_of(&self.halacha.fetch(true).await),
            Domain::Calendar => availability_of(&self.calendar.fetch(true).await),
            Domain::Omer => availability_of(&self.omer.fetch(true).await),
            Domain::Parasha => availability_of(&self.parasha.fetch(true).await),
            Domain::Zmanim => availability_of(&self.zmanim.fetch(true).await),
        }
    }

    /// Drops one domain's cached data.
    pub async fn clear_cache(&self, domain: Domain) {
        match domain {
            Domain::CoreDb => self.db.clear_cache().await,
            Domain::Halacha => self.halacha.clear_cache().await,
            Domain::Calendar => self.calendar.clear_cache().await,
            Domain::Omer => self.omer.clear_cache().await,
            Domain::Parasha => self.parasha.clear_cache().await,
            Domain::Zmanim => self.zmanim.clear_cache().await,
        }
    }

    /// Drops every domain's cached data.
    pub async fn clear_all_caches(&self) {
        tokio::join!(
            self.db.clear_cache(),
            self.halacha.clear_cache(),
            self.calendar.clear_cache(),
            self.omer.clear_cache(),
            self.parasha.clear_cache(),
            self.zmanim.clear_cache(),
        );
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn subscribe_connectivity(&self) -> ConnectivitySubscription {
        self.connectivity.subscribe()
    }

    pub async fn refresh_status(&self) -> RefreshStatus {
        self.refresh.status().await
    }

    pub async fn recent_errors(&self) -> Vec<ErrorInfo> {
        self.error_log.entries().await
    }

    /// Whether any domain is waiting out a retry backoff.
    pub fn is_retrying(&self) -> bool {
        self.db.is_retrying()
            || self.halacha.is_retrying()
            || self.calendar.is_retrying()
            || self.omer.is_retrying()
            || self.parasha.is_retrying()
            || self.zmanim.is_retrying()
    }

    fn reset_retries(&self) {
        self.db.reset_retries();
        self.halacha.reset_retries();
        self.calendar.reset_retries();
        self.omer.reset_retries();
        self.parasha.reset_retries();
        self.zmanim.reset_retries();
    }

    /// Cancels pending retries and tears down subscriptions. The
    /// engine stays usable; a later manual refresh re-arms retries.
    pub fn shutdown(&self) {
        self.db.cancel();
        self.halacha.cancel();
        self.calendar.cancel();
        self.omer.cancel();
        self.parasha.cancel();
        self.zmanim.cancel();
        self.connectivity.unsubscribe_all();
    }
}

/// Shared pieces for building one domain fetcher.
struct FetcherParts {
    store: Arc<dyn KeyValueStore>,
    connectivity: Arc<ConnectivityMonitor>,
    error_log: Arc<ErrorLog>,
    retry: RetryController,
    domain: Domain,
}

impl FetcherParts {
    fn build<T>(
        self,
        source: Arc<dyn RemoteSource<Payload = T>>,
        cutoff: CacheCutoff,
    ) -> DomainFetcher<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync,
    {
        DomainFetcher::new(
            self.domain,
            source,
            CacheStore::new(self.store, self.domain.as_str()),
            self.connectivity,
            self.error_log,
            self.retry,
            cutoff,
        )
    }
}
