//! Luach Sync Core
//!
//! Offline-resilient data synchronization and caching for the Luach
//! community board. The engine fetches each data domain from its
//! backend, writes everything through a namespaced persistent cache,
//! and serves stale cache whenever the network path is down.

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod fetch;
pub mod models;
pub mod refresh;
pub mod retry;
pub mod storage;

pub use aggregate::{AggregatedState, Availability, BoardSnapshot, EngineSources, SyncEngine};
pub use cache::{CacheCutoff, CacheEntry, CacheStore, MemoryCache};
pub use config::SyncConfig;
pub use connectivity::{
    ConnectionEvent, ConnectionState, ConnectivityMonitor, ConnectivitySubscription, HttpProbe,
    ReachabilityProbe,
};
pub use error::{DataError, ErrorInfo, ErrorLog};
pub use fetch::{Domain, DomainFetcher, DomainResult, HttpClient, RemoteSource};
pub use refresh::{RefreshPolicy, RefreshRecord, RefreshSource, RefreshStatus};
pub use retry::{RetryController, RetryOutcome};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
