//! Connectivity tracking and staleness queries.
//!
//! The monitor owns the online/offline state for the whole engine: it
//! runs (or reuses a recent) reachability probe, persists the last
//! time the device was seen online, and broadcasts transitions to
//! subscribers. A failed probe is an offline verdict, never an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};

use crate::storage::KeyValueStore;

/// Storage key for the persisted last-online timestamp.
const LAST_ONLINE_KEY: &str = "last_online_at";
/// How long a probe verdict is reused before probing again.
const PROBE_REUSE_WINDOW: Duration = Duration::from_secs(5);
/// Timeout for the HTTP reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Default staleness threshold in minutes.
pub const DEFAULT_STALE_MINUTES: i64 = 60;

/// Platform-level reachability check.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Returns whether the backing server answers. Must not fail;
    /// probe errors are offline verdicts.
    async fn probe(&self) -> bool;
}

/// Probe that issues a cheap GET against a liveness endpoint.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    /// Probes `{base_url}/api/zmanim`, the server's lightest endpoint.
    pub fn new(base_url: &str) -> Self {
        // Builder inputs are static; a failure here is a bug, and a
        // default client would silently drop the probe timeout.
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("client builder with static options");
        Self {
            client,
            url: format!("{}/api/zmanim", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("reachability probe failed: {}", e);
                false
            }
        }
    }
}

/// Current connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub is_online: bool,
    pub last_online_at: Option<DateTime<Utc>>,
}

/// A connectivity transition delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub is_online: bool,
    pub at: DateTime<Utc>,
}

/// Handle to a connectivity subscription. Dropping it unsubscribes.
pub struct ConnectivitySubscription {
    rx: broadcast::Receiver<ConnectionEvent>,
}

impl ConnectivitySubscription {
    /// Waits for the next transition. Returns `None` once the monitor
    /// tore all subscriptions down.
    pub async fn next(&mut self) -> Option<ConnectionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                // Missed events are fine, only the latest state matters.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Tracks online/offline transitions for the process lifetime.
pub struct ConnectivityMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    store: Arc<dyn KeyValueStore>,
    state: Mutex<ConnectionState>,
    recent_probe: Mutex<Option<(Instant, bool)>>,
    events: std::sync::Mutex<broadcast::Sender<ConnectionEvent>>,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, store: Arc<dyn KeyValueStore>) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            probe,
            store,
            state: Mutex::new(ConnectionState {
                is_online: false,
                last_online_at: None,
            }),
            recent_probe: Mutex::new(None),
            events: std::sync::Mutex::new(tx),
        }
    }

    /// Checks connectivity, reusing a verdict from the last few
    /// seconds if one exists. On success, persists `last_online_at`.
    pub async fn is_online(&self) -> bool {
        {
            let recent = self.recent_probe.lock().await;
            if let Some((at, verdict)) = *recent {
                if at.elapsed() < PROBE_REUSE_WINDOW {
                    return verdict;
                }
            }
        }

        let verdict = self.probe.probe().await;
        *self.recent_probe.lock().await = Some((Instant::now(), verdict));
        self.apply(verdict).await;
        verdict
    }

    /// Feeds an externally observed connectivity change (the host
    /// platform's network-change notification).
    pub async fn update(&self, is_online: bool) {
        *self.recent_probe.lock().await = Some((Instant::now(), is_online));
        self.apply(is_online).await;
    }

    /// Records a verdict: persists the timestamp for online verdicts
    /// (before notifying subscribers) and broadcasts transitions.
    async fn apply(&self, is_online: bool) {
        let now = Utc::now();
        let transitioned = {
            let mut state = self.state.lock().await;
            let transitioned = state.is_online != is_online;
            state.is_online = is_online;
            if is_online {
                state.last_online_at = Some(now);
            }
            transitioned
        };

        if is_online {
            self.persist_last_online(now).await;
        }

        if transitioned {
            tracing::debug!("connectivity transition: online={}", is_online);
            let tx = self.events.lock().unwrap().clone();
            let _ = tx.send(ConnectionEvent { is_online, at: now });
        }
    }

    /// Last time the device was observed online, from memory or the
    /// persisted value. No live check is performed.
    pub async fn last_online(&self) -> Option<DateTime<Utc>> {
        if let Some(at) = self.state.lock().await.last_online_at {
            return Some(at);
        }
        match self.store.get(LAST_ONLINE_KEY).await {
            Ok(Some(raw)) => raw.parse::<DateTime<Utc>>().ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("failed to read last-online timestamp: {}", e);
                None
            }
        }
    }

    /// Whether the last online sighting is older than `threshold_minutes`
    /// (or never happened).
    pub async fn is_stale(&self, threshold_minutes: i64) -> bool {
        match self.last_online().await {
            Some(at) => (Utc::now() - at).num_minutes() >= threshold_minutes,
            None => true,
        }
    }

    /// Whether the device was ever observed online.
    pub async fn has_ever_been_online(&self) -> bool {
        self.last_online().await.is_some()
    }

    /// Manually records the device as online right now.
    pub async fn mark_online(&self) {
        self.update(true).await;
    }

    /// Returns a snapshot of the current state.
    pub async fn state(&self) -> ConnectionState {
        let mut state = *self.state.lock().await;
        if state.last_online_at.is_none() {
            state.last_online_at = self.last_online().await;
        }
        state
    }

    /// Registers for connectivity transitions.
    pub fn subscribe(&self) -> ConnectivitySubscription {
        ConnectivitySubscription {
            rx: self.events.lock().unwrap().subscribe(),
        }
    }

    /// Tears down every outstanding subscription. Pending `next()`
    /// calls resolve to `None`; later transitions reach only new
    /// subscribers.
    pub fn unsubscribe_all(&self) {
        let (tx, _) = broadcast::channel(16);
        *self.events.lock().unwrap() = tx;
    }

    async fn persist_last_online(&self, at: DateTime<Utc>) {
        if let Err(e) = self.store.set(LAST_ONLINE_KEY, &at.to_rfc3339()).await {
            tracing::warn!("failed to persist last-online timestamp: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeProbe {
        online: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeProbe {
        fn new(online: bool) -> Arc<Self> {
            Arc::new(Self {
                online: AtomicBool::new(online),
                calls: AtomicUsize::new(0),
            })
        }

        fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReachabilityProbe for FakeProbe {
        async fn probe(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.online.load(Ordering::SeqCst)
        }
    }

    fn monitor(probe: Arc<FakeProbe>) -> ConnectivityMonitor {
        ConnectivityMonitor::new(probe, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_http_probe_builds_and_targets_liveness_endpoint() {
        let probe = HttpProbe::new("http://localhost:3000/");
        assert_eq!(probe.url, "http://localhost:3000/api/zmanim");
    }

    #[tokio::test]
    async fn test_online_probe_persists_last_online() {
        let probe = FakeProbe::new(true);
        let monitor = monitor(probe);

        assert!(monitor.is_online().await);
        assert!(monitor.last_online().await.is_some());
        assert!(monitor.has_ever_been_online().await);
    }

    #[tokio::test]
    async fn test_failed_probe_is_offline_not_error() {
        let probe = FakeProbe::new(false);
        let monitor = monitor(probe);

        assert!(!monitor.is_online().await);
        assert_eq!(monitor.last_online().await, None);
        assert!(monitor.is_stale(60).await);
    }

    #[tokio::test]
    async fn test_probe_verdict_reused_within_window() {
        let probe = FakeProbe::new(true);
        let monitor = monitor(probe.clone());

        assert!(monitor.is_online().await);
        assert!(monitor.is_online().await);
        assert!(monitor.is_online().await);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn test_is_stale_with_recent_online() {
        let probe = FakeProbe::new(true);
        let monitor = monitor(probe);
        monitor.is_online().await;

        assert!(!monitor.is_stale(60).await);
        assert!(monitor.is_stale(0).await);
    }

    #[tokio::test]
    async fn test_subscription_sees_transition() {
        let probe = FakeProbe::new(true);
        let monitor = monitor(probe.clone());
        let mut sub = monitor.subscribe();

        monitor.update(true).await; // offline -> online
        let event = sub.next().await.unwrap();
        assert!(event.is_online);

        monitor.update(false).await;
        let event = sub.next().await.unwrap();
        assert!(!event.is_online);
    }

    #[tokio::test]
    async fn test_no_event_without_transition() {
        let probe = FakeProbe::new(true);
        let monitor = monitor(probe);
        monitor.update(true).await;

        let mut sub = monitor.subscribe();
        // Same state again: no transition, nothing delivered.
        monitor.update(true).await;
        monitor.update(false).await;
        let event = sub.next().await.unwrap();
        assert!(!event.is_online);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_closes_subscriptions() {
        let probe = FakeProbe::new(true);
        let monitor = monitor(probe);
        let mut sub = monitor.subscribe();

        monitor.unsubscribe_all();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_last_online_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let probe = FakeProbe::new(true);
        {
            let monitor = ConnectivityMonitor::new(probe.clone(), store.clone());
            monitor.is_online().await;
        }

        // Fresh monitor over the same store: reads the persisted value.
        probe.set_online(false);
        let monitor = ConnectivityMonitor::new(probe, store);
        assert!(monitor.last_online().await.is_some());
        assert!(!monitor.is_stale(60).await);
    }
}
