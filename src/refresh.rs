//! Refresh scheduling policy.
//!
//! Decides when data is due for a refresh, independent of any data
//! domain, and keeps a bounded history of refresh outcomes for
//! diagnostics. The single last-refresh timestamp drives control flow;
//! the history never does.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::KeyValueStore;

const LAST_REFRESH_KEY: &str = "refresh:last";
const REFRESH_PENDING_KEY: &str = "refresh:pending";
const REFRESH_HISTORY_KEY: &str = "refresh:history";

/// Default refresh interval in minutes.
pub const DEFAULT_REFRESH_INTERVAL_MINUTES: i64 = 60;
/// Maximum number of history records kept.
const MAX_HISTORY_ENTRIES: usize = 10;

/// What triggered a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshSource {
    Auto,
    Manual,
    Startup,
}

impl std::fmt::Display for RefreshSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshSource::Auto => write!(f, "auto"),
            RefreshSource::Manual => write!(f, "manual"),
            RefreshSource::Startup => write!(f, "startup"),
        }
    }
}

/// One recorded refresh outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub source: RefreshSource,
    pub duration_ms: Option<u64>,
}

/// Aggregate view of the refresh state.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshStatus {
    pub last_refresh: Option<DateTime<Utc>>,
    pub pending_refresh: bool,
    pub minutes_since_last_refresh: Option<i64>,
}

/// Interval-based refresh gate with a deferred-refresh flag.
pub struct RefreshPolicy {
    store: Arc<dyn KeyValueStore>,
}

impl RefreshPolicy {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Whether a refresh is due.
    ///
    /// True when forced, when a deferred refresh is pending, when no
    /// refresh ever completed, or when `interval_minutes` have elapsed
    /// since the last completed one. Storage trouble also answers
    /// true: when in doubt, refresh.
    pub async fn should_refresh(&self, interval_minutes: i64, force: bool) -> bool {
        if force {
            return true;
        }

        match self.store.get(REFRESH_PENDING_KEY).await {
            Ok(Some(flag)) if flag == "true" => return true,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("failed to read pending-refresh flag: {}", e);
                return true;
            }
        }

        match self.last_refresh().await {
            Some(last) => (Utc::now() - last).num_minutes() >= interval_minutes,
            None => true,
        }
    }

    /// Records a completed refresh: updates the last-refresh
    /// timestamp, clears the pending flag and appends to history.
    pub async fn mark_refresh_complete(&self, source: RefreshSource, duration_ms: Option<u64>) {
        let now = Utc::now();
        if let Err(e) = self.store.set(LAST_REFRESH_KEY, &now.to_rfc3339()).await {
            tracing::warn!("failed to persist last-refresh timestamp: {}", e);
        }
        if let Err(e) = self.store.remove(REFRESH_PENDING_KEY).await {
            tracing::warn!("failed to clear pending-refresh flag: {}", e);
        }
        self.append_history(RefreshRecord {
            timestamp: now,
            success: true,
            source,
            duration_ms,
        })
        .await;
    }

    /// Records a failed refresh. The last-refresh timestamp is left
    /// untouched so the next check still considers a refresh due.
    pub async fn mark_refresh_failed(&self, source: RefreshSource, duration_ms: Option<u64>) {
        self.append_history(RefreshRecord {
            timestamp: Utc::now(),
            success: false,
            source,
            duration_ms,
        })
        .await;
    }

    /// Flags that a refresh was deferred (e.g. offline) and must be
    /// attempted at the next opportunity.
    pub async fn mark_refresh_needed(&self) {
        if let Err(e) = self.store.set(REFRESH_PENDING_KEY, "true").await {
            tracing::warn!("failed to set pending-refresh flag: {}", e);
        }
    }

    /// Timestamp of the last completed refresh.
    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        match self.store.get(LAST_REFRESH_KEY).await {
            Ok(Some(raw)) => raw.parse::<DateTime<Utc>>().ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("failed to read last-refresh timestamp: {}", e);
                None
            }
        }
    }

    /// Refresh outcome history, newest first.
    pub async fn history(&self) -> Vec<RefreshRecord> {
        match self.store.get(REFRESH_HISTORY_KEY).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("failed to read refresh history: {}", e);
                Vec::new()
            }
        }
    }

    /// Mean duration of successful refreshes that recorded one.
    pub async fn average_refresh_duration(&self) -> Option<f64> {
        let durations: Vec<u64> = self
            .history()
            .await
            .into_iter()
            .filter(|r| r.success)
            .filter_map(|r| r.duration_ms)
            .collect();

        if durations.is_empty() {
            return None;
        }
        Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64)
    }

    pub async fn status(&self) -> RefreshStatus {
        let last_refresh = self.last_refresh().await;
        let pending_refresh = matches!(
            self.store.get(REFRESH_PENDING_KEY).await,
            Ok(Some(flag)) if flag == "true"
        );
        RefreshStatus {
            last_refresh,
            pending_refresh,
            minutes_since_last_refresh: last_refresh.map(|at| (Utc::now() - at).num_minutes()),
        }
    }

    /// History is diagnostic only: write failures are logged and
    /// swallowed so they cannot invalidate the refresh outcome itself.
    async fn append_history(&self, record: RefreshRecord) {
        let mut history = self.history().await;
        history.insert(0, record);
        history.truncate(MAX_HISTORY_ENTRIES);

        match serde_json::to_string(&history) {
            Ok(json) => {
                if let Err(e) = self.store.set(REFRESH_HISTORY_KEY, &json).await {
                    tracing::warn!("failed to persist refresh history: {}", e);
                }
            }
            Err(e) => tracing::warn!("failed to encode refresh history: {}", e),
        }
    }
}
