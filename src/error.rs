//! Error taxonomy for the sync core.
//!
//! Every failure is classified at the boundary where it originates
//! (HTTP client, storage layer, payload decoding) and carried as a
//! [`DataError`] variant from then on. Downstream code matches on the
//! variant instead of re-inspecting status codes or message strings.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::KeyValueStore;

/// Storage key for the persisted error log.
const ERROR_LOG_KEY: &str = "error_log";
/// Maximum number of error records kept in the log.
const MAX_ERROR_LOG_ENTRIES: usize = 50;

/// A classified failure from the data layer.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataError {
    /// Server answered with a non-2xx status.
    #[error("server returned HTTP {status}")]
    Http { status: u16 },
    /// Request could not be completed at the transport level.
    #[error("network error: {0}")]
    Network(String),
    /// Request exceeded its deadline.
    #[error("request timed out")]
    Timeout,
    /// Persistent storage read/write failed.
    #[error("storage error: {0}")]
    Storage(String),
    /// Payload was received but could not be decoded or was incomplete.
    #[error("invalid payload: {0}")]
    Validation(String),
    /// Device had no connectivity at call time.
    #[error("device is offline")]
    Offline,
    /// Network path failed and no cached fallback exists.
    #[error("no cached data available")]
    NoCachedData,
}

impl DataError {
    /// Whether an automatic retry may succeed.
    ///
    /// Server-side errors (5xx), transport failures and timeouts are
    /// transient; client errors, bad payloads and storage corruption
    /// are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            DataError::Http { status } => *status >= 500,
            DataError::Network(_) | DataError::Timeout | DataError::Offline => true,
            DataError::Storage(_) | DataError::Validation(_) | DataError::NoCachedData => false,
        }
    }
}

/// A surfaced error with diagnostic context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error: DataError,
    /// Component or domain that produced the error.
    pub source: String,
    pub at: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(error: DataError, source: impl Into<String>) -> Self {
        Self {
            error,
            source: source.into(),
            at: Utc::now(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.source, self.error)
    }
}

/// Bounded persistent log of surfaced errors, newest first.
///
/// Diagnostic only: log writes that fail are swallowed with a warning
/// so an ailing storage layer cannot turn a recoverable fetch failure
/// into a fatal one.
pub struct ErrorLog {
    store: Arc<dyn KeyValueStore>,
}

impl ErrorLog {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Prepends a record, evicting the oldest past capacity.
    pub async fn record(&self, info: &ErrorInfo) {
        let mut entries = self.entries().await;
        entries.insert(0, info.clone());
        entries.truncate(MAX_ERROR_LOG_ENTRIES);

        match serde_json::to_string(&entries) {
            Ok(json) => {
                if let Err(e) = self.store.set(ERROR_LOG_KEY, &json).await {
                    tracing::warn!("failed to persist error log: {}", e);
                }
            }
            Err(e) => tracing::warn!("failed to encode error log: {}", e),
        }
    }

    /// Returns all logged errors, newest first.
    pub async fn entries(&self) -> Vec<ErrorInfo> {
        match self.store.get(ERROR_LOG_KEY).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("failed to read error log: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn clear(&self) {
        if let Err(e) = self.store.remove(ERROR_LOG_KEY).await {
            tracing::warn!("failed to clear error log: {}", e);
        }
    }
}
