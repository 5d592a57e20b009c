//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::CacheCutoff;
use crate::refresh::DEFAULT_REFRESH_INTERVAL_MINUTES;
use crate::retry::{MAX_AUTO_RETRIES, RETRY_DELAY};

/// Default board server.
pub const DEFAULT_BASE_URL: &str = "https://btmanagement-production.up.railway.app";
/// Hebcal REST API root.
pub const DEFAULT_HEBCAL_URL: &str = "https://www.hebcal.com";
/// Sefaria REST API root.
pub const DEFAULT_SEFARIA_URL: &str = "https://www.sefaria.org";
/// Rosh Haayin, Israel.
pub const DEFAULT_GEONAME_ID: u32 = 293690;

/// Timeout for regular data fetches.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for a [`SyncEngine`](crate::aggregate::SyncEngine).
///
/// All fields have working defaults; construction sites override only
/// what differs (tests point `base_url` at a local server, a desktop
/// host sets `data_dir`).
pub struct SyncConfig {
    /// Board server base URL, no trailing slash.
    pub base_url: String,
    /// Hebcal API base URL.
    pub hebcal_url: String,
    /// Sefaria API base URL.
    pub sefaria_url: String,
    /// Geoname identifier for location-dependent feeds.
    pub geoname_id: u32,
    /// Feed language code.
    pub language: String,
    /// Directory for the file-backed store. `None` keeps everything in
    /// memory.
    pub data_dir: Option<PathBuf>,
    /// Minutes between automatic refreshes.
    pub refresh_interval_minutes: i64,
    /// Timeout applied to data fetches.
    pub fetch_timeout: Duration,
    /// Automatic retries after a failed fetch attempt.
    pub max_retries: u32,
    /// Delay between retry attempts.
    pub retry_delay: Duration,
    /// Expiry policy for the core board payload.
    pub db_cutoff: CacheCutoff,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            hebcal_url: DEFAULT_HEBCAL_URL.to_string(),
            sefaria_url: DEFAULT_SEFARIA_URL.to_string(),
            geoname_id: DEFAULT_GEONAME_ID,
            language: "he".to_string(),
            data_dir: None,
            refresh_interval_minutes: DEFAULT_REFRESH_INTERVAL_MINUTES,
            fetch_timeout: FETCH_TIMEOUT,
            max_retries: MAX_AUTO_RETRIES,
            retry_delay: RETRY_DELAY,
            // The board data is daily; it goes stale at the evening
            // cutoff in device-local time, not after a rolling TTL.
            db_cutoff: CacheCutoff::daily_local(18, 0),
        }
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("base_url", &self.base_url)
            .field("geoname_id", &self.geoname_id)
            .field("language", &self.language)
            .field("data_dir", &self.data_dir)
            .field("refresh_interval_minutes", &self.refresh_interval_minutes)
            .field("db_cutoff", &self.db_cutoff)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = SyncConfig::default();
        assert!(config.base_url.starts_with("https://"));
        assert!(!config.base_url.ends_with('/'));
        assert_eq!(config.geoname_id, DEFAULT_GEONAME_ID);
        assert_eq!(config.language, "he");
        assert_eq!(config.refresh_interval_minutes, 60);
        assert!(config.data_dir.is_none());
    }
}
