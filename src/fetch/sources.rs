//! Remote sources for each data domain.
//!
//! One type per backend interface: the community board server, the
//! Hebcal REST API and the Sefaria text API. Each source does exactly
//! one thing, fetch and shape the payload its domain caches; freshness
//! and fallback live in [`DomainFetcher`](super::DomainFetcher).

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;

use super::{HttpClient, RemoteSource};
use crate::config::SyncConfig;
use crate::error::DataError;
use crate::models::{
    clean_segment, next_shabbat, CalendarFeed, DbPayload, HalachaPayload, OmerStatus, ParashaInfo,
    ZmanimDetail,
};

/// Fallback Sefaria ref when the daily-halacha calendar item is absent.
const HALACHA_FALLBACK_REF: &str = "Shulchan_Arukh,_Orach_Chayim.1-3";
/// Halacha segments shown on the board.
const HALACHA_SEGMENT_COUNT: usize = 3;
/// The calendar domain carries a full year of events.
const CALENDAR_LOOKAHEAD_DAYS: i64 = 365;
/// An omer lookup must cover the whole 49-day count.
const OMER_LOOKAHEAD_DAYS: i64 = 50;

/// The community board server. Seven endpoints, one payload.
pub struct CoreDbSource {
    client: HttpClient,
    base_url: String,
}

impl CoreDbSource {
    pub fn new(client: HttpClient, config: &SyncConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/{}", self.base_url, endpoint)
    }
}

#[async_trait]
impl RemoteSource for CoreDbSource {
    type Payload = DbPayload;

    /// Fetches all board endpoints concurrently. Any endpoint failing
    /// fails the whole payload; the board is not useful piecemeal.
    async fn fetch(&self) -> Result<DbPayload, DataError> {
        let zmanim_url = self.url("zmanim");
        let screen_timer_url = self.url("screenTimer");
        let tfila_times_url = self.url("tfilaTime");
        let honorees_url = self.url("olieLatora");
        let shiurim_url = self.url("shiorim");
        let memorials_url = self.url("hanzch");
        let general_message_url = self.url("generalMessage");
        let (zmanim, screen_timer, tfila_times, honorees, shiurim, memorials, general_message) =
            futures::try_join!(
                self.client.get_json(&zmanim_url),
                self.client.get_json(&screen_timer_url),
                self.client.get_json(&tfila_times_url),
                self.client.get_json(&honorees_url),
                self.client.get_json(&shiurim_url),
                self.client.get_json(&memorials_url),
                self.client.get_json(&general_message_url),
            )?;

        Ok(DbPayload {
            zmanim,
            screen_timer,
            tfila_times,
            honorees,
            shiurim,
            memorials,
            general_message,
        })
    }
}

#[derive(Deserialize)]
struct SefariaCalendars {
    #[serde(default)]
    calendar_items: Vec<SefariaCalendarItem>,
}

#[derive(Deserialize)]
struct SefariaCalendarItem {
    title: SefariaTitle,
    #[serde(rename = "ref")]
    text_ref: Option<String>,
}

#[derive(Deserialize)]
struct SefariaTitle {
    en: String,
}

#[derive(Deserialize)]
struct SefariaTexts {
    #[serde(default)]
    versions: Vec<SefariaVersion>,
}

#[derive(Deserialize)]
struct SefariaVersion {
    #[serde(default)]
    text: serde_json::Value,
}

/// Daily halacha from Sefaria.
pub struct HalachaSource {
    client: HttpClient,
    sefaria_url: String,
}

impl HalachaSource {
    pub fn new(client: HttpClient, config: &SyncConfig) -> Self {
        Self {
            client,
            sefaria_url: config.sefaria_url.trim_end_matches('/').to_string(),
        }
    }

    /// Today's halacha ref from the Sefaria learning calendar, falling
    /// back to a fixed ref when the calendar lacks the item.
    async fn daily_ref(&self) -> Result<String, DataError> {
        let url = format!("{}/api/calendars", self.sefaria_url);
        let calendars: SefariaCalendars = self.client.get_json(&url).await?;

        Ok(calendars
            .calendar_items
            .into_iter()
            .find(|item| item.title.en == "Halakhah Yomit")
            .and_then(|item| item.text_ref)
            .unwrap_or_else(|| HALACHA_FALLBACK_REF.to_string()))
    }
}

/// Flattens Sefaria's text payload, which nests arrays per chapter,
/// into plain segments.
fn flatten_segments(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Array(items) => {
            for item in items {
                flatten_segments(item, out);
            }
        }
        _ => {}
    }
}

#[async_trait]
impl RemoteSource for HalachaSource {
    type Payload = HalachaPayload;

    async fn fetch(&self) -> Result<HalachaPayload, DataError> {
        let text_ref = self.daily_ref().await?;
        let url = format!(
            "{}/api/v3/texts/{}?lang=he",
            self.sefaria_url,
            text_ref.replace(' ', "_")
        );
        let texts: SefariaTexts = self.client.get_json(&url).await?;

        let version = texts
            .versions
            .first()
            .ok_or_else(|| DataError::Validation(format!("no text versions for {}", text_ref)))?;

        let mut segments = Vec::new();
        flatten_segments(&version.text, &mut segments);
        let texts: Vec<String> = segments
            .iter()
            .map(|s| clean_segment(s))
            .filter(|s| !s.is_empty())
            .take(HALACHA_SEGMENT_COUNT)
            .collect();

        if texts.is_empty() {
            return Err(DataError::Validation(format!(
                "empty halacha text for {}",
                text_ref
            )));
        }

        Ok(HalachaPayload {
            texts,
            reference: text_ref,
        })
    }
}

/// Shared Hebcal /hebcal feed query over a date range.
async fn hebcal_feed(
    client: &HttpClient,
    hebcal_url: &str,
    config_params: &HebcalParams,
    start: chrono::NaiveDate,
    end: chrono::NaiveDate,
) -> Result<CalendarFeed, DataError> {
    let url = format!("{}/hebcal", hebcal_url.trim_end_matches('/'));
    let geonameid = config_params.geoname_id.to_string();
    let start = start.to_string();
    let end = end.to_string();
    let query = [
        ("v", "1"),
        ("cfg", "json"),
        ("maj", "on"),
        ("min", "on"),
        ("mod", "on"),
        ("nx", "on"),
        ("ss", "on"),
        ("mf", "on"),
        ("s", "on"),
        ("o", "on"),
        ("c", "on"),
        ("geonameid", geonameid.as_str()),
        ("lg", config_params.language.as_str()),
        ("start", start.as_str()),
        ("end", end.as_str()),
    ];
    client.get_json_with_query(&url, &query).await
}

struct HebcalParams {
    geoname_id: u32,
    language: String,
}

impl HebcalParams {
    fn from_config(config: &SyncConfig) -> Self {
        Self {
            geoname_id: config.geoname_id,
            language: config.language.clone(),
        }
    }
}

/// Hebrew calendar events from Hebcal.
pub struct CalendarSource {
    client: HttpClient,
    hebcal_url: String,
    params: HebcalParams,
}

impl CalendarSource {
    pub fn new(client: HttpClient, config: &SyncConfig) -> Self {
        Self {
            client,
            hebcal_url: config.hebcal_url.clone(),
            params: HebcalParams::from_config(config),
        }
    }
}

#[async_trait]
impl RemoteSource for CalendarSource {
    type Payload = CalendarFeed;

    async fn fetch(&self) -> Result<CalendarFeed, DataError> {
        let today = Utc::now().date_naive();
        hebcal_feed(
            &self.client,
            &self.hebcal_url,
            &self.params,
            today,
            today + Duration::days(CALENDAR_LOOKAHEAD_DAYS),
        )
        .await
    }
}

/// Omer count derived from a ranged Hebcal feed.
pub struct OmerSource {
    client: HttpClient,
    hebcal_url: String,
    params: HebcalParams,
}

impl OmerSource {
    pub fn new(client: HttpClient, config: &SyncConfig) -> Self {
        Self {
            client,
            hebcal_url: config.hebcal_url.clone(),
            params: HebcalParams::from_config(config),
        }
    }
}

#[async_trait]
impl RemoteSource for OmerSource {
    type Payload = OmerStatus;

    async fn fetch(&self) -> Result<OmerStatus, DataError> {
        let today = Utc::now().date_naive();
        let feed = hebcal_feed(
            &self.client,
            &self.hebcal_url,
            &self.params,
            today,
            today + Duration::days(OMER_LOOKAHEAD_DAYS),
        )
        .await?;
        Ok(OmerStatus::from_feed(&feed, today))
    }
}

/// Weekly Torah portion from the Hebcal feed.
pub struct ParashaSource {
    client: HttpClient,
    hebcal_url: String,
    params: HebcalParams,
}

impl ParashaSource {
    pub fn new(client: HttpClient, config: &SyncConfig) -> Self {
        Self {
            client,
            hebcal_url: config.hebcal_url.clone(),
            params: HebcalParams::from_config(config),
        }
    }
}

#[async_trait]
impl RemoteSource for ParashaSource {
    type Payload = ParashaInfo;

    async fn fetch(&self) -> Result<ParashaInfo, DataError> {
        let today = Utc::now().date_naive();
        // A week past the coming Shabbat covers festival weeks where no
        // portion falls on the nearest one.
        let end = next_shabbat(today) + Duration::days(7);
        let feed = hebcal_feed(&self.client, &self.hebcal_url, &self.params, today, end).await?;

        feed.items
            .iter()
            .find(|e| e.is_parasha())
            .map(ParashaInfo::from_event)
            .ok_or_else(|| DataError::Validation("no Torah portion in calendar feed".into()))
    }
}

/// Detailed halachic times from the Hebcal zmanim endpoint.
pub struct ZmanimSource {
    client: HttpClient,
    hebcal_url: String,
    geoname_id: u32,
}

impl ZmanimSource {
    pub fn new(client: HttpClient, config: &SyncConfig) -> Self {
        Self {
            client,
            hebcal_url: config.hebcal_url.trim_end_matches('/').to_string(),
            geoname_id: config.geoname_id,
        }
    }
}

#[async_trait]
impl RemoteSource for ZmanimSource {
    type Payload = ZmanimDetail;

    async fn fetch(&self) -> Result<ZmanimDetail, DataError> {
        let url = format!("{}/zmanim", self.hebcal_url);
        let query = [
            ("cfg", "json".to_string()),
            ("geonameid", self.geoname_id.to_string()),
            ("date", Utc::now().date_naive().to_string()),
        ];
        let query: Vec<(&str, &str)> = query.iter().map(|(k, v)| (*k, v.as_str())).collect();
        self.client.get_json_with_query(&url, &query).await
    }
}
