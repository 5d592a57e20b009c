//! Payload types for every data domain.
//!
//! Shapes follow the board server's JSON and the Hebcal/Sefaria feeds.
//! Fields the backends treat as optional are optional here too; the
//! fetch layer rejects only structurally unusable payloads.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// One named halachic time on the board (e.g. sunrise, midday).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZmanEntry {
    pub name: String,
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The board's daily zmanim table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ZmanimBoard {
    #[serde(default)]
    pub zmanim: Vec<ZmanEntry>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

/// A scheduled prayer service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TfilaTime {
    pub title: String,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A Torah-reading honoree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliyahHonoree {
    pub name: String,
    pub aliyah: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A recurring lecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shiur {
    pub title: String,
    #[serde(default)]
    pub rav: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub day: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A memorial entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memorial {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

/// The community announcement banner.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GeneralMessage {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "showMessage")]
    pub show_message: bool,
}

/// Everything the core board fetch assembles, one endpoint each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbPayload {
    pub zmanim: ZmanimBoard,
    /// Screen rotation timings, passed through opaquely.
    pub screen_timer: serde_json::Value,
    pub tfila_times: Vec<TfilaTime>,
    pub honorees: Vec<AliyahHonoree>,
    pub shiurim: Vec<Shiur>,
    pub memorials: Vec<Memorial>,
    pub general_message: GeneralMessage,
}

/// Daily halacha text, already cleaned of markup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HalachaPayload {
    pub texts: Vec<String>,
    /// Canonical ref the texts were read from.
    pub reference: String,
}

/// One event from the Hebcal calendar feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub title: String,
    /// ISO date, sometimes with a time component.
    pub date: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub hebrew: Option<String>,
    #[serde(default)]
    pub memo: Option<String>,
}

impl CalendarEvent {
    /// Calendar date of the event, ignoring any time component.
    pub fn day(&self) -> Option<NaiveDate> {
        let date_part = self.date.split('T').next().unwrap_or(&self.date);
        date_part.parse().ok()
    }

    fn has_category(&self, category: &str) -> bool {
        self.category.as_deref() == Some(category)
    }

    pub fn is_candle_lighting(&self) -> bool {
        self.has_category("candles")
    }

    pub fn is_havdalah(&self) -> bool {
        self.has_category("havdalah")
    }

    pub fn is_omer(&self) -> bool {
        self.has_category("omer")
    }

    pub fn is_parasha(&self) -> bool {
        self.has_category("parashat")
    }
}

/// Hebrew-calendar events for a date range.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalendarFeed {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub items: Vec<CalendarEvent>,
}

impl CalendarFeed {
    /// Events falling on `day`.
    pub fn events_on(&self, day: NaiveDate) -> Vec<&CalendarEvent> {
        self.items.iter().filter(|e| e.day() == Some(day)).collect()
    }

    /// Events on or after `day`.
    pub fn upcoming(&self, day: NaiveDate) -> Vec<&CalendarEvent> {
        self.items
            .iter()
            .filter(|e| matches!(e.day(), Some(d) if d >= day))
            .collect()
    }

    /// The Torah portion read on the Shabbat at or after `today`.
    pub fn weekly_parasha(&self, today: NaiveDate) -> Option<&CalendarEvent> {
        let shabbat = next_shabbat(today);
        self.items.iter().find(|e| {
            e.is_parasha()
                && matches!(e.day(), Some(d) if d >= today && d <= shabbat)
        })
    }

    /// Whether `day` carries Shabbat markers (candles, Havdalah or a
    /// Torah portion).
    pub fn is_shabbat(&self, day: NaiveDate) -> bool {
        self.events_on(day)
            .iter()
            .any(|e| e.is_candle_lighting() || e.is_havdalah() || e.is_parasha())
    }
}

/// The Shabbat on or after `day`.
pub fn next_shabbat(day: NaiveDate) -> NaiveDate {
    let days_ahead = (Weekday::Sat.num_days_from_sunday() + 7
        - day.weekday().num_days_from_sunday())
        % 7;
    day + Duration::days(days_ahead as i64)
}

/// One day of the Omer count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmerDay {
    pub date: String,
    /// Count within the 49-day period.
    pub omer: u32,
    pub title: String,
    #[serde(default)]
    pub hebrew: Option<String>,
}

/// Omer state for today, or the next count if today is outside the
/// period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmerStatus {
    pub date: String,
    pub today: Option<OmerDay>,
    pub next: Option<OmerDay>,
    pub in_omer_period: bool,
}

impl OmerStatus {
    /// Builds the status from a ranged calendar feed starting at
    /// `today`. The first omer event on `today` is today's count; the
    /// first after it is the next one.
    pub fn from_feed(feed: &CalendarFeed, today: NaiveDate) -> Self {
        let mut omer_events: Vec<&CalendarEvent> =
            feed.items.iter().filter(|e| e.is_omer()).collect();
        omer_events.sort_by_key(|e| e.day());

        let to_day = |event: &CalendarEvent| OmerDay {
            date: event.date.clone(),
            omer: parse_omer_count(&event.title).unwrap_or(0),
            title: event.title.clone(),
            hebrew: event.hebrew.clone(),
        };

        let today_event = omer_events
            .iter()
            .copied()
            .find(|e| e.day() == Some(today))
            .map(|e| to_day(e));
        let next_event = omer_events
            .iter()
            .copied()
            .find(|e| matches!(e.day(), Some(d) if d > today))
            .map(|e| to_day(e));

        // Within 49 days of the next count means the period is either
        // running or about to start.
        let in_omer_period = today_event.is_some()
            || omer_events.iter().any(|e| {
                matches!(e.day(), Some(d) if d > today && (d - today).num_days() < 49)
            });

        Self {
            date: today.to_string(),
            today: today_event,
            next: next_event,
            in_omer_period,
        }
    }
}

/// Extracts the day number from an omer event title like
/// "15th day of the Omer".
fn parse_omer_count(title: &str) -> Option<u32> {
    let digits: String = title.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Weekly Torah portion details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParashaInfo {
    pub name: String,
    #[serde(default)]
    pub hebrew: Option<String>,
    #[serde(default)]
    pub haftarah: Option<String>,
    pub date: String,
}

impl ParashaInfo {
    pub fn from_event(event: &CalendarEvent) -> Self {
        Self {
            name: event.title.clone(),
            hebrew: event.hebrew.clone(),
            haftarah: event
                .memo
                .as_deref()
                .and_then(extract_haftarah)
                .map(str::to_string),
            date: event.date.clone(),
        }
    }
}

/// Pulls the haftarah line out of a parasha event memo.
fn extract_haftarah(memo: &str) -> Option<&str> {
    memo.lines()
        .find(|line| line.starts_with("Haftarah"))
        .and_then(|line| line.splitn(2, ':').nth(1))
        .map(str::trim)
}

/// Location block from the Hebcal zmanim endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ZmanimLocation {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub tzid: Option<String>,
}

/// Detailed halachic times for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZmanimDetail {
    pub date: String,
    pub location: ZmanimLocation,
    /// Time name to RFC 3339 timestamp, as Hebcal returns them.
    pub times: std::collections::BTreeMap<String, String>,
}

impl ZmanimDetail {
    pub fn time(&self, name: &str) -> Option<DateTime<Utc>> {
        self.times
            .get(name)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn sunset(&self) -> Option<DateTime<Utc>> {
        self.time("sunset")
    }

    pub fn sunrise(&self) -> Option<DateTime<Utc>> {
        self.time("sunrise")
    }
}

/// Strips HTML tags and surrounding whitespace from a text segment.
pub fn clean_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut in_tag = false;
    for c in segment.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}
