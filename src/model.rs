use chrono::{NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Event codes counted as failed authentications unless overridden.
pub const DEFAULT_FAILURE_CODES: &[&str] = &["E9", "E10"];

/// Event codes counted as break-in attempts unless overridden.
pub const DEFAULT_INTRUSION_CODES: &[&str] = &["E27"];

/// Literal the sshd exporter writes when a row has no IP or user.
pub const NO_VALUE: &str = "None";

/// Returns true for `SourceIP` / `User` values that stand for "no value".
///
/// Placeholders stay on the record verbatim but are left out of rankings
/// and distinct counts.
pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value == NO_VALUE
}

/// Human label for a known sshd event code.
pub fn describe_event(code: &str) -> &'static str {
    match code {
        "E2" => "Connection closed",
        "E5" => "Too many auth failures",
        "E9" => "Failed password (root)",
        "E10" => "Failed password (invalid user)",
        "E12" => "Invalid user auth request",
        "E13" => "Invalid user",
        "E14" => "Message repeated",
        "E17" => "PAM auth failures",
        "E18" => "PAM ignoring max retries",
        "E19" => "PAM auth failure",
        "E20" => "PAM auth failure (root)",
        "E21" => "PAM check pass - user unknown",
        "E24" => "Received disconnect",
        "E27" => "POSSIBLE BREAK-IN ATTEMPT",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("time range start {start} is after end {end}")]
    InvertedRange {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },

    #[error("unknown granularity '{0}', expected 'hour' or 'day'")]
    UnknownGranularity(String),

    #[error("unparseable timestamp '{0}'")]
    BadTimestamp(String),
}

/// A single row of the SSH authentication log.
///
/// `timestamp` is `None` when `timestamp_text` could not be parsed; the row
/// is still kept. The original text is what gets exported, so unparsed rows
/// survive a save/load cycle unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: Option<NaiveDateTime>,
    pub timestamp_text: String,
    pub event_id: String,
    pub source_ip: String,
    pub user: String,
    pub raw_message: String,
}

/// Closed interval `[start, end]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "TimeRangeBounds")]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Wire shape of a `TimeRange`, checked on the way in.
#[derive(Deserialize)]
struct TimeRangeBounds {
    start: NaiveDateTime,
    end: NaiveDateTime,
}

impl TryFrom<TimeRangeBounds> for TimeRange {
    type Error = FilterError;

    fn try_from(bounds: TimeRangeBounds) -> Result<Self, Self::Error> {
        TimeRange::new(bounds.start, bounds.end)
    }
}

impl TimeRange {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, FilterError> {
        if start > end {
            return Err(FilterError::InvertedRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.start <= ts && ts <= self.end
    }

    /// True when `other` lies entirely inside this range.
    pub fn covers(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Source IP selection. Each populated mode is active; a record passes when
/// any active mode accepts it. No active mode means no restriction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct IpFilter {
    pub selected: BTreeSet<String>,
    /// Keep the N most frequent IPs of the whole store.
    pub top_n: Option<usize>,
    /// Substring match against the source IP. Empty means inactive.
    pub pattern: Option<String>,
}

impl IpFilter {
    pub fn active_pattern(&self) -> Option<&str> {
        self.pattern.as_deref().filter(|p| !p.is_empty())
    }

    pub fn is_active(&self) -> bool {
        !self.selected.is_empty() || self.top_n.is_some() || self.active_pattern().is_some()
    }
}

/// Criteria for one pipeline call. Empty sets mean "no restriction".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FilterSpec {
    pub event_ids: BTreeSet<String>,
    pub ip: IpFilter,
    pub users: BTreeSet<String>,
    pub time_range: Option<TimeRange>,
}

impl FilterSpec {
    pub fn with_event_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ips<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ip.selected = ips.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_top_n(mut self, n: usize) -> Self {
        self.ip.top_n = Some(n);
        self
    }

    pub fn with_ip_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.ip.pattern = Some(pattern.into());
        self
    }

    pub fn with_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.users = users.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }
}

/// Which event codes count as failures and which as intrusions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventCategories {
    pub failure: BTreeSet<String>,
    pub intrusion: BTreeSet<String>,
}

impl Default for EventCategories {
    fn default() -> Self {
        Self::from_codes(
            DEFAULT_FAILURE_CODES.iter().copied(),
            DEFAULT_INTRUSION_CODES.iter().copied(),
        )
    }
}

impl EventCategories {
    pub fn from_codes<F, I, S, T>(failure: F, intrusion: I) -> Self
    where
        F: IntoIterator<Item = S>,
        I: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            failure: failure.into_iter().map(Into::into).collect(),
            intrusion: intrusion.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_failure(&self, event_id: &str) -> bool {
        self.failure.contains(event_id)
    }

    pub fn is_intrusion(&self, event_id: &str) -> bool {
        self.intrusion.contains(event_id)
    }
}

/// Bucket width of the time series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Hour,
    Day,
}

impl Granularity {
    pub fn floor(self, ts: NaiveDateTime) -> NaiveDateTime {
        let midnight = ts.date().and_time(NaiveTime::MIN);
        match self {
            Granularity::Hour => midnight + TimeDelta::hours(i64::from(ts.hour())),
            Granularity::Day => midnight,
        }
    }

    pub fn step(self) -> TimeDelta {
        match self {
            Granularity::Hour => TimeDelta::hours(1),
            Granularity::Day => TimeDelta::days(1),
        }
    }
}

impl FromStr for Granularity {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" | "hourly" | "h" => Ok(Granularity::Hour),
            "day" | "daily" | "d" => Ok(Granularity::Day),
            _ => Err(FilterError::UnknownGranularity(s.to_string())),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Hour => f.write_str("hour"),
            Granularity::Day => f.write_str("day"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpCount {
    pub ip: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventCount {
    pub event_id: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeBucket {
    pub start: NaiveDateTime,
    pub count: usize,
}

/// Summary of a bucket series. Ties go to the earliest bucket.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct SeriesStats {
    pub busiest: TimeBucket,
    pub quietest: TimeBucket,
    pub mean: f64,
}

/// Column of the raw record view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortColumn {
    Timestamp,
    EventId,
    SourceIp,
    User,
    RawMessage,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}
