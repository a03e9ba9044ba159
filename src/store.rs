use crate::model::{is_placeholder, FilterError, IpCount, LogRecord, TimeRange};
use crate::pipeline::rank_ips;
use crate::source::{FileSource, LogSource};
use chrono::NaiveDateTime;
use csv::StringRecord;
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Column names, in export order.
pub const REQUIRED_COLUMNS: [&str; 5] = ["Timestamp", "EventId", "SourceIP", "User", "Raw_Message"];

/// Year assumed for every row; sshd timestamps (`Dec 10 06:55:46`) carry none.
pub const DEFAULT_YEAR: i32 = 2024;

const TIMESTAMP_FORMAT: &str = "%Y %b %d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("log file not found: {}", path.display())]
    MissingFile { path: PathBuf },

    #[error("missing required columns: {}", missing.join(", "))]
    MissingColumns { missing: Vec<String> },

    #[error("failed to read log data")]
    Io(#[from] std::io::Error),

    #[error("malformed CSV input")]
    Csv(#[from] csv::Error),
}

/// Parses an sshd timestamp such as `Dec 10 06:55:46` (or `Dec  3 ...`)
/// into the given year. Returns `None` for anything else.
pub fn parse_timestamp(text: &str, year: i32) -> Option<NaiveDateTime> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(&format!("{year} {normalized}"), TIMESTAMP_FORMAT).ok()
}

/// Like [`parse_timestamp`], for user-supplied filter bounds.
pub fn parse_time_bound(text: &str, year: i32) -> Result<NaiveDateTime, FilterError> {
    parse_timestamp(text, year).ok_or_else(|| FilterError::BadTimestamp(text.to_string()))
}

/// Positions of the required columns in the header row.
struct ColumnIndex {
    timestamp: usize,
    event_id: usize,
    source_ip: usize,
    user: usize,
    raw_message: usize,
}

impl ColumnIndex {
    fn resolve(headers: &StringRecord) -> Result<Self, LoadError> {
        let position = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim_start_matches('\u{feff}').trim() == name)
        };

        let found: Vec<Option<usize>> = REQUIRED_COLUMNS
            .iter()
            .map(|&name| position(name))
            .collect();
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .zip(&found)
            .filter(|(_, idx)| idx.is_none())
            .map(|(name, _)| name.to_string())
            .collect();

        match found.as_slice() {
            [Some(timestamp), Some(event_id), Some(source_ip), Some(user), Some(raw_message)] => {
                Ok(Self {
                    timestamp: *timestamp,
                    event_id: *event_id,
                    source_ip: *source_ip,
                    user: *user,
                    raw_message: *raw_message,
                })
            }
            _ => Err(LoadError::MissingColumns { missing }),
        }
    }

    fn record(&self, row: &StringRecord, year: i32) -> LogRecord {
        let field = |idx: usize| row.get(idx).unwrap_or_default().to_string();
        let timestamp_text = field(self.timestamp);
        LogRecord {
            timestamp: parse_timestamp(&timestamp_text, year),
            timestamp_text,
            event_id: field(self.event_id),
            source_ip: field(self.source_ip),
            user: field(self.user),
            raw_message: field(self.raw_message),
        }
    }
}

/// Immutable, file-ordered collection of log records.
#[derive(Debug, Clone)]
pub struct LogStore {
    records: Vec<LogRecord>,
    unparsed_timestamps: usize,
    year: i32,
}

impl LogStore {
    /// Loads every row of `source`, assuming `year` for all timestamps.
    ///
    /// Rows whose timestamp does not parse are kept with `timestamp: None`.
    pub fn load(source: &dyn LogSource, year: i32) -> Result<Self, LoadError> {
        let reader = source.open()?;
        let store = Self::from_reader(reader, year)?;
        info!(
            source = %source.describe(),
            records = store.len(),
            unparsed_timestamps = store.unparsed_timestamps,
            year,
            "log store loaded"
        );
        Ok(store)
    }

    pub fn from_path(path: impl AsRef<Path>, year: i32) -> Result<Self, LoadError> {
        Self::load(&FileSource::new(path), year)
    }

    pub fn from_reader<R: Read>(reader: R, year: i32) -> Result<Self, LoadError> {
        let mut csv = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(reader);

        let columns = ColumnIndex::resolve(csv.headers()?)?;

        let mut records = Vec::new();
        let mut unparsed_timestamps = 0;
        for (idx, row) in csv.records().enumerate() {
            let record = columns.record(&row?, year);
            if record.timestamp.is_none() {
                unparsed_timestamps += 1;
                debug!(
                    row = idx + 2,
                    text = %record.timestamp_text,
                    "unparseable timestamp, row kept"
                );
            }
            records.push(record);
        }

        if unparsed_timestamps > 0 {
            warn!(
                count = unparsed_timestamps,
                "rows with unparseable timestamps are excluded from narrowed time ranges"
            );
        }

        Ok(Self {
            records,
            unparsed_timestamps,
            year,
        })
    }

    pub fn all(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn unparsed_timestamps(&self) -> usize {
        self.unparsed_timestamps
    }

    pub fn distinct_event_ids(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.event_id.as_str()).collect()
    }

    /// Users seen in the log, placeholders excluded.
    pub fn distinct_users(&self) -> BTreeSet<&str> {
        self.records
            .iter()
            .map(|r| r.user.as_str())
            .filter(|u| !is_placeholder(u))
            .collect()
    }

    /// Source IPs seen in the log, placeholders excluded.
    pub fn distinct_ips(&self) -> BTreeSet<&str> {
        self.records
            .iter()
            .map(|r| r.source_ip.as_str())
            .filter(|ip| !is_placeholder(ip))
            .collect()
    }

    pub fn ip_frequency(&self) -> HashMap<&str, usize> {
        let mut freq = HashMap::new();
        for record in &self.records {
            if !is_placeholder(&record.source_ip) {
                *freq.entry(record.source_ip.as_str()).or_insert(0) += 1;
            }
        }
        freq
    }

    /// The `n` most frequent IPs of the whole store, ties by first appearance.
    pub fn top_ips(&self, n: usize) -> Vec<IpCount> {
        rank_ips(self.records.iter(), n)
    }

    /// Earliest and latest parsed timestamps, `None` when there are none.
    pub fn time_span(&self) -> Option<TimeRange> {
        let mut stamps = self.records.iter().filter_map(|r| r.timestamp);
        let first = stamps.next()?;
        let (start, end) = stamps.fold((first, first), |(lo, hi), ts| (lo.min(ts), hi.max(ts)));
        Some(TimeRange { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockSource;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "\
Timestamp,EventId,SourceIP,User,Raw_Message
Dec 10 06:55:46,E27,173.234.31.186,None,\"reverse mapping checking getaddrinfo for ns.example [173.234.31.186] failed - POSSIBLE BREAK-IN ATTEMPT!\"
Dec 10 06:55:48,E9,173.234.31.186,root,Failed password for root from 173.234.31.186 port 38926 ssh2
not a time,E2,5.6.7.8,webmaster,Connection closed by 5.6.7.8 [preauth]
Dec 10 07:02:47,E10,5.6.7.8,bob,\"Failed password for invalid user bob from 5.6.7.8, port 5\"
";

    fn sample_store() -> LogStore {
        LogStore::load(&MockSource::new(SAMPLE), 2024).unwrap()
    }

    #[test]
    fn parses_sshd_timestamps() {
        let expected = NaiveDate::from_ymd_opt(2024, 12, 3)
            .and_then(|d| d.and_hms_opt(6, 5, 46))
            .unwrap();
        assert_eq!(parse_timestamp("Dec  3 06:05:46", 2024), Some(expected));
        assert_eq!(parse_timestamp("Dec 03 06:05:46", 2024), Some(expected));
        assert_eq!(parse_timestamp("", 2024), None);
        assert_eq!(parse_timestamp("Feb 29 00:00:00", 2023), None);
    }

    #[test]
    fn bad_time_bound_is_a_filter_error() {
        assert_eq!(
            parse_time_bound("Dec 10 06:55:46", 2024),
            Ok(parse_timestamp("Dec 10 06:55:46", 2024).unwrap())
        );
        assert_eq!(
            parse_time_bound("yesterday", 2024),
            Err(FilterError::BadTimestamp("yesterday".to_string()))
        );
    }

    #[test]
    fn keeps_file_order_and_unparsed_rows() {
        let store = sample_store();
        assert_eq!(store.len(), 4);
        let ids: Vec<&str> = store.all().iter().map(|r| r.event_id.as_str()).collect();
        assert_eq!(ids, vec!["E27", "E9", "E2", "E10"]);
        assert_eq!(store.unparsed_timestamps(), 1);
        assert_eq!(store.all()[2].timestamp, None);
        assert_eq!(store.all()[2].timestamp_text, "not a time");
    }

    #[test]
    fn raw_message_is_verbatim() {
        let store = sample_store();
        assert_eq!(
            store.all()[3].raw_message,
            "Failed password for invalid user bob from 5.6.7.8, port 5"
        );
    }

    #[test]
    fn columns_are_matched_by_name() {
        let data = "Extra, User ,Raw_Message,SourceIP,EventId,Timestamp\n\
                    x,alice,hello,9.9.9.9,E5,Dec 11 01:00:00\n";
        let store = LogStore::from_reader(data.as_bytes(), 2024).unwrap();
        let record = &store.all()[0];
        assert_eq!(record.user, "alice");
        assert_eq!(record.source_ip, "9.9.9.9");
        assert_eq!(record.event_id, "E5");
        assert!(record.timestamp.is_some());
    }

    #[test]
    fn missing_columns_are_reported() {
        let data = "Timestamp,EventId,User\nDec 10 06:55:46,E9,root\n";
        match LogStore::from_reader(data.as_bytes(), 2024) {
            Err(LoadError::MissingColumns { missing }) => {
                assert_eq!(missing, vec!["SourceIP".to_string(), "Raw_Message".to_string()]);
            }
            other => panic!("expected MissingColumns, got {other:?}"),
        }
    }

    #[test]
    fn empty_input_misses_every_column() {
        match LogStore::from_reader("".as_bytes(), 2024) {
            Err(LoadError::MissingColumns { missing }) => assert_eq!(missing.len(), 5),
            other => panic!("expected MissingColumns, got {other:?}"),
        }
    }

    #[test]
    fn header_only_source_loads_empty() {
        let mut source = MockSource::default();
        source.push("Timestamp,EventId,SourceIP,User,Raw_Message");
        let store = LogStore::load(&source, 2024).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.time_span(), None);

        source.push("Dec 10 06:55:46,E2,1.2.3.4,,");
        let store = LogStore::load(&source, 2024).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.all()[0].user, "");
        assert!(store.distinct_users().is_empty());
    }

    #[test]
    fn missing_file_is_reported() {
        let err = LogStore::from_path("/definitely/not/here.csv", 2024).unwrap_err();
        assert!(matches!(err, LoadError::MissingFile { .. }));
    }

    #[test]
    fn accessors_skip_placeholders() {
        let store = sample_store();
        assert_eq!(
            store.distinct_users().into_iter().collect::<Vec<_>>(),
            vec!["bob", "root", "webmaster"]
        );
        assert_eq!(store.distinct_event_ids().len(), 4);
        let freq = store.ip_frequency();
        assert_eq!(freq.get("173.234.31.186"), Some(&2));
        assert_eq!(freq.get("5.6.7.8"), Some(&2));
        assert_eq!(freq.get("None"), None);
    }

    #[test]
    fn top_ips_break_ties_by_first_appearance() {
        let top = sample_store().top_ips(5);
        let ips: Vec<&str> = top.iter().map(|c| c.ip.as_str()).collect();
        assert_eq!(ips, vec!["173.234.31.186", "5.6.7.8"]);
    }

    #[test]
    fn time_span_ignores_unparsed_rows() {
        let span = sample_store().time_span().unwrap();
        assert_eq!(span.start, parse_timestamp("Dec 10 06:55:46", 2024).unwrap());
        assert_eq!(span.end, parse_timestamp("Dec 10 07:02:47", 2024).unwrap());
    }
}
