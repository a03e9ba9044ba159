use crate::model::{
    is_placeholder, EventCategories, EventCount, FilterSpec, Granularity, IpCount, LogRecord,
    SeriesStats, SortColumn, SortOrder, TimeBucket, TimeRange,
};
use crate::store::{LogStore, REQUIRED_COLUMNS};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Length of the ranked IP list in every result.
pub const TOP_IPS_LIMIT: usize = 5;

/// Widest time series a narrowed window may produce.
pub const MAX_SERIES_BUCKETS: i64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to encode CSV row")]
    Csv(#[from] csv::Error),

    #[error("failed to flush CSV output")]
    Io(#[from] std::io::Error),
}

/// Ranks source IPs by count descending, then by first appearance.
/// Placeholder IPs are not ranked.
pub(crate) fn rank_ips<'a, I>(records: I, n: usize) -> Vec<IpCount>
where
    I: IntoIterator<Item = &'a LogRecord>,
{
    let mut tally: HashMap<&str, (usize, usize)> = HashMap::new();
    for (idx, record) in records.into_iter().enumerate() {
        if is_placeholder(&record.source_ip) {
            continue;
        }
        tally.entry(record.source_ip.as_str()).or_insert((0, idx)).0 += 1;
    }

    let mut ranked: Vec<(&str, (usize, usize))> = tally.into_iter().collect();
    ranked.sort_by(|(_, (a_count, a_first)), (_, (b_count, b_first))| {
        b_count.cmp(a_count).then(a_first.cmp(b_first))
    });
    ranked
        .into_iter()
        .take(n)
        .map(|(ip, (count, _))| IpCount {
            ip: ip.to_string(),
            count,
        })
        .collect()
}

/// Filtered view of a store plus everything the dashboard draws from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilteredResult<'a> {
    pub records: Vec<&'a LogRecord>,
    pub total: usize,
    pub distinct_ip_count: usize,
    pub distinct_user_count: usize,
    pub failed_auth_count: usize,
    pub break_in_count: usize,
    pub top_ips: Vec<IpCount>,
    /// Ordered by first appearance in the filtered records.
    pub event_type_counts: Vec<EventCount>,
    pub time_series: Vec<TimeBucket>,
}

impl FilteredResult<'_> {
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn failed_auth_ratio(&self) -> f64 {
        ratio(self.failed_auth_count, self.total)
    }

    /// Share of the store that passed the filter.
    pub fn coverage(&self, store: &LogStore) -> f64 {
        ratio(self.total, store.len())
    }

    pub fn series_stats(&self) -> Option<SeriesStats> {
        let (first, rest) = self.time_series.split_first()?;
        let mut busiest = *first;
        let mut quietest = *first;
        for bucket in rest {
            if bucket.count > busiest.count {
                busiest = *bucket;
            }
            if bucket.count < quietest.count {
                quietest = *bucket;
            }
        }
        let sum: usize = self.time_series.iter().map(|b| b.count).sum();
        Some(SeriesStats {
            busiest,
            quietest,
            mean: sum as f64 / self.time_series.len() as f64,
        })
    }
}

fn bucket_count(range: TimeRange, granularity: Granularity) -> i64 {
    let first = granularity.floor(range.start);
    let last = granularity.floor(range.end);
    (last - first).num_seconds() / granularity.step().num_seconds() + 1
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Per-call view of a `FilterSpec` resolved against one store.
struct Matcher<'s> {
    spec: &'s FilterSpec,
    top: Option<HashSet<String>>,
    pattern: Option<&'s str>,
    /// `None` when the time filter does not restrict anything.
    window: Option<TimeRange>,
    data_span: Option<TimeRange>,
}

impl<'s> Matcher<'s> {
    fn new(store: &LogStore, spec: &'s FilterSpec) -> Self {
        let data_span = store.time_span();
        let top = spec
            .ip
            .top_n
            .map(|n| store.top_ips(n).into_iter().map(|c| c.ip).collect());
        // A range spanning the whole dataset is the untouched default and
        // lets null-timestamp rows through; anything narrower does not.
        let window = spec
            .time_range
            .filter(|range| !data_span.is_some_and(|span| range.covers(&span)));

        Self {
            spec,
            top,
            pattern: spec.ip.active_pattern(),
            window,
            data_span,
        }
    }

    fn matches(&self, record: &LogRecord) -> bool {
        self.event_ok(record) && self.ip_ok(record) && self.user_ok(record) && self.time_ok(record)
    }

    fn event_ok(&self, record: &LogRecord) -> bool {
        self.spec.event_ids.is_empty() || self.spec.event_ids.contains(&record.event_id)
    }

    fn ip_ok(&self, record: &LogRecord) -> bool {
        if !self.spec.ip.is_active() {
            return true;
        }
        self.spec.ip.selected.contains(&record.source_ip)
            || self
                .top
                .as_ref()
                .is_some_and(|top| top.contains(&record.source_ip))
            || self.pattern.is_some_and(|p| record.source_ip.contains(p))
    }

    fn user_ok(&self, record: &LogRecord) -> bool {
        self.spec.users.is_empty() || self.spec.users.contains(&record.user)
    }

    fn time_ok(&self, record: &LogRecord) -> bool {
        match self.window {
            None => true,
            Some(window) => record.timestamp.is_some_and(|ts| window.contains(ts)),
        }
    }

    /// Interval the time series must cover: the whole narrowed window, or
    /// the filtered records' extent when the time filter is unrestricted.
    fn series_span(
        &self,
        records: &[&LogRecord],
        granularity: Granularity,
    ) -> Option<TimeRange> {
        match self.window {
            Some(window) if bucket_count(window, granularity) <= MAX_SERIES_BUCKETS => {
                Some(window)
            }
            Some(window) => {
                // Half-open requests reach back to the calendar's edge; draw
                // only the part of such a window that holds data.
                let data = self.data_span?;
                let start = window.start.max(data.start);
                let end = window.end.min(data.end);
                (start <= end).then_some(TimeRange { start, end })
            }
            None => {
                let mut stamps = records.iter().filter_map(|r| r.timestamp);
                let first = stamps.next()?;
                let (start, end) =
                    stamps.fold((first, first), |(lo, hi), ts| (lo.min(ts), hi.max(ts)));
                Some(TimeRange { start, end })
            }
        }
    }
}

/// Turns a `LogStore` and a `FilterSpec` into a `FilteredResult`.
///
/// Holds only configuration; every call recomputes from scratch.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    categories: EventCategories,
    granularity: Granularity,
}

impl Pipeline {
    pub fn new(categories: EventCategories, granularity: Granularity) -> Self {
        Self {
            categories,
            granularity,
        }
    }

    pub fn categories(&self) -> &EventCategories {
        &self.categories
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn apply<'a>(&self, store: &'a LogStore, spec: &FilterSpec) -> FilteredResult<'a> {
        let matcher = Matcher::new(store, spec);
        let records: Vec<&'a LogRecord> =
            store.all().iter().filter(|r| matcher.matches(r)).collect();

        let time_series = if records.is_empty() {
            Vec::new()
        } else {
            self.bucket(&records, matcher.series_span(&records, self.granularity))
        };

        let result = self.aggregate(records, time_series);
        debug!(
            total = result.total,
            of = store.len(),
            buckets = result.time_series.len(),
            "filter applied"
        );
        result
    }

    fn aggregate<'a>(
        &self,
        records: Vec<&'a LogRecord>,
        time_series: Vec<TimeBucket>,
    ) -> FilteredResult<'a> {
        let mut ips = HashSet::new();
        let mut users = HashSet::new();
        let mut failed_auth_count = 0;
        let mut break_in_count = 0;
        let mut event_type_counts: Vec<EventCount> = Vec::new();
        let mut event_slots: HashMap<&str, usize> = HashMap::new();

        for record in &records {
            if !is_placeholder(&record.source_ip) {
                ips.insert(record.source_ip.as_str());
            }
            if !is_placeholder(&record.user) {
                users.insert(record.user.as_str());
            }
            if self.categories.is_failure(&record.event_id) {
                failed_auth_count += 1;
            }
            if self.categories.is_intrusion(&record.event_id) {
                break_in_count += 1;
            }

            let slot = *event_slots.entry(record.event_id.as_str()).or_insert_with(|| {
                event_type_counts.push(EventCount {
                    event_id: record.event_id.clone(),
                    count: 0,
                });
                event_type_counts.len() - 1
            });
            event_type_counts[slot].count += 1;
        }

        FilteredResult {
            total: records.len(),
            distinct_ip_count: ips.len(),
            distinct_user_count: users.len(),
            failed_auth_count,
            break_in_count,
            top_ips: rank_ips(records.iter().copied(), TOP_IPS_LIMIT),
            event_type_counts,
            time_series,
            records,
        }
    }

    fn bucket(&self, records: &[&LogRecord], span: Option<TimeRange>) -> Vec<TimeBucket> {
        let Some(span) = span else {
            return Vec::new();
        };

        let mut counts: BTreeMap<NaiveDateTime, usize> = BTreeMap::new();
        for ts in records.iter().filter_map(|r| r.timestamp) {
            *counts.entry(self.granularity.floor(ts)).or_insert(0) += 1;
        }

        let last = self.granularity.floor(span.end);
        let mut cursor = Some(self.granularity.floor(span.start));
        let mut series = Vec::new();
        while let Some(start) = cursor.filter(|c| *c <= last) {
            if series.len() as i64 >= MAX_SERIES_BUCKETS {
                break;
            }
            series.push(TimeBucket {
                start,
                count: counts.get(&start).copied().unwrap_or(0),
            });
            cursor = start.checked_add_signed(self.granularity.step());
        }
        series
    }
}

/// Serializes the filtered records as CSV with the five source columns.
///
/// Timestamps are written as their original text, so the output loads back
/// into an identical `LogStore` given the same year.
pub fn to_csv(result: &FilteredResult<'_>) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(REQUIRED_COLUMNS)?;
    for record in &result.records {
        writer.write_record([
            record.timestamp_text.as_str(),
            record.event_id.as_str(),
            record.source_ip.as_str(),
            record.user.as_str(),
            record.raw_message.as_str(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|err| ExportError::Io(err.into_error()))
}

/// Stable sort of a record view by one column.
pub fn sort_records(records: &mut [&LogRecord], column: SortColumn, order: SortOrder) {
    records.sort_by(|a, b| {
        let ord = compare_by(a, b, column);
        match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });
}

fn compare_by(a: &LogRecord, b: &LogRecord, column: SortColumn) -> Ordering {
    match column {
        SortColumn::Timestamp => a.timestamp.cmp(&b.timestamp),
        SortColumn::EventId => a.event_id.cmp(&b.event_id),
        SortColumn::SourceIp => a.source_ip.cmp(&b.source_ip),
        SortColumn::User => a.user.cmp(&b.user),
        SortColumn::RawMessage => a.raw_message.cmp(&b.raw_message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::parse_timestamp;
    use pretty_assertions::assert_eq;

    const LOG: &str = "\
Timestamp,EventId,SourceIP,User,Raw_Message
Dec 10 06:55:46,E27,1.2.3.4,root,break-in
Dec 10 06:58:10,E9,1.2.3.4,root,failed root
Dec 10 09:01:00,E2,5.6.7.8,bob,closed
garbage,E10,9.9.9.9,bob,failed invalid
Dec 10 09:30:00,E10,5.6.7.8,None,failed invalid
";

    fn store() -> LogStore {
        LogStore::from_reader(LOG.as_bytes(), 2024).unwrap()
    }

    fn ts(text: &str) -> NaiveDateTime {
        parse_timestamp(text, 2024).unwrap()
    }

    fn range(start: &str, end: &str) -> TimeRange {
        TimeRange::new(ts(start), ts(end)).unwrap()
    }

    fn ips(result: &FilteredResult<'_>) -> Vec<(String, usize)> {
        result
            .top_ips
            .iter()
            .map(|c| (c.ip.clone(), c.count))
            .collect()
    }

    #[test]
    fn empty_spec_keeps_everything() {
        let store = store();
        let result = Pipeline::default().apply(&store, &FilterSpec::default());
        assert_eq!(result.total, 5);
        assert_eq!(result.distinct_ip_count, 3);
        assert_eq!(result.distinct_user_count, 2);
        assert_eq!(result.failed_auth_count, 3);
        assert_eq!(result.break_in_count, 1);
        assert_eq!(result.coverage(&store), 1.0);
    }

    #[test]
    fn event_counts_follow_first_appearance() {
        let store = store();
        let result = Pipeline::default().apply(&store, &FilterSpec::default());
        let counts: Vec<(&str, usize)> = result
            .event_type_counts
            .iter()
            .map(|c| (c.event_id.as_str(), c.count))
            .collect();
        assert_eq!(counts, vec![("E27", 1), ("E9", 1), ("E2", 1), ("E10", 2)]);
    }

    #[test]
    fn top_ips_rank_by_count_then_first_seen() {
        let store = store();
        let result = Pipeline::default().apply(&store, &FilterSpec::default());
        assert_eq!(
            ips(&result),
            vec![
                ("1.2.3.4".to_string(), 2),
                ("5.6.7.8".to_string(), 2),
                ("9.9.9.9".to_string(), 1),
            ]
        );
    }

    #[test]
    fn ip_modes_are_or_ed() {
        let store = store();
        let spec = FilterSpec::default()
            .with_ips(["9.9.9.9"])
            .with_ip_pattern("5.6");
        let result = Pipeline::default().apply(&store, &spec);
        assert_eq!(result.total, 3);
        assert!(result
            .records
            .iter()
            .all(|r| r.source_ip == "9.9.9.9" || r.source_ip == "5.6.7.8"));
    }

    #[test]
    fn top_n_uses_whole_store_frequency() {
        let store = store();
        let spec = FilterSpec::default().with_top_n(1);
        let result = Pipeline::default().apply(&store, &spec);
        assert_eq!(result.total, 2);
        assert_eq!(ips(&result), vec![("1.2.3.4".to_string(), 2)]);

        let none = Pipeline::default().apply(&store, &FilterSpec::default().with_top_n(0));
        assert!(none.is_empty());
    }

    #[test]
    fn categories_are_and_ed() {
        let store = store();
        let spec = FilterSpec::default()
            .with_event_ids(["E10"])
            .with_users(["bob"]);
        let result = Pipeline::default().apply(&store, &spec);
        assert_eq!(result.total, 1);
        assert_eq!(result.records[0].source_ip, "9.9.9.9");
    }

    #[test]
    fn full_range_lets_unparsed_rows_through() {
        let store = store();
        let spec = FilterSpec::default().with_time_range(store.time_span().unwrap());
        let result = Pipeline::default().apply(&store, &spec);
        assert_eq!(result.total, store.len());
    }

    #[test]
    fn narrowed_range_hides_unparsed_rows() {
        let store = store();
        let spec =
            FilterSpec::default().with_time_range(range("Dec 10 06:55:46", "Dec 10 09:01:00"));
        let result = Pipeline::default().apply(&store, &spec);
        assert_eq!(result.total, 3);
        assert!(result.records.iter().all(|r| r.timestamp.is_some()));
    }

    #[test]
    fn zero_width_range_selects_exact_instant() {
        let store = store();
        let spec =
            FilterSpec::default().with_time_range(range("Dec 10 06:58:10", "Dec 10 06:58:10"));
        let result = Pipeline::default().apply(&store, &spec);
        assert_eq!(result.total, 1);
        assert_eq!(result.records[0].event_id, "E9");
    }

    #[test]
    fn series_fills_empty_hours() {
        let store = store();
        let result = Pipeline::default().apply(&store, &FilterSpec::default());
        let series: Vec<(NaiveDateTime, usize)> =
            result.time_series.iter().map(|b| (b.start, b.count)).collect();
        assert_eq!(
            series,
            vec![
                (ts("Dec 10 06:00:00"), 2),
                (ts("Dec 10 07:00:00"), 0),
                (ts("Dec 10 08:00:00"), 0),
                (ts("Dec 10 09:00:00"), 2),
            ]
        );

        let stats = result.series_stats().unwrap();
        assert_eq!(stats.busiest.start, ts("Dec 10 06:00:00"));
        assert_eq!(stats.quietest.start, ts("Dec 10 07:00:00"));
        assert_eq!(stats.mean, 1.0);
    }

    #[test]
    fn series_covers_narrowed_window() {
        let store = store();
        let spec =
            FilterSpec::default().with_time_range(range("Dec 10 07:10:00", "Dec 10 08:20:00"));
        let result = Pipeline::default().apply(&store, &spec);
        assert!(result.is_empty());
        assert!(result.time_series.is_empty());

        let spec = FilterSpec::default()
            .with_event_ids(["E9"])
            .with_time_range(range("Dec 10 06:00:00", "Dec 10 08:20:00"));
        let result = Pipeline::default().apply(&store, &spec);
        let counts: Vec<usize> = result.time_series.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![1, 0, 0]);
    }

    #[test]
    fn series_keeps_empty_buckets_before_first_record() {
        let store = store();
        let spec =
            FilterSpec::default().with_time_range(range("Dec 10 04:00:00", "Dec 10 07:30:00"));
        let result = Pipeline::default().apply(&store, &spec);
        let series: Vec<(NaiveDateTime, usize)> =
            result.time_series.iter().map(|b| (b.start, b.count)).collect();
        assert_eq!(
            series,
            vec![
                (ts("Dec 10 04:00:00"), 0),
                (ts("Dec 10 05:00:00"), 0),
                (ts("Dec 10 06:00:00"), 2),
                (ts("Dec 10 07:00:00"), 0),
            ]
        );
    }

    #[test]
    fn open_ended_window_is_drawn_over_the_data() {
        let store = store();
        let spec = FilterSpec::default().with_time_range(TimeRange {
            start: NaiveDateTime::MIN,
            end: ts("Dec 10 07:30:00"),
        });
        let result = Pipeline::default().apply(&store, &spec);
        assert_eq!(result.total, 2);
        let starts: Vec<NaiveDateTime> = result.time_series.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![ts("Dec 10 06:00:00"), ts("Dec 10 07:00:00")]);
    }

    #[test]
    fn window_at_the_calendar_edge_does_not_overflow() {
        let store = store();
        let records: Vec<&LogRecord> = store.all().iter().collect();
        let edge = TimeRange::new(NaiveDateTime::MAX, NaiveDateTime::MAX).unwrap();
        let series = Pipeline::default().bucket(&records, Some(edge));
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].count, 0);
    }

    #[test]
    fn daily_granularity() {
        let store = store();
        let pipeline = Pipeline::new(EventCategories::default(), Granularity::Day);
        let result = pipeline.apply(&store, &FilterSpec::default());
        assert_eq!(result.time_series.len(), 1);
        assert_eq!(result.time_series[0].count, 4);
    }

    #[test]
    fn custom_categories() {
        let store = store();
        let pipeline = Pipeline::new(
            EventCategories::from_codes(["E2"], ["E9", "E27"]),
            Granularity::Hour,
        );
        let result = pipeline.apply(&store, &FilterSpec::default());
        assert_eq!(result.failed_auth_count, 1);
        assert_eq!(result.break_in_count, 2);
    }

    #[test]
    fn empty_result_is_well_formed() {
        let store = store();
        let spec = FilterSpec::default().with_event_ids(["E99"]);
        let result = Pipeline::default().apply(&store, &spec);
        assert_eq!(result.total, 0);
        assert_eq!(result.distinct_ip_count, 0);
        assert!(result.top_ips.is_empty());
        assert!(result.event_type_counts.is_empty());
        assert_eq!(result.failed_auth_ratio(), 0.0);
        assert_eq!(result.series_stats(), None);
        assert_eq!(
            String::from_utf8(to_csv(&result).unwrap()).unwrap(),
            "Timestamp,EventId,SourceIP,User,Raw_Message\n"
        );
    }

    #[test]
    fn sorting_is_stable_and_reversible() {
        let store = store();
        let result = Pipeline::default().apply(&store, &FilterSpec::default());

        let mut rows = result.records.clone();
        sort_records(&mut rows, SortColumn::Timestamp, SortOrder::Asc);
        assert_eq!(rows[0].timestamp, None);
        assert_eq!(rows[1].event_id, "E27");

        sort_records(&mut rows, SortColumn::User, SortOrder::Desc);
        let users: Vec<&str> = rows.iter().map(|r| r.user.as_str()).collect();
        assert_eq!(users, vec!["root", "root", "bob", "bob", "None"]);
    }
}
