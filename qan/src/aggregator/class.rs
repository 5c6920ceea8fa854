//! A class: every event sharing one fingerprint and connection identity.

use qan_slowlog::{Event, event::QUERY_TIME};
use rustc_hash::FxHashMap;
use serde::Serialize;
use time::{OffsetDateTime, UtcOffset, macros::format_description};
use tracing::debug;

use super::stats::Metrics;

/// Default cap on the size of an example's query text, bytes.
pub const DEFAULT_MAX_EXAMPLE_BYTES: usize = 20_480;
/// Appended to example queries cut at the cap.
const TRUNCATED_SUFFIX: &str = "...";
/// The number metric whose non-zero values are tallied as error codes.
const ERRNO_METRIC: &str = "Last_errno";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
/// The slowest event seen in a class.
pub struct Example {
    /// `Query_time` of the event, seconds
    pub query_time: f64,
    /// Database the query ran against
    pub db: String,
    /// Query text, possibly truncated
    pub query: String,
    /// Length of the untruncated query text, bytes
    pub size: usize,
    /// Whether `query` was cut short
    pub truncated: bool,
    /// `YYYY-MM-DD HH:MM:SS`, empty if the event carried no time
    pub ts: String,
    #[serde(skip)]
    at: Option<OffsetDateTime>,
}

/// Cut `query` to at most `max` bytes, suffix included, on a char boundary.
fn truncate(query: &str, max: usize) -> (String, bool) {
    if query.len() <= max {
        return (query.to_string(), false);
    }
    let mut end = max.saturating_sub(TRUNCATED_SUFFIX.len());
    while !query.is_char_boundary(end) {
        end -= 1;
    }
    (format!("{}{TRUNCATED_SUFFIX}", &query[..end]), true)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
/// Aggregate of one class.
///
/// A class is fed with [`Class::add_event`] and finalized once with
/// [`Class::finalize`], which discards the raw values behind every
/// statistic.
pub struct Class {
    /// Checksum of `fingerprint`
    pub id: String,
    /// Normalized query text
    pub fingerprint: String,
    /// Connecting user
    pub user: String,
    /// Connecting host
    pub host: String,
    /// Database
    pub db: String,
    /// Server the events came from
    pub server: String,
    /// Per-metric statistics
    pub metrics: Metrics,
    /// Queries in the class, scaled by the rate limit once finalized
    pub total_queries: u64,
    /// Distinct classes summarized, 1 for all but the global class
    pub unique_queries: u64,
    /// The slowest event, if samples are kept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<Example>,
    /// Error codes seen, parallel to `errors_count`
    pub errors_code: Vec<u64>,
    /// Occurrences of each entry of `errors_code`
    pub errors_count: Vec<u64>,

    #[serde(skip)]
    outliers: u64,
    #[serde(skip)]
    last_db: String,
    #[serde(skip)]
    samples: bool,
    #[serde(skip)]
    max_example_bytes: usize,
    #[serde(skip)]
    errors: FxHashMap<u64, u64>,
    #[serde(skip)]
    finalized: bool,
}

impl Class {
    /// Create an empty class. With `samples` set the class keeps its slowest
    /// event as an [`Example`].
    #[must_use]
    pub fn new(id: &str, fingerprint: &str, samples: bool) -> Self {
        Self {
            id: id.to_string(),
            fingerprint: fingerprint.to_string(),
            user: String::new(),
            host: String::new(),
            db: String::new(),
            server: String::new(),
            metrics: Metrics::default(),
            total_queries: 0,
            unique_queries: 1,
            example: None,
            errors_code: Vec::new(),
            errors_count: Vec::new(),
            outliers: 0,
            last_db: String::new(),
            samples,
            max_example_bytes: DEFAULT_MAX_EXAMPLE_BYTES,
            errors: FxHashMap::default(),
            finalized: false,
        }
    }

    /// Cap example query text at `max` bytes.
    #[must_use]
    pub fn with_max_example_bytes(mut self, max: usize) -> Self {
        self.max_example_bytes = max;
        self
    }

    /// Outlier events folded in so far.
    #[must_use]
    pub fn outliers(&self) -> u64 {
        self.outliers
    }

    /// Fold `event` into the class.
    pub fn add_event(&mut self, event: &Event, outlier: bool) {
        if outlier {
            self.outliers += 1;
        } else {
            self.total_queries += 1;
        }
        self.metrics.add_event(event, outlier);

        if let Some(&errno) = event
            .number_metrics
            .get(ERRNO_METRIC)
            .filter(|errno| **errno != 0)
        {
            *self.errors.entry(errno).or_default() += 1;
        }
        if !event.db.is_empty() {
            self.last_db.clone_from(&event.db);
        }

        if !self.samples {
            return;
        }
        let Some(query_time) = event
            .time_metrics
            .get(QUERY_TIME)
            .copied()
            .filter(|secs| secs.is_finite())
        else {
            return;
        };
        if self
            .example
            .as_ref()
            .is_some_and(|example| query_time <= example.query_time)
        {
            return;
        }
        let (query, truncated) = truncate(&event.query, self.max_example_bytes);
        self.example = Some(Example {
            query_time,
            db: if event.db.is_empty() {
                self.last_db.clone()
            } else {
                event.db.clone()
            },
            query,
            size: event.query.len(),
            truncated,
            ts: String::new(),
            at: event.ts,
        });
    }

    /// Compute final statistics. `rate_limit` 0 is taken as 1. Only the first
    /// call has an effect.
    pub fn finalize(&mut self, rate_limit: u64, utc_offset: UtcOffset) {
        if self.finalized {
            debug!("class {id} already finalized", id = self.id);
            return;
        }
        self.finalized = true;

        let rate_limit = rate_limit.max(1);
        self.total_queries = self
            .total_queries
            .saturating_mul(rate_limit)
            .saturating_add(self.outliers);
        self.metrics.finalize(rate_limit, self.total_queries);

        if self
            .example
            .as_ref()
            .is_some_and(|example| example.query_time.is_nan() || example.query_time <= 0.0)
        {
            self.example = None;
        }
        let at = self.example.as_ref().and_then(|example| example.at);
        if let (Some(example), Some(at)) = (self.example.as_mut(), at) {
            let local = at.to_offset(UtcOffset::UTC)
                + time::Duration::seconds(i64::from(utc_offset.whole_seconds()));
            example.ts = local
                .format(format_description!(
                    "[year]-[month]-[day] [hour]:[minute]:[second]"
                ))
                .unwrap_or_default();
        }

        let mut errors: Vec<(u64, u64)> = self.errors.drain().collect();
        errors.sort_unstable();
        (self.errors_code, self.errors_count) = errors.into_iter().unzip();
    }
}

#[cfg(test)]
mod tests {
    use qan_slowlog::Event;
    use time::{UtcOffset, macros::datetime};

    use super::{Class, truncate};

    fn event(query: &str, query_time: f64) -> Event {
        let mut event = Event::default();
        event.query = query.to_string();
        event.time_metrics.insert("Query_time".to_string(), query_time);
        event
    }

    #[test]
    fn rate_limited_totals() {
        let mut class = Class::new("A", "select ?", false);
        for _ in 0..3 {
            class.add_event(&event("select 1", 0.5), false);
        }
        class.add_event(&event("select 2", 9.0), true);
        assert_eq!(class.outliers(), 1);

        class.finalize(10, UtcOffset::UTC);
        assert_eq!(class.total_queries, 3 * 10 + 1);
        assert_eq!(class.metrics.time_metrics["Query_time"].sum, 24.0);

        // Finalizing again changes nothing.
        class.finalize(10, UtcOffset::UTC);
        assert_eq!(class.total_queries, 31);
    }

    #[test]
    fn zero_rate_limit_is_one() {
        let mut class = Class::new("A", "select ?", false);
        class.add_event(&event("select 1", 0.5), false);
        class.finalize(0, UtcOffset::UTC);
        assert_eq!(class.total_queries, 1);
    }

    #[test]
    fn example_is_slowest_event() {
        let mut class = Class::new("A", "select ?", true);
        let mut slow = event("select 2", 3.0);
        slow.ts = Some(datetime!(2018-04-06 08:11:33.5 UTC));
        class.add_event(&event("select 1", 1.0), false);
        class.add_event(&slow, false);
        class.add_event(&event("select 3", 2.0), false);
        class.finalize(1, UtcOffset::UTC);

        let example = class.example.expect("example");
        assert_eq!(example.query, "select 2");
        assert_eq!(example.query_time, 3.0);
        assert_eq!(example.ts, "2018-04-06 08:11:33");
    }

    #[test]
    fn example_db_falls_back_to_last_seen() {
        let mut class = Class::new("A", "select ?", true);
        let mut first = event("select 1", 1.0);
        first.db = "shop".to_string();
        class.add_event(&first, false);
        class.add_event(&event("select 2", 2.0), false);
        class.finalize(1, UtcOffset::UTC);
        assert_eq!(class.example.expect("example").db, "shop");
    }

    #[test]
    fn example_ts_is_shifted() {
        let mut class = Class::new("A", "select ?", true);
        let mut e = event("select 1", 1.0);
        e.ts = Some(datetime!(2018-04-06 23:30:00 UTC));
        class.add_event(&e, false);
        class.finalize(1, UtcOffset::from_hms(2, 0, 0).expect("offset"));
        assert_eq!(class.example.expect("example").ts, "2018-04-07 01:30:00");
    }

    #[test]
    fn zero_time_example_is_dropped() {
        let mut class = Class::new("A", "select ?", true);
        class.add_event(&event("select 1", 0.0), false);
        class.finalize(1, UtcOffset::UTC);
        assert!(class.example.is_none());
    }

    #[test]
    fn non_finite_time_never_becomes_example() {
        let mut class = Class::new("A", "select ?", true);
        class.add_event(&event("select 1", 1.0), false);
        class.add_event(&event("select 2", f64::NAN), false);
        class.add_event(&event("select 3", f64::INFINITY), false);
        class.finalize(0, UtcOffset::UTC);
        let example = class.example.as_ref().expect("example");
        assert_eq!(example.query, "select 1");

        let mut only_nan = Class::new("A", "select ?", true);
        only_nan.add_event(&event("select 2", f64::NAN), false);
        only_nan.finalize(0, UtcOffset::UTC);
        assert!(only_nan.example.is_none());
    }

    #[test]
    fn no_samples_no_example() {
        let mut class = Class::new("A", "select ?", false);
        class.add_event(&event("select 1", 1.0), false);
        class.finalize(1, UtcOffset::UTC);
        assert!(class.example.is_none());
    }

    #[test]
    fn long_examples_are_truncated() {
        let query = format!("select '{}'", "x".repeat(100));
        let mut class = Class::new("A", "select ?", true).with_max_example_bytes(20);
        class.add_event(&event(&query, 1.0), false);
        class.finalize(1, UtcOffset::UTC);

        let example = class.example.expect("example");
        assert!(example.truncated);
        assert_eq!(example.size, query.len());
        assert_eq!(example.query.len(), 20);
        assert!(example.query.ends_with("..."));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let (cut, truncated) = truncate("select 'ééééé'", 12);
        assert!(truncated);
        assert!(cut.len() <= 12);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate("select 1", 12), ("select 1".to_string(), false));
    }

    #[test]
    fn error_histogram() {
        let mut class = Class::new("A", "select ?", false);
        for errno in [0, 1064, 1213, 1064] {
            let mut e = event("select 1", 1.0);
            e.number_metrics.insert("Last_errno".to_string(), errno);
            class.add_event(&e, false);
        }
        class.finalize(1, UtcOffset::UTC);
        assert_eq!(class.errors_code, vec![1064, 1213]);
        assert_eq!(class.errors_count, vec![2, 1]);
    }
}
