//! Grouping of events into classes and the statistics computed over them.
//!
//! An [`Aggregator`] covers one reporting window. Events are fed in log order
//! with [`Aggregator::add_event`]; [`Aggregator::finalize`] consumes the
//! aggregator and produces the window's [`Result`].
//!
//! ## Metrics
//!
//! `qan_events_aggregated`: Events folded into an aggregator
//!

use metrics::counter;
use qan_slowlog::Event;
use rustc_hash::FxHashMap;
use serde::Serialize;
use time::UtcOffset;
use tracing::warn;

mod class;
mod stats;

pub use class::{Class, DEFAULT_MAX_EXAMPLE_BYTES, Example};
pub use stats::{BoolStats, Metrics, NumberStats, TimeStats};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
/// The outcome of one aggregation window.
pub struct Result {
    /// Statistics over every event of the window
    pub global: Class,
    /// Per-class statistics, keyed by class ID
    pub class: FxHashMap<String, Class>,
    /// Rate limit the window was scaled by, 0 if the log is not sampled
    pub rate_limit: u64,
    /// Describes anything that went wrong while the window was gathered,
    /// empty otherwise. Classes are valid either way.
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// How an [`Aggregator`] treats its events.
pub struct Settings {
    /// Keep the slowest event of every class as its example.
    pub samples: bool,
    /// Shift applied to example timestamps.
    pub utc_offset: UtcOffset,
    /// Events with a `Query_time` above this many seconds are outliers. 0
    /// disables outlier detection.
    pub outlier_time: f64,
    /// Cap on example query text, bytes.
    pub max_example_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            samples: true,
            utc_offset: UtcOffset::UTC,
            outlier_time: 0.0,
            max_example_bytes: DEFAULT_MAX_EXAMPLE_BYTES,
        }
    }
}

impl Settings {
    /// A fresh aggregator with these settings.
    #[must_use]
    pub fn aggregator(&self) -> Aggregator {
        Aggregator::new(self.samples, self.utc_offset, self.outlier_time)
            .with_max_example_bytes(self.max_example_bytes)
    }
}

#[derive(Debug)]
/// Groups events by class for one window.
pub struct Aggregator {
    samples: bool,
    utc_offset: UtcOffset,
    outlier_time: f64,
    max_example_bytes: usize,

    global: Class,
    classes: FxHashMap<String, Class>,
    rate_limit: u64,
    error: String,
}

impl Aggregator {
    /// Create a new [`Aggregator`].
    #[must_use]
    pub fn new(samples: bool, utc_offset: UtcOffset, outlier_time: f64) -> Self {
        Self {
            samples,
            utc_offset,
            outlier_time,
            max_example_bytes: DEFAULT_MAX_EXAMPLE_BYTES,
            global: Class::new("", "", false),
            classes: FxHashMap::default(),
            rate_limit: 0,
            error: String::new(),
        }
    }

    /// Cap example query text at `max` bytes.
    #[must_use]
    pub fn with_max_example_bytes(mut self, max: usize) -> Self {
        self.max_example_bytes = max;
        self
    }

    /// Whether no event has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.global.total_queries == 0 && self.global.outliers() == 0
    }

    /// Add `event` to the global class and to the class keyed by `id` and the
    /// event's user, host, db and server.
    pub fn add_event(&mut self, event: &Event, id: &str, fingerprint: &str) {
        let outlier = self.outlier_time > 0.0
            && event
                .query_time()
                .is_some_and(|query_time| query_time > self.outlier_time);

        if event.rate_limit > 0 {
            if self.rate_limit == 0 {
                self.rate_limit = event.rate_limit;
            } else if self.rate_limit != event.rate_limit {
                warn!(
                    "rate limit changed from {from} to {to} at offset {offset}",
                    from = self.rate_limit,
                    to = event.rate_limit,
                    offset = event.offset
                );
                self.error = format!(
                    "rate limit changed from {} to {}",
                    self.rate_limit, event.rate_limit
                );
            }
        }

        self.global.add_event(event, outlier);

        let key = format!(
            "{id}|{user}|{host}|{db}|{server}",
            user = event.user,
            host = event.host,
            db = event.db,
            server = event.server
        );
        let (samples, max_example_bytes) = (self.samples, self.max_example_bytes);
        self.classes
            .entry(key)
            .or_insert_with(|| {
                let mut class = Class::new(id, fingerprint, samples)
                    .with_max_example_bytes(max_example_bytes);
                class.user.clone_from(&event.user);
                class.host.clone_from(&event.host);
                class.db.clone_from(&event.db);
                class.server.clone_from(&event.server);
                class
            })
            .add_event(event, outlier);

        counter!("qan_events_aggregated").increment(1);
    }

    /// Finalize every class and produce the window's [`Result`].
    #[must_use]
    pub fn finalize(self) -> Result {
        let Self {
            utc_offset,
            mut global,
            mut classes,
            rate_limit,
            error,
            ..
        } = self;

        for class in classes.values_mut() {
            class.finalize(rate_limit, utc_offset);
        }
        global.unique_queries = classes.len() as u64;
        global.finalize(rate_limit, utc_offset);

        Result {
            global,
            class: classes,
            rate_limit,
            error,
        }
    }
}
