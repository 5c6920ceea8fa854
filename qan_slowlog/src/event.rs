//! The parsed form of one slow log record.

use rustc_hash::FxHashMap;
use serde::Serialize;
use time::OffsetDateTime;

/// The metric every emitted event is guaranteed to carry.
pub const QUERY_TIME: &str = "Query_time";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
/// One query or admin command record.
pub struct Event {
    /// Byte offset in the source file at which the record starts.
    pub offset: u64,
    /// Byte offset just past the record's last line.
    pub offset_end: u64,
    /// Time the record was logged, if the record carried a parseable `Time`.
    #[serde(with = "time::serde::rfc3339::option")]
    pub ts: Option<OffsetDateTime>,
    /// Whether this is an admin command rather than a query.
    pub admin: bool,
    /// Query text, or the admin command.
    pub query: String,
    /// Connecting user.
    pub user: String,
    /// Connecting host.
    pub host: String,
    /// Default database.
    pub db: String,
    /// Server the log belongs to.
    pub server: String,
    /// Float metrics in seconds, keys ending in `_time` or `_wait`.
    pub time_metrics: FxHashMap<String, f64>,
    /// Integer metrics such as `Rows_sent`.
    pub number_metrics: FxHashMap<String, u64>,
    /// Boolean metrics such as `QC_Hit`.
    pub bool_metrics: FxHashMap<String, bool>,
    /// `Log_slow_rate_type`, if the dialect samples.
    pub rate_type: String,
    /// `Log_slow_rate_limit`, 0 when the log is not sampled.
    pub rate_limit: u64,
}

impl Event {
    /// An empty event stamped with `server`.
    #[must_use]
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            ..Self::default()
        }
    }

    /// The event's `Query_time` in seconds, if present.
    #[must_use]
    pub fn query_time(&self) -> Option<f64> {
        self.time_metrics.get(QUERY_TIME).copied()
    }
}
