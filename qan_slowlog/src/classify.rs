//! Classification of `Key: Value` pairs found in slow log header lines.
//!
//! Header lines such as
//!
//! ```text
//! # Query_time: 0.000286  Lock_time: 0.000119 Rows_sent: 0  Rows_examined: 0
//! # QC_Hit: No  Full_scan: Yes  Tmp_table: No
//! ```
//!
//! carry metrics whose type is only implied by the key's suffix and the
//! value's shape. [`classify`] maps each pair to exactly one [`Field`]; the
//! rules are tried in order:
//!
//! 1. keys ending `_time` or `_wait` are finite float seconds,
//! 2. values exactly `Yes` or `No` are booleans,
//! 3. `Schema` names the database,
//! 4. `Log_slow_rate_type` and `Log_slow_rate_limit` are sampling metadata,
//! 5. anything else is an unsigned integer.

/// What a header `Key: Value` pair means.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Field<'a> {
    /// A time metric, seconds.
    Time(f64),
    /// A boolean metric.
    Bool(bool),
    /// The record's default database.
    Schema(&'a str),
    /// The sampling type, `query` or `session`.
    RateType(&'a str),
    /// The sampling factor, one logged record per `n` executed.
    RateLimit(u64),
    /// An integer metric.
    Number(u64),
}

/// Classify a header pair. Returns `None` when the value does not parse as
/// the type its key calls for, in which case the pair is skipped.
#[must_use]
pub fn classify<'a>(key: &str, value: &'a str) -> Option<Field<'a>> {
    if key.ends_with("_time") || key.ends_with("_wait") {
        return value
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite())
            .map(Field::Time);
    }
    match (key, value) {
        (_, "Yes") => Some(Field::Bool(true)),
        (_, "No") => Some(Field::Bool(false)),
        ("Schema", db) => Some(Field::Schema(db)),
        ("Log_slow_rate_type", kind) => Some(Field::RateType(kind)),
        ("Log_slow_rate_limit", limit) => limit.parse().ok().map(Field::RateLimit),
        (_, number) => number.parse().ok().map(Field::Number),
    }
}
