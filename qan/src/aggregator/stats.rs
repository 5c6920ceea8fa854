//! Per-metric accumulators.
//!
//! Every accumulator keeps each raw value until [`Metrics::finalize`], which
//! sorts them once and reads the summary off by index. Values from outlier
//! events are summed separately: they are never scaled by the rate limit.

use qan_slowlog::Event;
use rustc_hash::FxHashMap;
use serde::Serialize;

/// Index of the `pct` percentile in a sorted slice of `len` values, truncating.
fn percentile_index(len: usize, pct: usize) -> usize {
    (pct * len) / 100
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
/// Statistics of a float metric, seconds.
pub struct TimeStats {
    #[serde(skip)]
    vals: Vec<f64>,
    #[serde(skip)]
    raw_sum: f64,
    #[serde(skip)]
    outlier_sum: f64,

    /// Rate limit scaled total
    pub sum: f64,
    /// Smallest value
    pub min: f64,
    /// `sum` over total queries
    pub avg: f64,
    /// 50th percentile
    pub med: f64,
    /// 95th percentile
    pub p95: f64,
    /// Largest value
    pub max: f64,
}

impl TimeStats {
    fn add(&mut self, value: f64, outlier: bool) {
        self.vals.push(value);
        if outlier {
            self.outlier_sum += value;
        } else {
            self.raw_sum += value;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn finalize(&mut self, rate_limit: u64, total_queries: u64) {
        let mut vals = std::mem::take(&mut self.vals);
        if vals.is_empty() {
            return;
        }
        vals.sort_by(f64::total_cmp);
        let cnt = vals.len();

        self.min = vals[0];
        self.med = vals[percentile_index(cnt, 50)];
        self.p95 = vals[percentile_index(cnt, 95)];
        self.max = vals[cnt - 1];
        self.sum = self.raw_sum * rate_limit as f64 + self.outlier_sum;
        if total_queries > 0 {
            self.avg = self.sum / total_queries as f64;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
/// Statistics of an integer metric.
pub struct NumberStats {
    #[serde(skip)]
    vals: Vec<u64>,
    #[serde(skip)]
    raw_sum: u64,
    #[serde(skip)]
    outlier_sum: u64,

    /// Rate limit scaled total
    pub sum: u64,
    /// Smallest value
    pub min: u64,
    /// `sum` over total queries, truncated
    pub avg: u64,
    /// 50th percentile
    pub med: u64,
    /// 95th percentile
    pub p95: u64,
    /// Largest value
    pub max: u64,
}

impl NumberStats {
    fn add(&mut self, value: u64, outlier: bool) {
        self.vals.push(value);
        if outlier {
            self.outlier_sum = self.outlier_sum.saturating_add(value);
        } else {
            self.raw_sum = self.raw_sum.saturating_add(value);
        }
    }

    fn finalize(&mut self, rate_limit: u64, total_queries: u64) {
        let mut vals = std::mem::take(&mut self.vals);
        if vals.is_empty() {
            return;
        }
        vals.sort_unstable();
        let cnt = vals.len();

        self.min = vals[0];
        self.med = vals[percentile_index(cnt, 50)];
        self.p95 = vals[percentile_index(cnt, 95)];
        self.max = vals[cnt - 1];
        self.sum = self
            .raw_sum
            .saturating_mul(rate_limit)
            .saturating_add(self.outlier_sum);
        self.avg = self.sum.checked_div(total_queries).unwrap_or(0);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
/// Statistics of a boolean metric: how often it was true.
pub struct BoolStats {
    #[serde(skip)]
    raw_sum: u64,
    #[serde(skip)]
    outlier_sum: u64,

    /// Rate limit scaled count of `true` values
    pub sum: u64,
}

impl BoolStats {
    fn add(&mut self, value: bool, outlier: bool) {
        if !value {
            return;
        }
        if outlier {
            self.outlier_sum += 1;
        } else {
            self.raw_sum += 1;
        }
    }

    fn finalize(&mut self, rate_limit: u64) {
        self.sum = self
            .raw_sum
            .saturating_mul(rate_limit)
            .saturating_add(self.outlier_sum);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
/// All metric accumulators of one class, keyed by metric name.
pub struct Metrics {
    /// Float metrics
    pub time_metrics: FxHashMap<String, TimeStats>,
    /// Integer metrics
    pub number_metrics: FxHashMap<String, NumberStats>,
    /// Boolean metrics
    pub bool_metrics: FxHashMap<String, BoolStats>,
}

impl Metrics {
    /// Fold every metric of `event` into the accumulators.
    pub fn add_event(&mut self, event: &Event, outlier: bool) {
        for (name, value) in &event.time_metrics {
            self.time_metrics
                .entry(name.clone())
                .or_default()
                .add(*value, outlier);
        }
        for (name, value) in &event.number_metrics {
            self.number_metrics
                .entry(name.clone())
                .or_default()
                .add(*value, outlier);
        }
        for (name, value) in &event.bool_metrics {
            self.bool_metrics
                .entry(name.clone())
                .or_default()
                .add(*value, outlier);
        }
    }

    /// Collapse raw values into summary statistics. `rate_limit` must already
    /// be at least 1, `total_queries` already scaled by it.
    pub fn finalize(&mut self, rate_limit: u64, total_queries: u64) {
        for stats in self.time_metrics.values_mut() {
            stats.finalize(rate_limit, total_queries);
        }
        for stats in self.number_metrics.values_mut() {
            stats.finalize(rate_limit, total_queries);
        }
        for stats in self.bool_metrics.values_mut() {
            stats.finalize(rate_limit);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use qan_slowlog::Event;

    use super::{Metrics, NumberStats, TimeStats};

    fn event(query_time: f64, rows: u64, full_scan: bool) -> Event {
        let mut event = Event::default();
        event.time_metrics.insert("Query_time".to_string(), query_time);
        event.number_metrics.insert("Rows_sent".to_string(), rows);
        event.bool_metrics.insert("Full_scan".to_string(), full_scan);
        event
    }

    #[test]
    fn truncating_percentiles() {
        let mut stats = TimeStats::default();
        for v in [3.0, 1.0, 5.0, 2.0, 4.0] {
            stats.add(v, false);
        }
        stats.finalize(1, 5);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.med, 3.0);
        assert_eq!(stats.p95, 5.0);
        assert_eq!(stats.max, 5.0);
        assert_eq!(stats.sum, 15.0);
        assert_eq!(stats.avg, 3.0);
    }

    #[test]
    fn outliers_escape_rate_limit() {
        let mut metrics = Metrics::default();
        for _ in 0..3 {
            metrics.add_event(&event(1.0, 2, true), false);
        }
        metrics.add_event(&event(9.0, 100, true), true);
        metrics.finalize(10, 31);

        let qt = &metrics.time_metrics["Query_time"];
        assert_eq!(qt.sum, 3.0 * 10.0 + 9.0);
        assert_eq!(qt.max, 9.0);
        let rows = &metrics.number_metrics["Rows_sent"];
        assert_eq!(rows.sum, 3 * 2 * 10 + 100);
        assert_eq!(rows.avg, 160 / 31);
        assert_eq!(metrics.bool_metrics["Full_scan"].sum, 31);
    }

    #[test]
    fn false_is_not_counted() {
        let mut metrics = Metrics::default();
        metrics.add_event(&event(1.0, 0, false), false);
        metrics.add_event(&event(1.0, 0, true), false);
        metrics.finalize(1, 2);
        assert_eq!(metrics.bool_metrics["Full_scan"].sum, 1);
    }

    proptest! {
        #[test]
        fn summary_is_ordered(vals in prop::collection::vec(any::<u64>(), 1..200)) {
            let mut stats = NumberStats::default();
            for v in &vals {
                stats.add(*v, false);
            }
            stats.finalize(1, vals.len() as u64);

            let min = *vals.iter().min().expect("non-empty");
            let max = *vals.iter().max().expect("non-empty");
            prop_assert_eq!(stats.min, min);
            prop_assert_eq!(stats.max, max);
            prop_assert!(stats.min <= stats.med);
            prop_assert!(stats.med <= stats.p95);
            prop_assert!(stats.p95 <= stats.max);
        }

        #[test]
        fn time_percentiles_come_from_samples(vals in prop::collection::vec(0.0f64..1e6, 1..200)) {
            let mut stats = TimeStats::default();
            for v in &vals {
                stats.add(*v, false);
            }
            stats.finalize(1, vals.len() as u64);
            prop_assert!(vals.contains(&stats.med));
            prop_assert!(vals.contains(&stats.p95));
            prop_assert!(stats.min <= stats.med && stats.med <= stats.p95 && stats.p95 <= stats.max);
        }
    }
}
