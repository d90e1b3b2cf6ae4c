use crate::error::HarnessError;
use crate::settings::{Complexity, Scenario};
use crate::workload::ActionKind;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

pub mod reporter;
pub use reporter::ResultsReporter;

/// Benign errors counted per error kind, then per action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ErrorHistogram {
    counts: BTreeMap<String, BTreeMap<ActionKind, u64>>,
}

impl ErrorHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, error_kind: &str, action: ActionKind) {
        *self
            .counts
            .entry(error_kind.to_string())
            .or_default()
            .entry(action)
            .or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &ErrorHistogram) {
        for (kind, per_action) in &other.counts {
            let target = self.counts.entry(kind.clone()).or_default();
            for (action, count) in per_action {
                *target.entry(*action).or_insert(0) += count;
            }
        }
    }

    pub fn get(&self, error_kind: &str, action: ActionKind) -> u64 {
        self.counts
            .get(error_kind)
            .and_then(|per_action| per_action.get(&action))
            .copied()
            .unwrap_or(0)
    }

    /// Sum over every error kind and action.
    pub fn total(&self) -> u64 {
        self.counts
            .values()
            .flat_map(|per_action| per_action.values())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeMap<ActionKind, u64>)> {
        self.counts.iter().map(|(kind, per_action)| (kind.as_str(), per_action))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyMetrics {
    pub samples: u64,
    pub min_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
    pub max_us: u64,
}

/// Latency of successful actions, in microseconds.
#[derive(Debug, Clone)]
pub struct LatencyCollector {
    histogram: Histogram<u64>,
}

impl LatencyCollector {
    pub fn new() -> Result<Self, HarnessError> {
        let histogram = Histogram::new(3).map_err(|e| HarnessError::Metrics(e.to_string()))?;
        Ok(Self { histogram })
    }

    pub fn record(&mut self, latency: Duration) {
        let _ = self.histogram.record(latency.as_micros() as u64);
    }

    pub fn merge(&mut self, other: &LatencyCollector) -> Result<(), HarnessError> {
        self.histogram
            .add(&other.histogram)
            .map_err(|e| HarnessError::Metrics(e.to_string()))
    }

    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    pub fn summary(&self) -> LatencyMetrics {
        if self.histogram.is_empty() {
            return LatencyMetrics::default();
        }
        LatencyMetrics {
            samples: self.histogram.len(),
            min_us: self.histogram.min(),
            mean_us: self.histogram.mean(),
            p50_us: self.histogram.value_at_quantile(0.50),
            p95_us: self.histogram.value_at_quantile(0.95),
            p99_us: self.histogram.value_at_quantile(0.99),
            p999_us: self.histogram.value_at_quantile(0.999),
            max_us: self.histogram.max(),
        }
    }
}

/// How the run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Interrupted,
    Failed { thread: String, error: String },
}

/// Final summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub seed: u64,
    pub complexity: Complexity,
    pub scenario: Scenario,
    pub workers: usize,
    pub duration_secs: f64,
    pub queries_executed: u64,
    pub failures: u64,
    pub failure_percentage: f64,
    pub errors: ErrorHistogram,
    pub latency: LatencyMetrics,
    pub outcome: RunOutcome,
}

/// Benign errors as a share of executed queries; zero when nothing ran.
pub fn failure_percentage(failures: u64, executed: u64) -> f64 {
    if executed == 0 {
        0.0
    } else {
        100.0 * failures as f64 / executed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KINDS: [ActionKind; 4] = [
        ActionKind::Select,
        ActionKind::Insert,
        ActionKind::CreateTable,
        ActionKind::Cancel,
    ];
    const ERRORS: [&str; 3] = ["does not exist", "already exists", "Connection refused"];

    #[test]
    fn record_and_lookup() {
        let mut hist = ErrorHistogram::new();
        hist.record("does not exist", ActionKind::Select);
        hist.record("does not exist", ActionKind::Select);
        hist.record("already exists", ActionKind::CreateTable);
        assert_eq!(hist.get("does not exist", ActionKind::Select), 2);
        assert_eq!(hist.get("does not exist", ActionKind::Insert), 0);
        assert_eq!(hist.total(), 3);
    }

    #[test]
    fn failure_percentage_handles_zero_queries() {
        assert_eq!(failure_percentage(5, 0), 0.0);
        assert_eq!(failure_percentage(1, 4), 25.0);
    }

    #[test]
    fn latency_merge_accumulates_samples() {
        let mut a = LatencyCollector::new().unwrap();
        let mut b = LatencyCollector::new().unwrap();
        a.record(Duration::from_micros(100));
        b.record(Duration::from_micros(300));
        b.record(Duration::from_micros(500));
        a.merge(&b).unwrap();
        let summary = a.summary();
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.min_us, 100);
        assert!(summary.max_us >= 500);
    }

    #[test]
    fn empty_latency_summary_is_zeroed() {
        let summary = LatencyCollector::new().unwrap().summary();
        assert_eq!(summary, LatencyMetrics::default());
    }

    #[test]
    fn report_serializes_error_breakdown() {
        let mut errors = ErrorHistogram::new();
        errors.record("does not exist", ActionKind::Select);
        let json = serde_json::to_value(&errors).unwrap();
        assert_eq!(json["does not exist"]["select"], 1);
    }

    proptest! {
        #[test]
        fn merged_total_equals_sum_of_parts(
            workers in prop::collection::vec(
                prop::collection::vec((0usize..ERRORS.len(), 0usize..KINDS.len()), 0..40),
                1..8,
            )
        ) {
            let mut merged = ErrorHistogram::new();
            let mut expected = 0u64;
            for records in &workers {
                let mut local = ErrorHistogram::new();
                for &(e, k) in records {
                    local.record(ERRORS[e], KINDS[k]);
                }
                expected += local.total();
                merged.merge(&local);
            }
            prop_assert_eq!(merged.total(), expected);
            prop_assert_eq!(
                expected,
                workers.iter().map(|w| w.len() as u64).sum::<u64>()
            );
        }
    }
}
