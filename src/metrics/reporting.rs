//! Reporting Metrics
//!
//! Counters for `ReportPopulation`: every call, every call whose real outcome
//! was a failure, and a per-outcome breakdown.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct ReportingMetrics;

impl ReportingMetrics {
    pub fn record_call() {
        ::metrics::counter!(phase_metric!(counter, "reporting", "calls")).increment(1);
    }

    pub fn record_failure() {
        ::metrics::counter!(phase_metric!(counter, "reporting", "failures")).increment(1);
    }

    pub fn record_outcome(outcome: &'static str) {
        ::metrics::counter!(phase_metric!(counter, "reporting", "outcomes"), "outcome" => outcome)
            .increment(1);
    }

    pub fn record_rows_committed(rows: usize) {
        ::metrics::counter!(phase_metric!(counter, "reporting", "rows_committed"))
            .increment(rows as u64);
    }

    pub fn set_throttle_entries(entries: usize) {
        ::metrics::gauge!(phase_metric!(gauge, "reporting", "throttle_entries"))
            .set(entries as f64);
    }
}

impl PhaseMetrics for ReportingMetrics {
    fn register_metrics() {
        use metrics::{describe_counter, describe_gauge};

        describe_counter!(
            phase_metric!(counter, "reporting", "calls"),
            "Total number of ReportPopulation calls"
        );
        describe_counter!(
            phase_metric!(counter, "reporting", "failures"),
            "ReportPopulation calls whose real outcome was a failure"
        );
        describe_counter!(
            phase_metric!(counter, "reporting", "outcomes"),
            "ReportPopulation calls by internal outcome"
        );
        describe_counter!(
            phase_metric!(counter, "reporting", "rows_committed"),
            "History rows committed"
        );
        describe_gauge!(
            phase_metric!(gauge, "reporting", "throttle_entries"),
            "Live entries in the per-address throttle table"
        );
    }

    fn phase_name() -> &'static str {
        "reporting"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "reporting", "calls"),
                metric_type: MetricType::Counter,
                help: "Total number of ReportPopulation calls",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "reporting", "failures"),
                metric_type: MetricType::Counter,
                help: "ReportPopulation calls whose real outcome was a failure",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "reporting", "outcomes"),
                metric_type: MetricType::Counter,
                help: "ReportPopulation calls by internal outcome",
                labels: vec!["outcome"],
            },
            MetricDoc {
                name: phase_metric!(counter, "reporting", "rows_committed"),
                metric_type: MetricType::Counter,
                help: "History rows committed",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(gauge, "reporting", "throttle_entries"),
                metric_type: MetricType::Gauge,
                help: "Live entries in the per-address throttle table",
                labels: vec![],
            },
        ]
    }
}
