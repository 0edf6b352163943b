//! Discovery Metrics
//!
//! All discovery calls and failures, plus the registration subset.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct DiscoveryMetrics;

impl DiscoveryMetrics {
    pub fn record_call() {
        ::metrics::counter!(phase_metric!(counter, "discovery", "calls")).increment(1);
    }

    pub fn record_failure() {
        ::metrics::counter!(phase_metric!(counter, "discovery", "failures")).increment(1);
    }

    pub fn record_registration() {
        ::metrics::counter!(phase_metric!(counter, "discovery", "registrations")).increment(1);
    }

    pub fn record_registration_failure() {
        ::metrics::counter!(phase_metric!(counter, "discovery", "registration_failures"))
            .increment(1);
    }
}

impl PhaseMetrics for DiscoveryMetrics {
    fn register_metrics() {
        use metrics::describe_counter;

        describe_counter!(
            phase_metric!(counter, "discovery", "calls"),
            "Total number of successful discovery calls"
        );
        describe_counter!(
            phase_metric!(counter, "discovery", "failures"),
            "Discovery calls that failed or were rejected as suspect"
        );
        describe_counter!(
            phase_metric!(counter, "discovery", "registrations"),
            "Peer registrations served"
        );
        describe_counter!(
            phase_metric!(counter, "discovery", "registration_failures"),
            "Peer registrations that hit a store error"
        );
    }

    fn phase_name() -> &'static str {
        "discovery"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "discovery", "calls"),
                metric_type: MetricType::Counter,
                help: "Total number of successful discovery calls",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "discovery", "failures"),
                metric_type: MetricType::Counter,
                help: "Discovery calls that failed or were rejected as suspect",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "discovery", "registrations"),
                metric_type: MetricType::Counter,
                help: "Peer registrations served",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "discovery", "registration_failures"),
                metric_type: MetricType::Counter,
                help: "Peer registrations that hit a store error",
                labels: vec![],
            },
        ]
    }
}
