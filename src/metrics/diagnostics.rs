use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct DiagnosticsMetrics;

impl DiagnosticsMetrics {
    pub fn record_reports(count: usize) {
        ::metrics::counter!(phase_metric!(counter, "diagnostics", "reports"))
            .increment(count as u64);
    }

    pub fn record_failure() {
        ::metrics::counter!(phase_metric!(counter, "diagnostics", "failures")).increment(1);
    }
}

impl PhaseMetrics for DiagnosticsMetrics {
    fn register_metrics() {
        use metrics::describe_counter;

        describe_counter!(
            phase_metric!(counter, "diagnostics", "reports"),
            "Client error reports stored"
        );
        describe_counter!(
            phase_metric!(counter, "diagnostics", "failures"),
            "ReportError calls dropped because of an error"
        );
    }

    fn phase_name() -> &'static str {
        "diagnostics"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "diagnostics", "reports"),
                metric_type: MetricType::Counter,
                help: "Client error reports stored",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "diagnostics", "failures"),
                metric_type: MetricType::Counter,
                help: "ReportError calls dropped because of an error",
                labels: vec![],
            },
        ]
    }
}
