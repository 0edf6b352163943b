//! Registration of every category's metrics, plus the per-category totals
//! logged when the server stops.

use crate::metrics::{phase_metric, MetricDoc, PhaseMetrics};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// (category, call counter, failure counter). Diagnostics counts stored reports
/// rather than calls.
const CATEGORY_COUNTERS: &[(&str, &str, &str)] = &[
    (
        "reporting",
        phase_metric!(counter, "reporting", "calls"),
        phase_metric!(counter, "reporting", "failures"),
    ),
    (
        "discovery",
        phase_metric!(counter, "discovery", "calls"),
        phase_metric!(counter, "discovery", "failures"),
    ),
    (
        "diagnostics",
        phase_metric!(counter, "diagnostics", "reports"),
        phase_metric!(counter, "diagnostics", "failures"),
    ),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryTotals {
    pub calls: u64,
    pub failures: u64,
}

/// Describe every category's metrics to the recorder, warning on name clashes.
pub fn register_all_metrics() {
    let mut owners: BTreeMap<&'static str, &'static str> = BTreeMap::new();

    register_phase_metrics::<super::reporting::ReportingMetrics>(&mut owners);
    register_phase_metrics::<super::discovery::DiscoveryMetrics>(&mut owners);
    register_phase_metrics::<super::diagnostics::DiagnosticsMetrics>(&mut owners);

    info!(metrics = owners.len(), "Registered telemetry metrics");
}

fn register_phase_metrics<T: PhaseMetrics>(owners: &mut BTreeMap<&'static str, &'static str>) {
    T::register_metrics();
    let category = T::phase_name();

    for MetricDoc { name, .. } in T::metrics_documentation() {
        if let Some(owner) = owners.insert(name, category) {
            warn!(metric = name, owner, category, "Metric name registered twice");
        }
    }
}

/// Pull the call and failure totals of each category out of a Prometheus text
/// exposition. Categories with no samples yet are reported as zero.
pub fn category_totals(exposition: &str) -> BTreeMap<&'static str, CategoryTotals> {
    let samples: BTreeMap<&str, u64> = exposition
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let (name, value) = line.split_once(' ')?;
            let value: f64 = value.trim().parse().ok()?;
            Some((name, value as u64))
        })
        .collect();

    CATEGORY_COUNTERS
        .iter()
        .map(|&(category, calls, failures)| {
            let totals = CategoryTotals {
                calls: samples.get(calls).copied().unwrap_or(0),
                failures: samples.get(failures).copied().unwrap_or(0),
            };
            (category, totals)
        })
        .collect()
}

/// Log the totals of every category, if a recorder is installed.
pub fn log_category_totals() {
    let Some(exposition) = super::render() else {
        return;
    };
    for (category, totals) in category_totals(&exposition) {
        info!(
            category,
            calls = totals.calls,
            failures = totals.failures,
            "Telemetry totals"
        );
    }
}
