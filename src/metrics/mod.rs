//! Increment-only metrics for the telemetry RPC surface.
//!
//! Each RPC category defines its counters in a dedicated submodule, so totals and
//! failures per category have one owner and one naming scheme.

pub mod diagnostics;
pub mod discovery;
pub mod registry;
pub mod reporting;

pub use diagnostics::DiagnosticsMetrics;
pub use discovery::DiscoveryMetrics;
pub use reporting::ReportingMetrics;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Once, OnceLock};
use tracing::{info, warn};

static INIT: Once = Once::new();
static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and register every category's metrics.
///
/// Idempotent. Without a recorder the counter macros are no-ops, so tests and
/// admin commands can skip this entirely.
pub fn init_metrics() {
    INIT.call_once(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if HANDLE.set(handle).is_err() {
                warn!("Prometheus handle was already set");
            }
            registry::register_all_metrics();
            info!("Prometheus recorder installed");
        }
        Err(e) => {
            warn!("Failed to install Prometheus recorder: {}", e);
        }
    });
}

/// Prometheus text exposition of the current metric values, if a recorder is installed.
pub fn render() -> Option<String> {
    HANDLE.get().map(PrometheusHandle::render)
}

/// Per-category metric collections.
pub trait PhaseMetrics {
    /// Describe every metric of this category to the recorder.
    fn register_metrics();

    fn phase_name() -> &'static str;

    fn metrics_documentation() -> Vec<MetricDoc>;
}

#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
    pub labels: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
}

/// Metric names follow `peer_{phase}_{name}[_total]`.
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("peer_", $phase, "_", $name, "_total")
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("peer_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;
