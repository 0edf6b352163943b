use crate::clock::SharedClock;
use crate::constants::DIAGNOSTICS_LOG;
use crate::metrics::DiagnosticsMetrics;
use crate::storage::{self, Store, TxFinish};
use crate::types::{CallerContext, ErrorReport};
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// Best-effort sink for client error bundles.
pub struct DiagnosticsService {
    store: Arc<Store>,
    clock: SharedClock,
}

impl DiagnosticsService {
    pub fn new(store: Arc<Store>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// `ReportError`: store every entry stamped with the caller address. Failures
    /// are logged and counted, never returned.
    #[instrument(skip_all, fields(caller = %caller.address, entries = bundle.len()))]
    pub fn report_error(&self, caller: &CallerContext, bundle: Vec<ErrorReport>) {
        if bundle.is_empty() {
            return;
        }

        let received_at = self.clock.now();
        let stored = self.store.in_transaction(|tx| {
            for report in &bundle {
                storage::insert_error_report(tx, report, &caller.address, received_at)?;
            }
            Ok((bundle.len(), TxFinish::Commit))
        });

        match stored {
            Ok(count) => {
                DiagnosticsMetrics::record_reports(count);
                debug!(rpc = DIAGNOSTICS_LOG, count, "Stored error reports");
            }
            Err(e) => {
                DiagnosticsMetrics::record_failure();
                error!(rpc = DIAGNOSTICS_LOG, caller = caller.address.as_str(), error = %e, "Failed to store error reports");
            }
        }
    }
}
