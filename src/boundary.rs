//! The one place where internal report outcomes become wire return codes.
//!
//! Almost every failure is reported to the peer as `Success` so a degraded or
//! abused server does not trigger synchronized retries across the fleet. The real
//! outcome is logged and counted here before it is flattened.

use crate::constants::REPORT_LOG;
use crate::metrics::ReportingMetrics;
use crate::types::{CallerContext, ReturnCode};
use std::fmt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Why a batch was refused before or during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NilGuid,
    TooManyRows { rows: usize, max: usize },
    TotalPopulationExceeded { total: i64, max: i64 },
    RowPopulationOutOfRange { species: String, population: i32 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NilGuid => write!(f, "missing guid"),
            RejectReason::TooManyRows { rows, max } => {
                write!(f, "{rows} rows exceeds the {max} row limit")
            }
            RejectReason::TotalPopulationExceeded { total, max } => {
                write!(f, "current-tick population {total} exceeds {max}")
            }
            RejectReason::RowPopulationOutOfRange {
                species,
                population,
            } => write!(f, "population {population} for {species:?} out of range"),
        }
    }
}

/// What actually happened to a `ReportPopulation` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Committed { rows: usize },
    /// Committed, but a species turned out to be blacklisted at insert time.
    CommittedBlacklisted { rows: usize },
    ShortThrottled,
    LongThrottled,
    GuidSwitched { previous: Uuid },
    Blacklisted { species: String },
    NodeTimedOut,
    NodeCorrupted,
    Rejected(RejectReason),
    StoreFault(String),
}

impl ReportOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReportOutcome::Committed { .. } => "committed",
            ReportOutcome::CommittedBlacklisted { .. } => "committed_blacklisted",
            ReportOutcome::ShortThrottled => "short_throttled",
            ReportOutcome::LongThrottled => "long_throttled",
            ReportOutcome::GuidSwitched { .. } => "guid_switched",
            ReportOutcome::Blacklisted { .. } => "blacklisted",
            ReportOutcome::NodeTimedOut => "node_timed_out",
            ReportOutcome::NodeCorrupted => "node_corrupted",
            ReportOutcome::Rejected(_) => "rejected",
            ReportOutcome::StoreFault(_) => "store_fault",
        }
    }

    /// Failures are the outcomes counted against the failed-operations counter.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ReportOutcome::Rejected(_) | ReportOutcome::StoreFault(_)
        )
    }

    pub fn return_code(&self) -> ReturnCode {
        match self {
            ReportOutcome::NodeTimedOut => ReturnCode::NodeTimedOut,
            ReportOutcome::NodeCorrupted => ReturnCode::NodeCorrupted,
            ReportOutcome::Blacklisted { .. } | ReportOutcome::CommittedBlacklisted { .. } => {
                ReturnCode::OrganismBlacklisted
            }
            ReportOutcome::Committed { .. }
            | ReportOutcome::ShortThrottled
            | ReportOutcome::LongThrottled
            | ReportOutcome::GuidSwitched { .. }
            | ReportOutcome::Rejected(_)
            | ReportOutcome::StoreFault(_) => ReturnCode::Success,
        }
    }
}

/// Log and count `outcome`, then map it to the code the peer sees.
pub fn finish_report(caller: &CallerContext, guid: Uuid, outcome: &ReportOutcome) -> ReturnCode {
    ReportingMetrics::record_call();
    ReportingMetrics::record_outcome(outcome.label());
    if outcome.is_failure() {
        ReportingMetrics::record_failure();
    }

    let address = caller.address.as_str();
    match outcome {
        ReportOutcome::Committed { rows } => {
            ReportingMetrics::record_rows_committed(*rows);
            debug!(rpc = REPORT_LOG, caller = address, %guid, rows, "Report committed");
        }
        ReportOutcome::CommittedBlacklisted { rows } => {
            ReportingMetrics::record_rows_committed(*rows);
            info!(rpc = REPORT_LOG, caller = address, %guid, rows, "Report committed with blacklisted species");
        }
        ReportOutcome::ShortThrottled | ReportOutcome::LongThrottled => {
            debug!(rpc = REPORT_LOG, caller = address, %guid, outcome = outcome.label(), "Report dropped by throttle");
        }
        ReportOutcome::GuidSwitched { previous } => {
            warn!(rpc = REPORT_LOG, caller = address, %guid, %previous, "Suspect: guid switched, address throttled");
        }
        ReportOutcome::Blacklisted { species } => {
            info!(rpc = REPORT_LOG, caller = address, %guid, species = species.as_str(), "Report refused: blacklisted species");
        }
        ReportOutcome::NodeTimedOut | ReportOutcome::NodeCorrupted => {
            info!(rpc = REPORT_LOG, caller = address, %guid, outcome = outcome.label(), "Node must resynchronize");
        }
        ReportOutcome::Rejected(reason) => {
            warn!(rpc = REPORT_LOG, caller = address, %guid, %reason, "Suspect: report rejected");
        }
        ReportOutcome::StoreFault(message) => {
            error!(rpc = REPORT_LOG, caller = address, %guid, error = message.as_str(), "Report failed");
        }
    }

    outcome.return_code()
}
