use crate::blacklist::BlacklistChecker;
use crate::boundary::{self, RejectReason, ReportOutcome};
use crate::clock::SharedClock;
use crate::config::{LimitsConfig, ThrottleConfig};
use crate::constants::{REPORT_LONG_BUCKET, REPORT_SHORT_BUCKET};
use crate::error::Result;
use crate::metrics::ReportingMetrics;
use crate::registry::{GuidObservation, NodeCheck, PeerRegistry};
use crate::storage::{self, Store, TxFinish};
use crate::throttle::RateLimiter;
use crate::types::{CallerContext, HistoryRecord, ReturnCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// One `ReportPopulation` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    #[serde(default)]
    pub guid: Uuid,
    pub current_tick: i32,
}

/// Throttles, checks and transactionally persists population history batches.
pub struct IngestionPipeline {
    store: Arc<Store>,
    limiter: Arc<RateLimiter>,
    registry: Arc<PeerRegistry>,
    blacklist: BlacklistChecker,
    clock: SharedClock,
    throttle: ThrottleConfig,
    limits: LimitsConfig,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<Store>,
        limiter: Arc<RateLimiter>,
        registry: Arc<PeerRegistry>,
        clock: SharedClock,
        throttle: ThrottleConfig,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            blacklist: BlacklistChecker::new(store.clone()),
            store,
            limiter,
            registry,
            clock,
            throttle,
            limits,
        }
    }

    /// `ReportPopulation`: run the batch through every gate and return the wire code.
    #[instrument(skip_all, fields(caller = %caller.address, guid = %request.guid, current_tick = request.current_tick))]
    pub fn report_population(&self, caller: &CallerContext, request: ReportRequest) -> ReturnCode {
        let guid = request.guid;
        let outcome = self.evaluate(caller, request);
        boundary::finish_report(caller, guid, &outcome)
    }

    /// The real outcome of a report, before it is flattened for the wire.
    pub fn evaluate(&self, caller: &CallerContext, request: ReportRequest) -> ReportOutcome {
        match self.run_gates(caller, request) {
            Ok(outcome) => outcome,
            Err(e) => ReportOutcome::StoreFault(e.to_string()),
        }
    }

    fn run_gates(&self, caller: &CallerContext, request: ReportRequest) -> Result<ReportOutcome> {
        let address = caller.address.as_str();
        let ReportRequest {
            history,
            guid,
            current_tick,
        } = request;

        if guid.is_nil() {
            return Ok(ReportOutcome::Rejected(RejectReason::NilGuid));
        }

        if self.limiter.is_throttled(address, REPORT_SHORT_BUCKET) {
            return Ok(ReportOutcome::ShortThrottled);
        }
        if self.limiter.is_throttled(address, REPORT_LONG_BUCKET) {
            return Ok(ReportOutcome::LongThrottled);
        }

        let now = self.clock.now();
        self.limiter.add_throttle(
            address,
            REPORT_SHORT_BUCKET,
            1,
            now + self.throttle.short_window(),
        );

        if let GuidObservation::Switched { previous } = self.registry.guids().observe(address, guid)
        {
            self.limiter.add_throttle(
                address,
                REPORT_LONG_BUCKET,
                1,
                now + self.throttle.long_window(),
            );
            return Ok(ReportOutcome::GuidSwitched { previous });
        }

        if let Some(species) = self
            .blacklist
            .first_blacklisted(history.iter().map(|row| row.species_name.as_str()))?
        {
            return Ok(ReportOutcome::Blacklisted { species });
        }

        let rows = normalize_rows(history, guid, current_tick, now);
        self.persist(guid, current_tick, now, rows)
    }

    /// The transactional tail: node check, bounds, inserts. A species blacklisted
    /// after the pre-scan is still committed, flagged per row.
    fn persist(
        &self,
        guid: Uuid,
        current_tick: i32,
        now: DateTime<Utc>,
        rows: Vec<HistoryRecord>,
    ) -> Result<ReportOutcome> {
        let limits = &self.limits;
        let outcome = self.store.in_transaction(|tx| {
            match self
                .registry
                .check_and_update_node_state(tx, guid, now, current_tick)?
            {
                NodeCheck::Ok => {}
                NodeCheck::TimedOut => return Ok((ReportOutcome::NodeTimedOut, TxFinish::Rollback)),
                NodeCheck::Corrupted => {
                    return Ok((ReportOutcome::NodeCorrupted, TxFinish::Rollback))
                }
            }

            if let Err(reason) = validate_batch(&rows, current_tick, limits) {
                return Ok((ReportOutcome::Rejected(reason), TxFinish::Rollback));
            }

            let mut blacklisted = false;
            for row in &rows {
                blacklisted |= storage::insert_history(tx, row)?;
            }
            let outcome = if blacklisted {
                ReportOutcome::CommittedBlacklisted { rows: rows.len() }
            } else {
                ReportOutcome::Committed { rows: rows.len() }
            };
            Ok((outcome, TxFinish::Commit))
        })?;

        if matches!(
            outcome,
            ReportOutcome::NodeTimedOut | ReportOutcome::NodeCorrupted
        ) {
            if let Err(e) = self
                .store
                .with_connection(|conn| storage::clear_node_state(conn, guid))
            {
                warn!(%guid, error = %e, "Failed to clear node state after resync");
            }
        }

        Ok(outcome)
    }

    /// Evict expired throttles and idle guid mappings. Run periodically by the server.
    pub fn sweep(&self) -> usize {
        let throttles = self.limiter.purge_expired();
        let guids = self
            .registry
            .guids()
            .purge_idle(self.throttle.long_window());
        ReportingMetrics::set_throttle_entries(self.limiter.len());
        if throttles + guids > 0 {
            debug!(throttles, guids, "Swept ingestion state");
        }
        throttles + guids
    }
}

/// Stamp server-side fields: batch guid, contact time, and whether the row is on time.
fn normalize_rows(
    history: Vec<HistoryRecord>,
    guid: Uuid,
    current_tick: i32,
    contact_time: DateTime<Utc>,
) -> Vec<HistoryRecord> {
    history
        .into_iter()
        .map(|mut row| {
            row.guid = guid;
            row.contact_time = Some(contact_time);
            row.correct_time = row.tick_number == current_tick;
            row
        })
        .collect()
}

/// Bounds check over a normalized batch. Only rows for `current_tick` count
/// toward the running total; every row must be within the per-row range.
pub fn validate_batch(
    rows: &[HistoryRecord],
    current_tick: i32,
    limits: &LimitsConfig,
) -> std::result::Result<(), RejectReason> {
    if rows.len() > limits.max_rows {
        return Err(RejectReason::TooManyRows {
            rows: rows.len(),
            max: limits.max_rows,
        });
    }

    let mut total: i64 = 0;
    for row in rows {
        if row.population < 0 || row.population > limits.max_row_population {
            return Err(RejectReason::RowPopulationOutOfRange {
                species: row.species_name.clone(),
                population: row.population,
            });
        }
        if row.tick_number == current_tick {
            total += i64::from(row.population);
            if total > limits.max_total_population {
                return Err(RejectReason::TotalPopulationExceeded {
                    total,
                    max: limits.max_total_population,
                });
            }
        }
    }
    Ok(())
}
