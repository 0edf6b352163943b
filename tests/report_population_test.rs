use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use peer_telemetry::blacklist::BlacklistChecker;
use peer_telemetry::boundary::{RejectReason, ReportOutcome};
use peer_telemetry::clock::{Clock, ManualClock, SharedClock};
use peer_telemetry::config::{LimitsConfig, ThrottleConfig};
use peer_telemetry::constants::{REPORT_LONG_BUCKET, REPORT_SHORT_BUCKET};
use peer_telemetry::pipeline::{IngestionPipeline, ReportRequest};
use peer_telemetry::registry::{PeerRegistry, ThresholdNodePolicy};
use peer_telemetry::storage::{self, Store};
use peer_telemetry::throttle::RateLimiter;
use peer_telemetry::types::{CallerContext, HistoryRecord, ReturnCode};
use std::sync::Arc;
use uuid::Uuid;

const ADDRESS: &str = "203.0.113.7";

struct Harness {
    pipeline: IngestionPipeline,
    store: Arc<Store>,
    limiter: Arc<RateLimiter>,
    clock: ManualClock,
}

impl Harness {
    fn new() -> Result<Self> {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap());
        let shared: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(Store::open_in_memory()?);
        let limiter = Arc::new(RateLimiter::new(shared.clone()));
        let registry = Arc::new(PeerRegistry::new(
            Arc::new(ThresholdNodePolicy::default()),
            shared.clone(),
        ));
        let pipeline = IngestionPipeline::new(
            store.clone(),
            limiter.clone(),
            registry,
            shared,
            ThrottleConfig::default(),
            LimitsConfig::default(),
        );
        Ok(Self {
            pipeline,
            store,
            limiter,
            clock,
        })
    }

    fn report(&self, guid: Uuid, current_tick: i32, history: Vec<HistoryRecord>) -> ReturnCode {
        self.pipeline.report_population(
            &CallerContext::new(ADDRESS),
            ReportRequest {
                history,
                guid,
                current_tick,
            },
        )
    }

    fn evaluate(&self, guid: Uuid, current_tick: i32, history: Vec<HistoryRecord>) -> ReportOutcome {
        self.pipeline.evaluate(
            &CallerContext::new(ADDRESS),
            ReportRequest {
                history,
                guid,
                current_tick,
            },
        )
    }

    /// Step past the short throttle so the next report reaches the later gates.
    fn next_window(&self) {
        self.clock.advance(Duration::seconds(181));
    }

    fn rows_for(&self, guid: Uuid) -> Result<Vec<HistoryRecord>> {
        Ok(self
            .store
            .with_connection(|conn| storage::history_for_guid(conn, guid))?)
    }

    fn total_rows(&self) -> Result<i64> {
        Ok(self.store.with_connection(storage::count_history)?)
    }
}

fn row(species: &str, tick: i32, population: i32) -> HistoryRecord {
    HistoryRecord {
        guid: Uuid::nil(),
        species_name: species.to_string(),
        tick_number: tick,
        population,
        birth_count: 1,
        teleported_to_count: 0,
        starved_count: 0,
        killed_count: 0,
        teleported_from_count: 0,
        error_count: 0,
        timeout_count: 0,
        sick_count: 0,
        old_age_count: 0,
        security_violation_count: 0,
        client_time: Utc.with_ymd_and_hms(2024, 6, 1, 9, 59, 0).unwrap(),
        contact_time: None,
        correct_time: true,
    }
}

#[test]
fn test_scenario_a_fresh_batch_is_persisted() -> Result<()> {
    let h = Harness::new()?;
    let g1 = Uuid::new_v4();

    let code = h.report(g1, 10, vec![row("Ant", 10, 50), row("Bee", 10, 40)]);
    assert_eq!(code, ReturnCode::Success);

    let rows = h.rows_for(g1)?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.correct_time));
    assert!(rows.iter().all(|r| r.contact_time == Some(h.clock.now())));
    assert_eq!(rows[0].population, 50);
    assert_eq!(rows[1].population, 40);
    Ok(())
}

#[test]
fn test_scenario_b_guid_switch_arms_long_throttle() -> Result<()> {
    let h = Harness::new()?;
    let g1 = Uuid::new_v4();
    let g2 = Uuid::new_v4();

    assert_eq!(h.report(g1, 10, vec![row("Ant", 10, 50)]), ReturnCode::Success);

    h.next_window();
    let outcome = h.evaluate(g2, 11, vec![row("Ant", 11, 51)]);
    assert_eq!(outcome, ReportOutcome::GuidSwitched { previous: g1 });
    assert_eq!(outcome.return_code(), ReturnCode::Success);
    assert!(h.limiter.is_throttled(ADDRESS, REPORT_LONG_BUCKET));
    assert!(h.rows_for(g2)?.is_empty());

    h.next_window();
    assert_eq!(
        h.evaluate(g1, 12, vec![row("Ant", 12, 52)]),
        ReportOutcome::LongThrottled
    );
    assert_eq!(h.total_rows()?, 1);
    Ok(())
}

#[test]
fn test_long_throttle_lifts_after_twelve_hours() -> Result<()> {
    let h = Harness::new()?;
    let g1 = Uuid::new_v4();
    let g2 = Uuid::new_v4();

    h.report(g1, 10, vec![]);
    h.next_window();
    h.report(g2, 10, vec![]);

    h.clock.advance(Duration::hours(12) + Duration::seconds(1));
    assert!(!h.limiter.is_throttled(ADDRESS, REPORT_LONG_BUCKET));
    // g2 is now the address's recorded guid; its node state was never written
    assert_eq!(
        h.evaluate(g2, 20, vec![row("Ant", 20, 5)]),
        ReportOutcome::Committed { rows: 1 }
    );
    Ok(())
}

#[test]
fn test_resubmission_inside_short_window_writes_nothing() -> Result<()> {
    let h = Harness::new()?;
    let guid = Uuid::new_v4();
    let batch = vec![row("Ant", 10, 50), row("Bee", 10, 40)];

    assert_eq!(
        h.evaluate(guid, 10, batch.clone()),
        ReportOutcome::Committed { rows: 2 }
    );
    assert!(h.limiter.is_throttled(ADDRESS, REPORT_SHORT_BUCKET));

    let outcome = h.evaluate(guid, 10, batch);
    assert_eq!(outcome, ReportOutcome::ShortThrottled);
    assert_eq!(outcome.return_code(), ReturnCode::Success);
    assert_eq!(h.total_rows()?, 2);
    Ok(())
}

#[test]
fn test_oversized_batch_is_rejected_whole() -> Result<()> {
    let h = Harness::new()?;
    let guid = Uuid::new_v4();
    let batch: Vec<_> = (0..601).map(|i| row("Ant", 1000 - i, 0)).collect();

    let outcome = h.evaluate(guid, 1000, batch);
    assert_eq!(
        outcome,
        ReportOutcome::Rejected(RejectReason::TooManyRows { rows: 601, max: 600 })
    );
    assert_eq!(outcome.return_code(), ReturnCode::Success);
    assert_eq!(h.total_rows()?, 0);
    // The node-state write rolled back with the rows
    let state = h
        .store
        .with_connection(|conn| storage::load_node_state(conn, guid))?;
    assert!(state.is_none());
    Ok(())
}

#[test]
fn test_population_bounds_roll_back() -> Result<()> {
    let h = Harness::new()?;
    let guid = Uuid::new_v4();

    let over_total = vec![row("Ant", 5, 300), row("Bee", 5, 300), row("Cat", 5, 1)];
    assert!(matches!(
        h.evaluate(guid, 5, over_total),
        ReportOutcome::Rejected(RejectReason::TotalPopulationExceeded { total: 601, .. })
    ));

    h.next_window();
    assert!(matches!(
        h.evaluate(guid, 6, vec![row("Ant", 6, 10), row("Bee", 6, 341)]),
        ReportOutcome::Rejected(RejectReason::RowPopulationOutOfRange { .. })
    ));

    h.next_window();
    assert!(matches!(
        h.evaluate(guid, 7, vec![row("Ant", 7, -1)]),
        ReportOutcome::Rejected(RejectReason::RowPopulationOutOfRange { .. })
    ));

    assert_eq!(h.total_rows()?, 0);
    Ok(())
}

#[test]
fn test_delayed_rows_are_flagged_and_excluded_from_total() -> Result<()> {
    let h = Harness::new()?;
    let guid = Uuid::new_v4();
    let batch = vec![row("Ant", 9, 300), row("Ant", 10, 300), row("Bee", 10, 300)];

    assert_eq!(h.report(guid, 10, batch), ReturnCode::Success);

    let rows = h.rows_for(guid)?;
    assert_eq!(rows.len(), 3);
    assert!(!rows[0].correct_time);
    assert!(rows[1].correct_time && rows[2].correct_time);
    Ok(())
}

#[test]
fn test_blacklisted_species_blocks_whole_batch() -> Result<()> {
    let h = Harness::new()?;
    BlacklistChecker::new(h.store.clone()).set_blacklisted("Wolf", true)?;
    let guid = Uuid::new_v4();

    let code = h.report(guid, 3, vec![row("Ant", 3, 10), row("Wolf", 3, 2)]);
    assert_eq!(code, ReturnCode::OrganismBlacklisted);
    assert_eq!(h.total_rows()?, 0);
    Ok(())
}

#[test]
fn test_tick_regression_is_corrupted_then_recovers() -> Result<()> {
    let h = Harness::new()?;
    let guid = Uuid::new_v4();

    assert_eq!(h.report(guid, 100, vec![row("Ant", 100, 5)]), ReturnCode::Success);

    h.next_window();
    assert_eq!(
        h.report(guid, 50, vec![row("Ant", 50, 5)]),
        ReturnCode::NodeCorrupted
    );
    assert_eq!(h.rows_for(guid)?.len(), 1);

    h.next_window();
    assert_eq!(h.report(guid, 60, vec![row("Ant", 60, 5)]), ReturnCode::Success);
    assert_eq!(h.rows_for(guid)?.len(), 2);
    Ok(())
}

#[test]
fn test_silence_beyond_timeout_then_recovers() -> Result<()> {
    let h = Harness::new()?;
    let guid = Uuid::new_v4();

    assert_eq!(h.report(guid, 1, vec![row("Ant", 1, 5)]), ReturnCode::Success);

    h.clock.advance(Duration::minutes(31));
    assert_eq!(
        h.report(guid, 2, vec![row("Ant", 2, 5)]),
        ReturnCode::NodeTimedOut
    );

    h.next_window();
    assert_eq!(h.report(guid, 3, vec![row("Ant", 3, 5)]), ReturnCode::Success);
    assert_eq!(h.rows_for(guid)?.len(), 2);
    Ok(())
}

#[test]
fn test_nil_guid_is_rejected_without_arming_throttle() -> Result<()> {
    let h = Harness::new()?;

    let outcome = h.evaluate(Uuid::nil(), 1, vec![row("Ant", 1, 5)]);
    assert_eq!(outcome, ReportOutcome::Rejected(RejectReason::NilGuid));
    assert_eq!(outcome.return_code(), ReturnCode::Success);
    assert!(h.limiter.is_empty());
    assert_eq!(h.total_rows()?, 0);
    Ok(())
}

#[test]
fn test_rows_are_rewritten_to_batch_guid() -> Result<()> {
    let h = Harness::new()?;
    let guid = Uuid::new_v4();
    let mut forged = row("Ant", 4, 5);
    forged.guid = Uuid::new_v4();
    forged.correct_time = false;

    h.report(guid, 4, vec![forged]);

    let rows = h.rows_for(guid)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].guid, guid);
    assert!(rows[0].correct_time);
    Ok(())
}

#[test]
fn test_empty_batch_records_node_state_only() -> Result<()> {
    let h = Harness::new()?;
    let guid = Uuid::new_v4();

    assert_eq!(h.evaluate(guid, 42, vec![]), ReportOutcome::Committed { rows: 0 });
    let state = h
        .store
        .with_connection(|conn| storage::load_node_state(conn, guid))?
        .expect("node state recorded");
    assert_eq!(state.last_tick_number, 42);
    assert_eq!(h.total_rows()?, 0);
    Ok(())
}

#[test]
fn test_sweep_evicts_expired_state() -> Result<()> {
    let h = Harness::new()?;
    h.report(Uuid::new_v4(), 1, vec![]);
    assert_eq!(h.limiter.len(), 1);

    h.clock.advance(Duration::hours(13));
    assert_eq!(h.pipeline.sweep(), 2);
    assert!(h.limiter.is_empty());
    Ok(())
}

#[test]
fn test_concurrent_reports_from_distinct_addresses() -> Result<()> {
    let h = Harness::new()?;

    std::thread::scope(|scope| {
        for i in 0..8 {
            let pipeline = &h.pipeline;
            scope.spawn(move || {
                let caller = CallerContext::new(format!("198.51.100.{i}"));
                let request = ReportRequest {
                    history: vec![row("Ant", 1, 5), row("Bee", 1, 5)],
                    guid: Uuid::new_v4(),
                    current_tick: 1,
                };
                assert_eq!(
                    pipeline.report_population(&caller, request),
                    ReturnCode::Success
                );
            });
        }
    });

    assert_eq!(h.total_rows()?, 16);
    assert_eq!(h.limiter.len(), 8);
    Ok(())
}
