//! Peer identity tracking: the per-address guid map and the per-guid node
//! consistency check run inside each report transaction.

use crate::clock::SharedClock;
use crate::config::NodePolicyConfig;
use crate::error::Result;
use crate::storage;
use crate::types::NodeState;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rusqlite::Connection;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCheck {
    Ok,
    TimedOut,
    Corrupted,
}

/// Decides whether a report is consistent with the node's recorded state.
pub trait NodeStatePolicy: Send + Sync {
    fn evaluate(
        &self,
        previous: Option<&NodeState>,
        contact_time: DateTime<Utc>,
        current_tick: i32,
    ) -> NodeCheck;
}

/// Default rules: ticks never regress, contact time strictly increases, silence
/// longer than `timeout` is a time-out, and ticks cannot advance faster than a
/// peer could simulate them.
#[derive(Debug, Clone)]
pub struct ThresholdNodePolicy {
    pub timeout: Duration,
    pub max_ticks_per_second: i64,
    pub tick_slack: i64,
}

impl ThresholdNodePolicy {
    pub fn from_config(config: &NodePolicyConfig) -> Self {
        Self {
            timeout: Duration::seconds(config.timeout_secs),
            max_ticks_per_second: config.max_ticks_per_second,
            tick_slack: config.tick_slack,
        }
    }
}

impl Default for ThresholdNodePolicy {
    fn default() -> Self {
        Self::from_config(&NodePolicyConfig::default())
    }
}

impl NodeStatePolicy for ThresholdNodePolicy {
    fn evaluate(
        &self,
        previous: Option<&NodeState>,
        contact_time: DateTime<Utc>,
        current_tick: i32,
    ) -> NodeCheck {
        let Some(previous) = previous else {
            return NodeCheck::Ok;
        };

        if current_tick < previous.last_tick_number {
            return NodeCheck::Corrupted;
        }
        if contact_time <= previous.last_contact_time {
            return NodeCheck::Corrupted;
        }

        let elapsed = contact_time - previous.last_contact_time;
        if elapsed > self.timeout {
            return NodeCheck::TimedOut;
        }

        let advanced = i64::from(current_tick) - i64::from(previous.last_tick_number);
        let allowed = self
            .max_ticks_per_second
            .saturating_mul(elapsed.num_seconds())
            .saturating_add(self.tick_slack);
        if advanced > allowed {
            return NodeCheck::Corrupted;
        }

        NodeCheck::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidObservation {
    First,
    Unchanged,
    Switched { previous: Uuid },
}

/// Last guid seen per source address.
pub struct GuidTracker {
    last_guid: DashMap<String, (Uuid, DateTime<Utc>)>,
    clock: SharedClock,
}

impl GuidTracker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            last_guid: DashMap::new(),
            clock,
        }
    }

    /// Record `guid` as the address's current guid and report what it replaced.
    pub fn observe(&self, address: &str, guid: Uuid) -> GuidObservation {
        let now = self.clock.now();
        match self.last_guid.insert(address.to_string(), (guid, now)) {
            None => GuidObservation::First,
            Some((previous, _)) if previous == guid => GuidObservation::Unchanged,
            Some((previous, _)) => GuidObservation::Switched { previous },
        }
    }

    pub fn last_guid(&self, address: &str) -> Option<Uuid> {
        self.last_guid.get(address).map(|entry| entry.0)
    }

    /// Forget addresses not seen for longer than `max_idle`.
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        let cutoff = self.clock.now() - max_idle;
        let before = self.last_guid.len();
        self.last_guid.retain(|_, (_, seen)| *seen >= cutoff);
        before.saturating_sub(self.last_guid.len())
    }

    pub fn len(&self) -> usize {
        self.last_guid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_guid.is_empty()
    }
}

pub struct PeerRegistry {
    policy: Arc<dyn NodeStatePolicy>,
    guids: GuidTracker,
}

impl PeerRegistry {
    pub fn new(policy: Arc<dyn NodeStatePolicy>, clock: SharedClock) -> Self {
        Self {
            policy,
            guids: GuidTracker::new(clock),
        }
    }

    pub fn guids(&self) -> &GuidTracker {
        &self.guids
    }

    /// Evaluate the report against the stored node state and, when consistent,
    /// advance the stored state. Must run on the report's transaction.
    pub fn check_and_update_node_state(
        &self,
        conn: &Connection,
        guid: Uuid,
        contact_time: DateTime<Utc>,
        current_tick: i32,
    ) -> Result<NodeCheck> {
        let previous = storage::load_node_state(conn, guid)?;
        let check = self
            .policy
            .evaluate(previous.as_ref(), contact_time, current_tick);

        if check == NodeCheck::Ok {
            storage::save_node_state(
                conn,
                &NodeState {
                    guid,
                    last_contact_time: contact_time,
                    last_tick_number: current_tick,
                },
            )?;
        } else {
            debug!(%guid, ?check, current_tick, "Node state check failed");
        }
        Ok(check)
    }
}
