//! Peer registration and census: joining the peer network, counting peers in a
//! (version, channel) scope, and the administrative version kill-switch.

use crate::clock::SharedClock;
use crate::config::DiscoveryConfig;
use crate::constants::{CHECK_VERSION_LOG, GET_NUM_PEERS_LOG, REGISTER_PEER_LOG, REGISTER_USER_LOG};
use crate::error::Result;
use crate::metrics::DiscoveryMetrics;
use crate::storage::{self, Store, TxFinish};
use crate::types::{CallerContext, PeerIdentity, RegisterPeerResult, VersionGate};
use crate::version::Version;
use chrono::Duration;
use rusqlite::Connection;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Result of `RegisterMyPeerGetCountAndPeerList`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerListing {
    pub result: RegisterPeerResult,
    pub peers: Vec<PeerIdentity>,
    pub count: i64,
}

impl PeerListing {
    fn empty(result: RegisterPeerResult) -> Self {
        Self {
            result,
            peers: Vec::new(),
            count: 0,
        }
    }
}

pub struct DiscoveryService {
    store: Arc<Store>,
    clock: SharedClock,
    config: DiscoveryConfig,
}

impl DiscoveryService {
    pub fn new(store: Arc<Store>, clock: SharedClock, config: DiscoveryConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    fn liveness_window(&self) -> Duration {
        Duration::seconds(self.config.liveness_window_secs)
    }

    /// Record `email` against the caller's address. Never fails outward.
    #[instrument(skip_all, fields(caller = %caller.address))]
    pub fn register_user(&self, caller: &CallerContext, email: &str) -> bool {
        let email = email.trim();
        if email.is_empty() {
            warn!(rpc = REGISTER_USER_LOG, caller = caller.address.as_str(), "Suspect: empty email");
            DiscoveryMetrics::record_failure();
            return false;
        }

        let now = self.clock.now();
        match self
            .store
            .with_connection(|conn| storage::upsert_user(conn, email, &caller.address, now))
        {
            Ok(()) => {
                DiscoveryMetrics::record_call();
                true
            }
            Err(e) => {
                error!(rpc = REGISTER_USER_LOG, caller = caller.address.as_str(), error = %e, "Failed to register user");
                DiscoveryMetrics::record_failure();
                false
            }
        }
    }

    /// Live peers in the `(version, channel)` scope. Missing or malformed input counts zero.
    #[instrument(skip_all, fields(caller = %caller.address))]
    pub fn get_num_peers(
        &self,
        caller: &CallerContext,
        version: Option<&str>,
        channel: Option<&str>,
    ) -> i64 {
        let Some((version, channel)) = scope(caller, GET_NUM_PEERS_LOG, version, channel) else {
            DiscoveryMetrics::record_failure();
            return 0;
        };

        let since = self.clock.now() - self.liveness_window();
        match self.store.with_connection(|conn| {
            storage::count_live_peers(conn, &version.short(), channel, since)
        }) {
            Ok(count) => {
                DiscoveryMetrics::record_call();
                count
            }
            Err(e) => {
                error!(rpc = GET_NUM_PEERS_LOG, caller = caller.address.as_str(), error = %e, "Failed to count peers");
                DiscoveryMetrics::record_failure();
                0
            }
        }
    }

    /// Echo the caller's address as this server sees it.
    pub fn validate_peer(&self, caller: &CallerContext) -> String {
        DiscoveryMetrics::record_call();
        caller.address.clone()
    }

    /// Register the caller as a live peer and return the other live peers in scope.
    #[instrument(skip_all, fields(caller = %caller.address, %guid))]
    pub fn register_peer(
        &self,
        caller: &CallerContext,
        version: Option<&str>,
        channel: Option<&str>,
        guid: Uuid,
    ) -> PeerListing {
        let Some((version, channel)) = scope(caller, REGISTER_PEER_LOG, version, channel) else {
            DiscoveryMetrics::record_failure();
            return PeerListing::empty(RegisterPeerResult::GlobalFailure);
        };
        if guid.is_nil() {
            warn!(rpc = REGISTER_PEER_LOG, caller = caller.address.as_str(), "Suspect: missing guid");
            DiscoveryMetrics::record_failure();
            return PeerListing::empty(RegisterPeerResult::GlobalFailure);
        }

        match self.join(caller, &version, channel, guid) {
            Ok(listing) => {
                DiscoveryMetrics::record_call();
                DiscoveryMetrics::record_registration();
                listing
            }
            Err(e) => {
                error!(rpc = REGISTER_PEER_LOG, caller = caller.address.as_str(), error = %e, "Peer registration failed");
                DiscoveryMetrics::record_failure();
                DiscoveryMetrics::record_registration_failure();
                PeerListing::empty(RegisterPeerResult::Failure)
            }
        }
    }

    fn join(
        &self,
        caller: &CallerContext,
        version: &Version,
        channel: &str,
        guid: Uuid,
    ) -> Result<PeerListing> {
        let now = self.clock.now();
        let since = now - self.liveness_window();
        let short = version.short();
        let max_peers = self.config.max_peer_list;

        self.store.in_transaction(|tx| {
            if lookup_gate(tx, version)?.is_some_and(|gate| gate.disabled) {
                info!(rpc = REGISTER_PEER_LOG, caller = caller.address.as_str(), version = %short, "Registration refused: version disabled");
                return Ok((
                    PeerListing::empty(RegisterPeerResult::GlobalFailure),
                    TxFinish::Rollback,
                ));
            }

            let me = PeerIdentity {
                guid,
                source_address: caller.address.clone(),
                version: short.clone(),
                channel: channel.to_string(),
                last_contact_time: now,
                last_tick_number: None,
            };
            storage::upsert_peer(tx, &me, &version.full())?;

            let count = storage::count_live_peers(tx, &short, channel, since)?;
            let peers = storage::live_peers(tx, &short, channel, since, guid, max_peers)?;
            Ok((
                PeerListing {
                    result: RegisterPeerResult::Success,
                    peers,
                    count,
                },
                TxFinish::Commit,
            ))
        })
    }

    /// Client preflight. Versions without an explicit enabled entry, unparseable
    /// versions and store failures all report disabled.
    #[instrument(skip_all)]
    pub fn is_version_disabled(&self, version: &str) -> VersionGate {
        let refused = VersionGate {
            disabled: true,
            message: String::new(),
        };

        let parsed = match version.parse::<Version>() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(rpc = CHECK_VERSION_LOG, error = %e, "Suspect: bad version");
                DiscoveryMetrics::record_failure();
                return refused;
            }
        };

        match self.store.with_connection(|conn| lookup_gate(conn, &parsed)) {
            Ok(Some(gate)) => {
                DiscoveryMetrics::record_call();
                VersionGate {
                    message: if gate.disabled { gate.message } else { String::new() },
                    disabled: gate.disabled,
                }
            }
            Ok(None) => {
                DiscoveryMetrics::record_call();
                refused
            }
            Err(e) => {
                error!(rpc = CHECK_VERSION_LOG, error = %e, "Failed to read version gate");
                DiscoveryMetrics::record_failure();
                refused
            }
        }
    }

    /// Administrative write. A four-part version gates exactly that build; shorter
    /// forms gate the whole `major.minor.build` line.
    pub fn set_version_gate(&self, version: &str, disabled: bool, message: &str) -> Result<()> {
        let parsed: Version = version.parse()?;
        let key = if parsed.revision.is_some() {
            parsed.full()
        } else {
            parsed.short()
        };
        let gate = VersionGate {
            disabled,
            message: message.to_string(),
        };
        self.store
            .with_connection(|conn| storage::set_version_gate(conn, &key, &gate))?;
        info!(version = %key, disabled, "Updated version gate");
        Ok(())
    }
}

/// The exact build's entry wins over its `major.minor.build` line.
fn lookup_gate(conn: &Connection, version: &Version) -> Result<Option<VersionGate>> {
    if let Some(gate) = storage::version_gate(conn, &version.full())? {
        return Ok(Some(gate));
    }
    storage::version_gate(conn, &version.short())
}

/// Validate the `(version, channel)` pair, logging suspect traffic.
fn scope<'a>(
    caller: &CallerContext,
    rpc: &'static str,
    version: Option<&str>,
    channel: Option<&'a str>,
) -> Option<(Version, &'a str)> {
    let (Some(version), Some(channel)) = (version, channel) else {
        warn!(rpc, caller = caller.address.as_str(), "Suspect: missing version or channel");
        return None;
    };
    match version.parse::<Version>() {
        Ok(version) => Some((version, channel)),
        Err(e) => {
            warn!(rpc, caller = caller.address.as_str(), error = %e, "Suspect: bad version");
            None
        }
    }
}
