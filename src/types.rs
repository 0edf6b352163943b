use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire return codes for `ReportPopulation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ReturnCode {
    Success = 0,
    AlreadyExists = 1,
    ServerDown = 2,
    NodeTimedOut = 3,
    NodeCorrupted = 4,
    OrganismBlacklisted = 5,
}

impl From<ReturnCode> for i32 {
    fn from(code: ReturnCode) -> Self {
        code as i32
    }
}

impl TryFrom<i32> for ReturnCode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReturnCode::Success),
            1 => Ok(ReturnCode::AlreadyExists),
            2 => Ok(ReturnCode::ServerDown),
            3 => Ok(ReturnCode::NodeTimedOut),
            4 => Ok(ReturnCode::NodeCorrupted),
            5 => Ok(ReturnCode::OrganismBlacklisted),
            other => Err(format!("unknown return code {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterPeerResult {
    Success,
    Failure,
    GlobalFailure,
}

/// One row of population history for a single species at a single tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// Overwritten with the batch guid on ingestion.
    #[serde(default)]
    pub guid: Uuid,
    pub species_name: String,
    pub tick_number: i32,
    pub population: i32,
    #[serde(default)]
    pub birth_count: i32,
    #[serde(default)]
    pub teleported_to_count: i32,
    #[serde(default)]
    pub starved_count: i32,
    #[serde(default)]
    pub killed_count: i32,
    #[serde(default)]
    pub teleported_from_count: i32,
    #[serde(default)]
    pub error_count: i32,
    #[serde(default)]
    pub timeout_count: i32,
    #[serde(default)]
    pub sick_count: i32,
    #[serde(default)]
    pub old_age_count: i32,
    #[serde(default)]
    pub security_violation_count: i32,
    pub client_time: DateTime<Utc>,
    /// Server-stamped; any client-supplied value is replaced.
    #[serde(default)]
    pub contact_time: Option<DateTime<Utc>>,
    #[serde(default = "default_correct_time")]
    pub correct_time: bool,
}

fn default_correct_time() -> bool {
    true
}

/// A registered peer as published in discovery responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub guid: Uuid,
    pub source_address: String,
    pub version: String,
    pub channel: String,
    pub last_contact_time: DateTime<Utc>,
    pub last_tick_number: Option<i32>,
}

/// Stored last-contact state for one guid, used by the node consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeState {
    pub guid: Uuid,
    pub last_contact_time: DateTime<Utc>,
    pub last_tick_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionGate {
    pub disabled: bool,
    pub message: String,
}

/// One entry of a client diagnostic bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorReport {
    pub log_type: String,
    pub os_version: String,
    pub game_version: String,
    pub runtime_version: String,
    pub error_log: String,
    pub user_email: String,
    pub user_comment: String,
}

/// Caller metadata every RPC is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub address: String,
}

impl CallerContext {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}
