// Throttle bucket names for the reporting RPC
pub const REPORT_SHORT_BUCKET: &str = "report-3min";
pub const REPORT_LONG_BUCKET: &str = "report-12h";

// Log targets for suspect traffic, one per RPC
pub const REPORT_LOG: &str = "Report";
pub const GET_NUM_PEERS_LOG: &str = "GetNumPeers";
pub const REGISTER_PEER_LOG: &str = "RegisterMyPeerGetCountAndPeerList";
pub const REGISTER_USER_LOG: &str = "RegisterUser";
pub const CHECK_VERSION_LOG: &str = "CheckVersion";
pub const DIAGNOSTICS_LOG: &str = "ReportError";
