pub mod blacklist;
pub mod boundary;
pub mod clock;
pub mod config;
pub mod constants;
pub mod diagnostics;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod storage;
pub mod throttle;
pub mod types;
pub mod version;
