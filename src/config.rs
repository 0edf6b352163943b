use crate::error::{Result, TelemetryError};
use chrono::Duration;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "peer_telemetry.toml";

/// Upper bound for every configured window or timeout (ten years).
const MAX_WINDOW_SECS: i64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub throttle: ThrottleConfig,
    pub limits: LimitsConfig,
    pub node_policy: NodePolicyConfig,
    pub discovery: DiscoveryConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// How often expired throttle entries are evicted.
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/peer_telemetry.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub short_window_secs: i64,
    pub long_window_secs: i64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            short_window_secs: 3 * 60,
            long_window_secs: 12 * 60 * 60,
        }
    }
}

impl ThrottleConfig {
    pub fn short_window(&self) -> Duration {
        Duration::seconds(self.short_window_secs)
    }

    pub fn long_window(&self) -> Duration {
        Duration::seconds(self.long_window_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_rows: usize,
    pub max_total_population: i64,
    pub max_row_population: i32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rows: 600,
            max_total_population: 600,
            max_row_population: 340,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodePolicyConfig {
    pub timeout_secs: i64,
    pub max_ticks_per_second: i64,
    pub tick_slack: i64,
}

impl Default for NodePolicyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            max_ticks_per_second: 10,
            tick_slack: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub liveness_window_secs: i64,
    pub max_peer_list: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            liveness_window_secs: 15 * 60,
            max_peer_list: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder and serve `/metrics` on the main router.
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from `path`, or the default location when `None`.
    ///
    /// A missing file at the default location is not an error; every section falls
    /// back to its defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("PEER_TELEMETRY_CONFIG").ok().map(PathBuf::from));

        let mut config = match explicit {
            Some(p) => Self::from_file(&p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            TelemetryError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(db) = std::env::var("PEER_TELEMETRY_DB") {
            self.storage.database_path = PathBuf::from(db);
        }
        if let Ok(port) = std::env::var("PEER_TELEMETRY_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| TelemetryError::Config(format!("PEER_TELEMETRY_PORT: {e}")))?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        check_window("throttle.short_window_secs", self.throttle.short_window_secs)?;
        check_window("throttle.long_window_secs", self.throttle.long_window_secs)?;
        check_window("node_policy.timeout_secs", self.node_policy.timeout_secs)?;
        check_window(
            "discovery.liveness_window_secs",
            self.discovery.liveness_window_secs,
        )?;
        if self.limits.max_row_population < 0 || self.limits.max_total_population < 0 {
            return Err(TelemetryError::Config(
                "population limits must be non-negative".to_string(),
            ));
        }
        if self.node_policy.max_ticks_per_second < 0 || self.node_policy.tick_slack < 0 {
            return Err(TelemetryError::Config(
                "node_policy tick limits must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_window(name: &str, secs: i64) -> Result<()> {
    if secs <= 0 || secs > MAX_WINDOW_SECS {
        return Err(TelemetryError::Config(format!(
            "{name} must be between 1 and {MAX_WINDOW_SECS} seconds, got {secs}"
        )));
    }
    Ok(())
}
