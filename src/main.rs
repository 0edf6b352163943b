use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peer_telemetry::blacklist::BlacklistChecker;
use peer_telemetry::clock::{SharedClock, SystemClock};
use peer_telemetry::config::Config;
use peer_telemetry::discovery::DiscoveryService;
use peer_telemetry::server::{start_server, AppState};
use peer_telemetry::storage::Store;
use peer_telemetry::{logging, metrics};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "peer_telemetry")]
#[command(about = "Peer population telemetry ingestion and discovery service")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the reporting and discovery RPCs over HTTP
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create or upgrade the database schema
    Migrate,
    /// Blacklist a species so reports containing it are refused
    Blacklist {
        species: String,
        /// Lift the blacklist instead
        #[arg(long)]
        remove: bool,
    },
    /// Disable a client version; registering peers get a global failure
    DisableVersion {
        version: String,
        /// Message shown to users of the disabled version
        #[arg(long)]
        message: String,
    },
    /// Re-enable a previously disabled client version
    EnableVersion { version: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let _guard = logging::init_logging();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let store = Arc::new(Store::open(&config.storage).context("Failed to open store")?);
    let clock: SharedClock = Arc::new(SystemClock);

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if config.metrics.enabled {
                metrics::init_metrics();
            }
            let state = Arc::new(AppState::from_config(&config, store, clock));
            start_server(&config, state)
                .await
                .context("HTTP server failed")?;
        }
        Commands::Migrate => {
            info!(path = %config.storage.database_path.display(), "Schema is up to date");
            println!("Migrated {}", config.storage.database_path.display());
        }
        Commands::Blacklist { species, remove } => {
            BlacklistChecker::new(store).set_blacklisted(&species, !remove)?;
            if remove {
                println!("Removed {species} from the blacklist");
            } else {
                println!("Blacklisted {species}");
            }
        }
        Commands::DisableVersion { version, message } => {
            DiscoveryService::new(store, clock, config.discovery.clone())
                .set_version_gate(&version, true, &message)?;
            println!("Disabled version {version}");
        }
        Commands::EnableVersion { version } => {
            DiscoveryService::new(store, clock, config.discovery.clone())
                .set_version_gate(&version, false, "")?;
            println!("Enabled version {version}");
        }
    }

    Ok(())
}
