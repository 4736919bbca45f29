//! dual-health daemon
//!
//! ```text
//!                ┌──────────────────────────────────────────────────────┐
//!                │                     DUAL-HEALTH                      │
//!                │                                                      │
//!   config.toml ─┼─▶ config ──▶ Engine ──▶ FleetMonitor (interval)      │
//!   (watched)    │                │            │                       │
//!                │   admin API ───┤            ▼                       │
//!                │   (/admin/*)   │   DualCheckOrchestrator            │
//!                │                ▼      │            │                │
//!                │         BatchScheduler│  capability │ REST          │
//!                │                       ▼            ▼                │
//!                │        ResourceMonitor · pools · cache · breakers   │
//!                │                       │                             │
//!                │                       ▼                             │
//!                │            ResultAggregator ──▶ metrics / logs      │
//!                └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use dual_health::config::{load_config, ConfigWatcher};
use dual_health::lifecycle::signals::wait_for_shutdown_signal;
use dual_health::observability::{logging::init_logging, metrics::init_metrics};
use dual_health::{Engine, HealthConfig};

/// How long shutdown waits for background loops before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "dual-health")]
#[command(about = "Dual-protocol health checking engine", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "dual-health.toml")]
    config: PathBuf,

    /// Do not reload the configuration when the file changes.
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (config, from_file) = if args.config.exists() {
        (load_config(&args.config)?, true)
    } else {
        (HealthConfig::default(), false)
    };

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "dual-health starting");
    if !from_file {
        tracing::warn!(path = ?args.config, "Config file not found, using defaults");
    }

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    // The watcher handle must outlive the engine.
    let mut _watcher = None;
    let mut updates = None;
    if from_file && !args.no_watch {
        let (watcher, rx) = ConfigWatcher::new(&args.config);
        match watcher.run() {
            Ok(handle) => {
                _watcher = Some(handle);
                updates = Some(rx);
            }
            Err(e) => {
                tracing::error!(error = %e, "Config watcher failed to start, reload disabled")
            }
        }
    }

    let engine = Engine::from_config(config)?;
    engine.start(updates).await?;

    wait_for_shutdown_signal().await;
    engine.stop(SHUTDOWN_GRACE).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
