//! # spoolbridge
//!
//! Long-running bridge process between the NFC spool tracker and the
//! filament inventory service.
//!
//! ## Process Surface
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  No subcommands. Configuration comes from BRIDGE_* environment          │
//! │  variables and an optional TOML file (BRIDGE_CONFIG).                   │
//! │                                                                         │
//! │  Exit codes:                                                            │
//! │    0  clean shutdown (SIGINT / SIGTERM)                                 │
//! │    1  fatal configuration or authentication error                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use spoolbridge_sync::{BridgeAgent, BridgeConfig};

#[tokio::main]
async fn main() {
    let config = match BridgeConfig::load(None) {
        Ok(config) => config,
        Err(e) => {
            // Logging is configured from the config, so this error goes
            // straight to stderr.
            eprintln!("spoolbridge: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.log.level);

    info!("Spool bridge starting up");
    info!(device = %config.device_base_url(), "Device endpoint");
    info!(inventory = %config.inventory_base_url(), "Inventory endpoint");
    info!(
        poll_interval_secs = config.sync.poll_interval_secs,
        delta_threshold_g = config.sync.delta_threshold_g,
        mapping_path = %config.storage.mapping_path.display(),
        "Sync parameters"
    );

    let mut agent = match BridgeAgent::new(config) {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "Cannot construct bridge");
            std::process::exit(1);
        }
    };

    if let Err(e) = agent.start().await {
        error!(error = %e, "Fatal startup error");
        std::process::exit(1);
    }

    shutdown_signal().await;
    agent.shutdown().await;
    info!("Spool bridge stopped");
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
