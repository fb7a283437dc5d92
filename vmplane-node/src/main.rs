//! # vmplane Node Daemon
//!
//! The Node Daemon runs on each hypervisor host and exposes the vmplane
//! control plane (VMs, devices, tasks and the update feed) over a REST API.
//!
//! ## Usage
//! ```bash
//! vmplane-node --config /etc/vmplane/node.yaml
//! vmplane-node --dev --listen 127.0.0.1:8080
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use vmplane_common::LogFormat;

mod cli;
mod config;
mod http_server;
mod server;

use cli::Args;
use config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let (config, source) = match &args.config {
        Some(config_path) => {
            let cfg = Config::load(config_path)?;
            (cfg.with_cli_overrides(&args), Some(config_path.clone()))
        }
        // Try default location, fall back to CLI-only config
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => (cfg.with_cli_overrides(&args), Some(DEFAULT_CONFIG_PATH.to_string())),
            Err(_) => (Config::default_with_cli(&args), None),
        },
    };

    // Initialize logging
    let format = if config.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    vmplane_common::init_logging(&args.log_level, format)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting vmplane Node Daemon");
    match source {
        Some(path) => info!(config_path = %path, "Configuration loaded"),
        None => info!("No config file found, using CLI arguments and defaults"),
    }

    info!(
        listen = %config.server.listen_address,
        hypervisor = ?config.hypervisor.backend,
        storage = ?config.hypervisor.storage,
        "Node daemon configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
