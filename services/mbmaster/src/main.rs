//! Modbus master gateway
//!
//! Restores the persisted connection tree, keeps every connection polling
//! until SIGINT/SIGTERM, then writes the tree back and stops all connections.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use mbmaster::cli::Args;
use mbmaster::core::config::AppConfig;
use mbmaster::core::gateway::Gateway;
use mbmaster::core::persistence::StateStore;
use mbmaster::core::transport::SimulatedBus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(args.config.as_deref(), &args.overrides())
        .context("Failed to load service configuration")?;
    let _log_guard = common::logging::init_with_config(config.log_config())
        .context("Failed to initialize logging")?;

    let store = StateStore::new(config.state.path.clone());
    let document = store
        .load()
        .with_context(|| format!("Failed to load {}", store.path().display()))?;

    if args.validate {
        document.validate().context("Connection tree is invalid")?;
        let devices: usize = document.connections.iter().map(|c| c.devices.len()).sum();
        info!(
            "Validation completed successfully: {} connections, {} devices",
            document.connections.len(),
            devices
        );
        return Ok(());
    }

    let bus = SimulatedBus::new();
    let gateway = Gateway::new(Arc::new(bus), config.reconnect);
    gateway.restore(document).await;
    info!("{} started", config.service.name);

    common::shutdown::wait_for_shutdown().await;
    info!("Shutting down");

    if config.state.save_on_exit {
        match gateway.records().await {
            Ok(document) => {
                if let Err(e) = store.save(&document) {
                    error!("Failed to save connection tree: {}", e);
                }
            },
            Err(e) => error!("Failed to capture connection tree: {}", e),
        }
    }
    gateway.shutdown().await;
    Ok(())
}
