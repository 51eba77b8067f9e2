use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use toio_control_server::config::{self, Cli};
use toio_control_server::fleet::FleetOrchestrator;
use toio_control_server::gateway::UiGateway;
use toio_control_server::logging::init_logging;
use toio_control_server::registry::CubeRegistry;
use toio_control_server::relay::manager::RelayManager;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config_path = config::resolve_config_path(cli.config.as_deref());
    let config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(target: "control_server", error = %err, "configuration rejected");
            return Err(err.into());
        }
    };

    let registry = Arc::new(CubeRegistry::new(&config));
    let fleet = Arc::new(FleetOrchestrator::new(Arc::clone(&registry)));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let manager = RelayManager::new(&config, Arc::clone(&registry), events_tx)
        .context("building relay manager")?;
    let gateway = UiGateway::new(
        Arc::clone(&registry),
        Arc::clone(&manager),
        fleet,
        config.field,
    );
    tokio::spawn(gateway.clone().run(events_rx));

    manager.start();

    let bind_addr = format!("{}:{}", config.ui.host, config.ui.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind UI server on {bind_addr}"))?;
    info!(
        target: "control_server",
        addr = %bind_addr,
        relays = config.relays.len(),
        "UI server listening"
    );

    axum::serve(listener, gateway.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("UI server failed")?;

    info!(target: "control_server", "shutting down");
    manager.stop();
    gateway.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
