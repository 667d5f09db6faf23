//! orbit coordinator daemon
//!
//! Loads the fleet topology, starts the agent monitor and runs until
//! interrupted. Restarts go through the mock restarter until a real
//! process supervisor is wired in.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orbit_coordinator::{
    Config, Coordinator, FileTopology, MockRestarter, StaticTopology, TopologyProvider,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting orbit coordinator");
    info!(
        topology = ?config.topology_path,
        strategy = %config.strategy,
        check_interval_secs = config.check_interval_secs,
        "Configuration loaded"
    );

    let topology: Box<dyn TopologyProvider> = match &config.topology_path {
        Some(path) => Box::new(FileTopology::new(path)),
        None => Box::new(StaticTopology::default()),
    };

    let restarter = Arc::new(MockRestarter::new());
    let coordinator = Coordinator::bootstrap(&config, topology.as_ref(), restarter).await?;

    let monitor = coordinator.start_monitoring();

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    monitor.stop().await;

    info!("Coordinator stopped");
    Ok(())
}
