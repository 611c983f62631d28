//! Main entry point for a steward world.
//!
//! Starts a single coordinator with configuration from environment
//! variables, backed by the in-memory persistence. Production deployments
//! substitute a durable `Persistence` implementation.

use steward::{Config, Coordinator, InProcessConnector, MemoryPersistence, Persistence};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    steward::observability::init_tracing();

    info!("Starting steward world");

    let config = Config::from_env()?;
    info!(?config, "Loaded configuration");

    let persistence = MemoryPersistence::new();
    let connector = InProcessConnector::new();

    let mut coordinator = Coordinator::new(
        config.coordinator_config(),
        persistence.clone_box(),
        Box::new(connector),
    );
    coordinator.start().await?;

    info!("Steward world started, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    coordinator.stop().await;

    Ok(())
}
