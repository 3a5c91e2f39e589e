//! Headless arbitrage engine.
//!
//! Boots from environment configuration, wires mock venues in simulation
//! mode, and runs the coordinator until ctrl-c. Live venue adapters plug in
//! through the same `ExchangeAdapter` port.

use anyhow::Result;
use perparb::application::coordinator::TradingCoordinator;
use perparb::config::Config;
use perparb::domain::ports::{ExchangeAdapter, LogAlerter};
use perparb::infrastructure::event_bus::EventBus;
use perparb::infrastructure::mock::simulated_venues;
use perparb::infrastructure::persistence::database::Database;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("perparb {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: exchanges={:?}, symbols={:?}, simulation={}",
        config.exchanges, config.symbols, config.simulation_mode
    );

    if !config.simulation_mode {
        anyhow::bail!(
            "live venue adapters are not wired in this build; set SIMULATION_MODE=true"
        );
    }

    let db = Database::new(&config.database_url).await?;
    let bus = Arc::new(EventBus::default());

    let mocks = simulated_venues(&config.exchanges);
    let mut sim_tasks = Vec::new();
    for venue in mocks.values() {
        sim_tasks.push(
            venue
                .clone()
                .spawn_simulated_rates(config.symbols.clone(), Duration::from_secs(10)),
        );
    }
    let mut exchanges: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
    for (name, venue) in &mocks {
        exchanges.insert(name.clone(), venue.clone());
    }

    // Let the simulated feeds publish a first round of rates.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let coordinator = TradingCoordinator::new(config, exchanges, db, bus, Arc::new(LogAlerter));

    // Log the event stream so a bare terminal shows engine activity.
    let mut events = coordinator.event_bus().subscribe();
    tokio::spawn(async move {
        while let Ok(envelope) = events.recv().await {
            if let Ok(json) = serde_json::to_string(&envelope) {
                info!("EVENT {}", json);
            }
        }
    });

    coordinator.clone().start().await?;
    info!("Engine running. Press Ctrl+C to shutdown.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");

    coordinator.stop().await;
    for task in sim_tasks {
        task.abort();
    }

    Ok(())
}
