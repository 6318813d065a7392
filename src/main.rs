use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use car_market_engine::db;
use car_market_engine::scheduler;
use car_market_engine::{AppConfig, Orchestrator, PgMarketplaceStore};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize tracing subscriber for logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    tracing::info!("Car market engine - Starting...");

    let config = AppConfig::from_env().expect("Invalid configuration");

    tracing::info!("Connecting to database...");
    let db_pool = db::create_pool(&config.database_url, config.max_db_connections)
        .await
        .expect("Failed to create database pool");

    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!(
        "Engine settings: max {} units per listing, restock supply {}",
        config.engine.max_units_per_listing,
        config.engine.restock_supply
    );

    let orchestrator = Arc::new(Orchestrator::new(PgMarketplaceStore::new(db_pool), config.engine));

    scheduler::run(orchestrator, config.restock_interval(), config.fulfillment_interval()).await;

    tracing::info!("Car market engine stopped");
}
