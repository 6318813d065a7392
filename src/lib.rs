// Car marketplace matching and settlement engine
//
// Two periodic batch cycles share one pipeline:
// select candidates -> price -> greedily allocate -> settle -> bulk commit.
// - Restock: dealerships buy from suppliers against their standing specification
// - Fulfillment: customers buy one unit from dealership inventory per cycle

pub mod config;
pub mod db;
pub mod error;
pub mod market;
pub mod models;
pub mod scheduler;
pub mod store;

pub use config::{AppConfig, EngineSettings};
pub use error::{EngineError, EngineResult};
pub use market::{Cycle, Orchestrator, RunReport};
pub use store::{InMemoryStore, MarketSession, MarketplaceStore, PgMarketplaceStore};
