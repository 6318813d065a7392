// Configuration for the market engine
//
// Values come from the process environment (optionally seeded from a .env file by main)
// and are validated before anything connects to the database.

use std::str::FromStr;
use std::time::Duration;

use validator::Validate;

use crate::error::{EngineError, EngineResult};
use crate::market::SupplyPolicy;

const DEFAULT_MAX_DB_CONNECTIONS: u32 = 5;
const DEFAULT_RESTOCK_INTERVAL_SECS: u64 = 300;
const DEFAULT_FULFILLMENT_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_UNITS_PER_LISTING: u32 = 100;
const DEFAULT_SLOW_RUN_THRESHOLD_MS: u64 = 1000;

/// Knobs that change allocation behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Validate)]
pub struct EngineSettings {
    /// Upper bound on units a buyer takes from one listing in one run.
    /// Guards against unbounded allocation when an effective price is zero.
    #[validate(range(
        min = 1,
        max = 100000,
        message = "MAX_UNITS_PER_LISTING must be between 1 and 100000"
    ))]
    pub max_units_per_listing: u32,

    /// Whether restock draws down supplier listing quantities
    pub restock_supply: SupplyPolicy,

    #[validate(range(min = 1, message = "SLOW_RUN_THRESHOLD_MS must be positive"))]
    pub slow_run_threshold_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_units_per_listing: DEFAULT_MAX_UNITS_PER_LISTING,
            restock_supply: SupplyPolicy::Unlimited,
            slow_run_threshold_ms: DEFAULT_SLOW_RUN_THRESHOLD_MS,
        }
    }
}

/// Process configuration
#[derive(Debug, Clone, Validate)]
pub struct AppConfig {
    #[validate(length(min = 1, message = "DATABASE_URL must not be empty"))]
    pub database_url: String,

    #[validate(range(min = 1, max = 100, message = "DB_MAX_CONNECTIONS must be between 1 and 100"))]
    pub max_db_connections: u32,

    #[validate(range(min = 1, message = "RESTOCK_INTERVAL_SECS must be positive"))]
    pub restock_interval_secs: u64,

    #[validate(range(min = 1, message = "FULFILLMENT_INTERVAL_SECS must be positive"))]
    pub fulfillment_interval_secs: u64,

    pub engine: EngineSettings,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    ///
    /// Empty values are treated as unset so defaults apply.
    pub fn from_lookup<F>(lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or_else(|| {
            EngineError::InvalidConfiguration("DATABASE_URL must be set in environment".to_string())
        })?;

        let config = Self {
            database_url,
            max_db_connections: parse_or(&get, "DB_MAX_CONNECTIONS", DEFAULT_MAX_DB_CONNECTIONS)?,
            restock_interval_secs: parse_or(
                &get,
                "RESTOCK_INTERVAL_SECS",
                DEFAULT_RESTOCK_INTERVAL_SECS,
            )?,
            fulfillment_interval_secs: parse_or(
                &get,
                "FULFILLMENT_INTERVAL_SECS",
                DEFAULT_FULFILLMENT_INTERVAL_SECS,
            )?,
            engine: EngineSettings {
                max_units_per_listing: parse_or(
                    &get,
                    "MAX_UNITS_PER_LISTING",
                    DEFAULT_MAX_UNITS_PER_LISTING,
                )?,
                restock_supply: parse_or(&get, "RESTOCK_SUPPLY_POLICY", SupplyPolicy::Unlimited)?,
                slow_run_threshold_ms: parse_or(
                    &get,
                    "SLOW_RUN_THRESHOLD_MS",
                    DEFAULT_SLOW_RUN_THRESHOLD_MS,
                )?,
            },
        };

        config.validate()?;
        config.engine.validate()?;

        Ok(config)
    }

    pub fn restock_interval(&self) -> Duration {
        Duration::from_secs(self.restock_interval_secs)
    }

    pub fn fulfillment_interval(&self) -> Duration {
        Duration::from_secs(self.fulfillment_interval_secs)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> EngineResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| {
            EngineError::InvalidConfiguration(format!("{} has invalid value '{}': {}", key, raw, e))
        }),
        None => Ok(default),
    }
}
