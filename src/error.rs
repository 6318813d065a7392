// Error handling module for the market engine
// Provides the crate-wide error type and result alias

use thiserror::Error;

use crate::market::Cycle;

/// Main error type for the engine
///
/// Buyer-level variants (`MalformedCriteria`, `CalculationError`) are caught by the
/// orchestrator and only fail the buyer being processed. Everything else aborts the
/// run before anything is committed.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A buyer's specification or purchase order could not be interpreted
    #[error("Malformed criteria for buyer {buyer_id}: {reason}")]
    MalformedCriteria {
        buyer_id: i32,
        reason: String,
    },

    /// Another run of the same cycle currently holds the run lock
    #[error("A {0} run is already in progress")]
    RunInProgress(Cycle),

    /// Invalid or missing configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Decimal arithmetic overflowed or produced an invalid amount
    #[error("Calculation error: {0}")]
    CalculationError(String),

    /// Database operation errors
    /// Automatically converted from sqlx::Error
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Schema migration failures at start-up
    #[error("Migration error: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn malformed(buyer_id: i32, reason: impl Into<String>) -> Self {
        EngineError::MalformedCriteria {
            buyer_id,
            reason: reason.into(),
        }
    }

    /// True for errors that only invalidate a single buyer's processing
    pub fn is_buyer_scoped(&self) -> bool {
        matches!(
            self,
            EngineError::MalformedCriteria { .. } | EngineError::CalculationError(_)
        )
    }
}

impl From<validator::ValidationErrors> for EngineError {
    fn from(err: validator::ValidationErrors) -> Self {
        EngineError::InvalidConfiguration(err.to_string())
    }
}
