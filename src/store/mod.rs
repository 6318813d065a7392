// Data store contract
//
// A run talks to storage through one session: claim the cycle's run lock, read the
// snapshot, commit the change set. Two backends implement it:
// - postgres: sqlx transaction plus an advisory lock per cycle
// - memory: table maps behind a tokio mutex, used by tests and local runs

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryStore, MarketState};
pub use postgres::PgMarketplaceStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::EngineResult;
use crate::market::{ChangeSet, CommitSummary, Cycle, MarketSnapshot};

/// Source of run sessions
#[async_trait]
pub trait MarketplaceStore: Send + Sync {
    type Session: MarketSession;

    /// Open a session holding the run lock for `cycle`
    ///
    /// Fails with `EngineError::RunInProgress` while another session for the same
    /// cycle is open.
    async fn begin(&self, cycle: Cycle) -> EngineResult<Self::Session>;
}

/// One run's view of the store
///
/// Dropping a session without calling `commit` persists nothing and releases the lock.
#[async_trait]
pub trait MarketSession: Send {
    /// Read every row the session's cycle needs
    async fn load_snapshot(&mut self, as_of: DateTime<Utc>) -> EngineResult<MarketSnapshot>;

    /// Apply all staged changes atomically and release the run lock
    async fn commit(self, changes: ChangeSet) -> EngineResult<CommitSummary>;
}
