// Market engine module
//
// The matching and settlement core shared by the two batch cycles:
// - criteria: lenient parsing of specifications and purchase orders
// - pricing: effective price from item and loyalty discounts
// - selector: candidate listings for a buyer
// - allocation: greedy budget/stock constrained allocation
// - settlement: loyalty ledger, sale history and the staged change set
// - orchestrator: per-run iteration over buyers and the single commit

pub mod allocation;
pub mod criteria;
pub mod metrics;
pub mod orchestrator;
pub mod pricing;
pub mod selector;
pub mod settlement;
pub mod snapshot;

pub use allocation::{
    Allocation, AllocationEngine, AllocationOutcome, AllocationPolicy, PricedCandidate,
    SupplyPolicy,
};
pub use criteria::{PurchaseOrder, Specification};
pub use metrics::EngineMetrics;
pub use orchestrator::{BuyerOutcome, Orchestrator, RunReport, SkipReason};
pub use pricing::{AppliedDiscount, LoyaltySchedule, LoyaltyTier, PriceQuote, PricingCalculator};
pub use selector::CandidateSelector;
pub use settlement::{
    ChangeSet, CommitSummary, InventoryDelta, LedgerUpdate, SellerDelta, SettlementRecorder,
};
pub use snapshot::{Buyer, Listing, MarketSnapshot, Seller};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two batch jobs
///
/// Each cycle also fixes the market it works on: restock is supplier -> dealership,
/// fulfillment is dealership -> customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cycle {
    Restock,
    Fulfillment,
}

impl Cycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cycle::Restock => "restock",
            Cycle::Fulfillment => "fulfillment",
        }
    }

    /// Postgres advisory lock key held for the duration of a run
    pub fn lock_key(&self) -> i64 {
        match self {
            Cycle::Restock => 0x4d4b_5452_0001,
            Cycle::Fulfillment => 0x4d4b_5452_0002,
        }
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests;
