// Matching Orchestrator
//
// Runs one cycle end to end: claim the cycle's run lock, load a snapshot, walk buyers in
// processing order through select -> price -> rank -> allocate -> settle, then commit
// every staged write at once. A buyer whose criteria or pricing fails is logged and
// skipped; the run carries on with the next buyer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::market::allocation::{
    AllocationEngine, AllocationOutcome, AllocationPolicy, PricedCandidate, SupplyPolicy,
};
use crate::market::criteria::{PurchaseOrder, Specification};
use crate::market::metrics::EngineMetrics;
use crate::market::pricing::{LoyaltySchedule, PricingCalculator};
use crate::market::selector::CandidateSelector;
use crate::market::settlement::{ChangeSet, CommitSummary, SettlementRecorder};
use crate::market::snapshot::{Buyer, MarketSnapshot};
use crate::market::Cycle;
use crate::store::{MarketSession, MarketplaceStore};

/// Why a buyer bought nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NonPositiveBalance,
    /// Customer has no standing purchase order
    NoOrder,
    NoCandidates,
    InsufficientBalance,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::NonPositiveBalance => "balance is not positive",
            SkipReason::NoOrder => "no standing order",
            SkipReason::NoCandidates => "no matching listing",
            SkipReason::InsufficientBalance => "cannot afford the cheapest match",
        };
        write!(f, "{}", text)
    }
}

/// What happened to one buyer in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuyerOutcome {
    Purchased {
        buyer_id: i32,
        units: u32,
        spent: Decimal,
        capped: bool,
    },
    Skipped {
        buyer_id: i32,
        reason: SkipReason,
    },
    Failed {
        buyer_id: i32,
        error: String,
    },
}

impl BuyerOutcome {
    pub fn buyer_id(&self) -> i32 {
        match self {
            BuyerOutcome::Purchased { buyer_id, .. }
            | BuyerOutcome::Skipped { buyer_id, .. }
            | BuyerOutcome::Failed { buyer_id, .. } => *buyer_id,
        }
    }
}

/// Summary of one committed run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub cycle: Cycle,
    pub as_of: DateTime<Utc>,
    pub buyers_seen: usize,
    pub buyers_served: usize,
    pub buyers_skipped: usize,
    pub buyers_failed: usize,
    pub units_sold: u64,
    pub amount_settled: Decimal,
    /// Buyers with at least one allocation cut short by the per-listing unit cap
    pub capped_allocations: usize,
    pub commit: CommitSummary,
    pub outcomes: Vec<BuyerOutcome>,
}

impl RunReport {
    pub fn outcome_for(&self, buyer_id: i32) -> Option<&BuyerOutcome> {
        self.outcomes.iter().find(|outcome| outcome.buyer_id() == buyer_id)
    }
}

/// Entry point for both cycles
pub struct Orchestrator<S: MarketplaceStore> {
    store: S,
    settings: EngineSettings,
    metrics: EngineMetrics,
}

impl<S: MarketplaceStore> Orchestrator<S> {
    pub fn new(store: S, settings: EngineSettings) -> Self {
        Self {
            store,
            settings,
            metrics: EngineMetrics::new(Duration::from_millis(settings.slow_run_threshold_ms)),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Dealerships buy from suppliers against their standing specification
    pub async fn run_restock_cycle(&self) -> EngineResult<RunReport> {
        self.run_cycle_at(Cycle::Restock, Utc::now()).await
    }

    /// Customers buy at most one unit each from dealership inventory
    pub async fn run_fulfillment_cycle(&self) -> EngineResult<RunReport> {
        self.run_cycle_at(Cycle::Fulfillment, Utc::now()).await
    }

    /// Run a cycle as if the current time were `as_of`
    ///
    /// `as_of` decides which discounts are active and stamps every sale record.
    pub async fn run_cycle_at(
        &self,
        cycle: Cycle,
        as_of: DateTime<Utc>,
    ) -> EngineResult<RunReport> {
        let _timer = self.metrics.start_run(cycle);
        tracing::info!("Starting {} run as of {}", cycle, as_of);

        let result = self.execute(cycle, as_of).await;
        match &result {
            Ok(report) => {
                self.metrics.record_report(report);
                tracing::info!(
                    "{} run committed: {} buyers seen, {} served, {} skipped, {} failed, \
                     {} units, {} settled",
                    cycle,
                    report.buyers_seen,
                    report.buyers_served,
                    report.buyers_skipped,
                    report.buyers_failed,
                    report.units_sold,
                    report.amount_settled
                );
            }
            Err(EngineError::RunInProgress(_)) => self.metrics.record_conflict(cycle),
            Err(e) => {
                self.metrics.record_failure(cycle);
                tracing::error!("{} run aborted, nothing committed: {}", cycle, e);
            }
        }

        result
    }

    async fn execute(&self, cycle: Cycle, as_of: DateTime<Utc>) -> EngineResult<RunReport> {
        let mut session = self.store.begin(cycle).await?;
        let snapshot = session.load_snapshot(as_of).await?;

        let policy = match cycle {
            Cycle::Restock => AllocationPolicy::restock(
                self.settings.restock_supply,
                self.settings.max_units_per_listing,
            ),
            Cycle::Fulfillment => {
                AllocationPolicy::fulfillment(self.settings.max_units_per_listing)
            }
        };

        let mut book = MarketBook::new(snapshot, policy);
        let outcomes = book.process_all()?;
        let changes = book.finish();

        let amount_settled = changes.sales.iter().map(|sale| sale.price).sum();
        let units_sold = changes.sales.len() as u64;

        let commit = session.commit(changes).await?;

        let count = |pred: fn(&BuyerOutcome) -> bool| outcomes.iter().filter(|o| pred(o)).count();
        Ok(RunReport {
            cycle,
            as_of,
            buyers_seen: outcomes.len(),
            buyers_served: count(|o| matches!(o, BuyerOutcome::Purchased { .. })),
            buyers_skipped: count(|o| matches!(o, BuyerOutcome::Skipped { .. })),
            buyers_failed: count(|o| matches!(o, BuyerOutcome::Failed { .. })),
            units_sold,
            amount_settled,
            capped_allocations: capped_count(&outcomes),
            commit,
            outcomes,
        })
    }
}

fn capped_count(outcomes: &[BuyerOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o, BuyerOutcome::Purchased { capped: true, .. }))
        .count()
}

/// Run-local working state: the snapshot's listings with live quantities plus the recorder
struct MarketBook {
    snapshot: MarketSnapshot,
    engine: AllocationEngine,
    recorder: SettlementRecorder,
}

impl MarketBook {
    fn new(mut snapshot: MarketSnapshot, policy: AllocationPolicy) -> Self {
        let ledger = std::mem::take(&mut snapshot.loyalty);
        let recorder = SettlementRecorder::new(snapshot.cycle, ledger);
        Self {
            snapshot,
            engine: AllocationEngine::new(policy),
            recorder,
        }
    }

    fn process_all(&mut self) -> EngineResult<Vec<BuyerOutcome>> {
        let buyers = std::mem::take(&mut self.snapshot.buyers);
        let mut outcomes = Vec::with_capacity(buyers.len());

        for buyer in &buyers {
            let outcome = match self.process(buyer) {
                Ok(outcome) => outcome,
                Err(e) if e.is_buyer_scoped() => {
                    tracing::warn!("Skipping {} buyer {}: {}", self.snapshot.cycle, buyer.id, e);
                    BuyerOutcome::Failed {
                        buyer_id: buyer.id,
                        error: e.to_string(),
                    }
                }
                Err(e) => return Err(e),
            };

            if let BuyerOutcome::Skipped { buyer_id, reason } = &outcome {
                tracing::debug!("{} buyer {} skipped: {}", self.snapshot.cycle, buyer_id, reason);
            }
            outcomes.push(outcome);
        }

        self.snapshot.buyers = buyers;
        Ok(outcomes)
    }

    fn process(&mut self, buyer: &Buyer) -> EngineResult<BuyerOutcome> {
        if buyer.balance <= Decimal::ZERO {
            return Ok(skipped(buyer, SkipReason::NonPositiveBalance));
        }

        let indices = match self.snapshot.cycle {
            Cycle::Restock => {
                let spec = Specification::parse(buyer.id, &buyer.criteria)?;
                CandidateSelector::restock_candidates(
                    &spec,
                    &self.snapshot.listings,
                    self.engine.policy().supply,
                )
            }
            Cycle::Fulfillment => match PurchaseOrder::parse(buyer.id, &buyer.criteria)? {
                Some(order) => {
                    CandidateSelector::fulfillment_candidates(&order, &self.snapshot.listings)
                }
                None => return Ok(skipped(buyer, SkipReason::NoOrder)),
            },
        };

        let mut candidates = self.price(buyer.id, &indices)?;
        AllocationEngine::rank(&mut candidates);

        match self.engine.allocate(&candidates, buyer.balance) {
            AllocationOutcome::NoCandidates => Ok(skipped(buyer, SkipReason::NoCandidates)),
            AllocationOutcome::InsufficientBalance { cheapest } => {
                tracing::debug!(
                    "{} buyer {} balance {} below cheapest match {}",
                    self.snapshot.cycle,
                    buyer.id,
                    buyer.balance,
                    cheapest
                );
                Ok(skipped(buyer, SkipReason::InsufficientBalance))
            }
            AllocationOutcome::Allocated { allocations, spent, .. } => {
                let mut units = 0u32;
                let mut capped = false;

                for allocation in &allocations {
                    if allocation.capped {
                        tracing::warn!(
                            "{} buyer {} hit the unit cap on listing {} at price {}",
                            self.snapshot.cycle,
                            buyer.id,
                            allocation.listing_id,
                            allocation.unit_price
                        );
                    }
                    self.settle(
                        buyer.id,
                        allocation.listing_index,
                        allocation.units,
                        allocation.unit_price,
                    );
                    units += allocation.units;
                    capped |= allocation.capped;
                }

                self.recorder.changes_mut().debit_buyer(buyer.id, spent);
                if self.snapshot.cycle == Cycle::Fulfillment {
                    self.recorder.changes_mut().consume_order(buyer.id);
                }

                Ok(BuyerOutcome::Purchased {
                    buyer_id: buyer.id,
                    units,
                    spent,
                    capped,
                })
            }
        }
    }

    /// Quote every candidate listing for this buyer
    fn price(&self, buyer_id: i32, indices: &[usize]) -> EngineResult<Vec<PricedCandidate>> {
        let no_schedule = LoyaltySchedule::empty();

        indices
            .iter()
            .map(|&index| {
                let listing = &self.snapshot.listings[index];
                let schedule = self
                    .snapshot
                    .sellers
                    .get(&listing.seller_id)
                    .map_or(&no_schedule, |seller| &seller.schedule);

                let quote = PricingCalculator::quote(
                    listing.price,
                    self.snapshot.discount_for(listing.seller_id, listing.car.id),
                    self.recorder.purchase_count(listing.seller_id, buyer_id),
                    schedule,
                )?;

                Ok(PricedCandidate {
                    listing_index: index,
                    listing_id: listing.id,
                    seller_id: listing.seller_id,
                    car_id: listing.car.id,
                    quote,
                    available: listing.quantity,
                })
            })
            .collect()
    }

    /// Stage the money, stock and ledger movements for `units` bought from one listing
    fn settle(&mut self, buyer_id: i32, listing_index: usize, units: u32, unit_price: Decimal) {
        let cycle = self.snapshot.cycle;
        let as_of = self.snapshot.as_of;
        let finite = self.engine.policy().supply == SupplyPolicy::Finite;

        let listing = &mut self.snapshot.listings[listing_index];
        let (listing_id, seller_id, car_id) = (listing.id, listing.seller_id, listing.car.id);
        let units_i32 = i32::try_from(units).unwrap_or(i32::MAX);
        if finite {
            listing.quantity -= units_i32;
        }

        let changes: &mut ChangeSet = self.recorder.changes_mut();
        changes.credit_seller(seller_id, unit_price * Decimal::from(units));
        if finite {
            changes.take_stock(listing_id, units_i32);
        }
        if cycle == Cycle::Restock {
            changes.add_inventory(buyer_id, car_id, seller_id, units_i32);
        }

        for _ in 0..units {
            let update = self.recorder.record(seller_id, buyer_id, car_id, unit_price, as_of);
            if update.first_purchase {
                tracing::debug!(
                    "{} buyer {} is a new customer of seller {}",
                    cycle,
                    buyer_id,
                    seller_id
                );
            }
        }
    }

    fn finish(self) -> ChangeSet {
        self.recorder.finish()
    }
}

fn skipped(buyer: &Buyer, reason: SkipReason) -> BuyerOutcome {
    BuyerOutcome::Skipped {
        buyer_id: buyer.id,
        reason,
    }
}
