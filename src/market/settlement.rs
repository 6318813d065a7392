// Settlement Recorder
//
// Stages every write a run makes. Nothing touches the store until the orchestrator hands
// the finished ChangeSet to the session's commit, so a run either lands completely or
// not at all.
//
// Monetary and quantity entries are deltas rather than absolute values. Restock and
// fulfillment hold different run locks and both touch dealership balances and
// dealership inventory; applying deltas lets their commits interleave safely.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

use crate::market::Cycle;
use crate::models::SaleRecord;

/// Balance and distinct-buyer changes for one seller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SellerDelta {
    pub balance: Decimal,
    pub new_buyers: i32,
}

/// Units added to a dealership's stock of one car during restock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryDelta {
    /// Supplier that provided the most recent units
    pub supplier_id: i32,
    pub quantity: i32,
}

/// Everything a run writes, applied by the store in one transaction
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub cycle: Cycle,
    /// Balance delta per buyer (always a debit)
    pub buyer_balances: BTreeMap<i32, Decimal>,
    pub sellers: BTreeMap<i32, SellerDelta>,
    /// Quantity delta per listing id
    pub listing_quantities: BTreeMap<i32, i32>,
    /// Keyed by (dealership_id, car_id)
    pub inventory: BTreeMap<(i32, i32), InventoryDelta>,
    /// Purchase count increment keyed by (seller_id, buyer_id)
    pub loyalty: BTreeMap<(i32, i32), i32>,
    /// Customers whose purchase order was satisfied
    pub consumed_orders: BTreeSet<i32>,
    pub sales: Vec<SaleRecord>,
}

impl ChangeSet {
    pub fn new(cycle: Cycle) -> Self {
        Self {
            cycle,
            buyer_balances: BTreeMap::new(),
            sellers: BTreeMap::new(),
            listing_quantities: BTreeMap::new(),
            inventory: BTreeMap::new(),
            loyalty: BTreeMap::new(),
            consumed_orders: BTreeSet::new(),
            sales: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buyer_balances.is_empty()
            && self.sellers.is_empty()
            && self.listing_quantities.is_empty()
            && self.inventory.is_empty()
            && self.loyalty.is_empty()
            && self.consumed_orders.is_empty()
            && self.sales.is_empty()
    }

    pub fn debit_buyer(&mut self, buyer_id: i32, amount: Decimal) {
        *self.buyer_balances.entry(buyer_id).or_default() -= amount;
    }

    pub fn credit_seller(&mut self, seller_id: i32, amount: Decimal) {
        self.sellers.entry(seller_id).or_default().balance += amount;
    }

    pub fn take_stock(&mut self, listing_id: i32, units: i32) {
        *self.listing_quantities.entry(listing_id).or_default() -= units;
    }

    pub fn add_inventory(&mut self, dealership_id: i32, car_id: i32, supplier_id: i32, units: i32) {
        let entry = self.inventory.entry((dealership_id, car_id)).or_insert(InventoryDelta {
            supplier_id,
            quantity: 0,
        });
        entry.supplier_id = supplier_id;
        entry.quantity += units;
    }

    pub fn consume_order(&mut self, customer_id: i32) {
        self.consumed_orders.insert(customer_id);
    }

    /// Row counts as they will be written
    pub fn summary(&self) -> CommitSummary {
        CommitSummary {
            buyers_debited: self.buyer_balances.len(),
            sellers_credited: self.sellers.len(),
            listings_updated: self.listing_quantities.len(),
            inventory_rows: self.inventory.len(),
            ledger_rows: self.loyalty.len(),
            orders_cleared: self.consumed_orders.len(),
            sales_recorded: self.sales.len(),
        }
    }
}

/// What a commit wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub buyers_debited: usize,
    pub sellers_credited: usize,
    pub listings_updated: usize,
    pub inventory_rows: usize,
    pub ledger_rows: usize,
    pub orders_cleared: usize,
    pub sales_recorded: usize,
}

/// Ledger state after recording one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerUpdate {
    /// The buyer had no recorded purchases from this seller before this unit
    pub first_purchase: bool,
    /// Purchase count after this unit
    pub count: i32,
}

/// Tracks the loyalty ledger through a run and records each unit sold
pub struct SettlementRecorder {
    ledger: HashMap<(i32, i32), i32>,
    changes: ChangeSet,
}

impl SettlementRecorder {
    /// # Arguments
    /// * `cycle` - Cycle the recorded sales belong to
    /// * `ledger` - Purchase counts keyed by (seller_id, buyer_id) as loaded at run start
    pub fn new(cycle: Cycle, ledger: HashMap<(i32, i32), i32>) -> Self {
        Self {
            ledger,
            changes: ChangeSet::new(cycle),
        }
    }

    /// Current purchase count, `None` if the buyer has never bought from the seller
    pub fn purchase_count(&self, seller_id: i32, buyer_id: i32) -> Option<i32> {
        self.ledger.get(&(seller_id, buyer_id)).copied()
    }

    /// Record one unit sold
    ///
    /// Bumps the (seller, buyer) purchase count, counts the buyer towards the seller's
    /// distinct buyers when the count was zero and appends a sale record. Money and stock
    /// movements are staged separately by the caller.
    pub fn record(
        &mut self,
        seller_id: i32,
        buyer_id: i32,
        car_id: i32,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> LedgerUpdate {
        // a ledger row still at zero purchases has not been counted as a buyer yet
        let count = self.ledger.entry((seller_id, buyer_id)).or_insert(0);
        let first_purchase = *count == 0;
        *count += 1;
        let count = *count;

        if first_purchase {
            self.changes.sellers.entry(seller_id).or_default().new_buyers += 1;
        }
        *self.changes.loyalty.entry((seller_id, buyer_id)).or_default() += 1;

        self.changes.sales.push(SaleRecord {
            id: Uuid::new_v4(),
            seller_id,
            buyer_id,
            car_id,
            price,
            created_at: at,
        });

        LedgerUpdate { first_purchase, count }
    }

    pub fn changes_mut(&mut self) -> &mut ChangeSet {
        &mut self.changes
    }

    pub fn finish(self) -> ChangeSet {
        self.changes
    }
}
