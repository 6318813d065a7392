// Market snapshot
//
// Everything a single run reads, loaded once at the start of the run. The orchestrator
// works on these in-memory copies and stages its writes in a ChangeSet.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::cmp::Reverse;
use std::collections::HashMap;

use crate::market::pricing::LoyaltySchedule;
use crate::market::Cycle;
use crate::models::{Car, Discount, UniqueCustomer};

/// Dealership (restock) or customer (fulfillment)
#[derive(Debug, Clone)]
pub struct Buyer {
    pub id: i32,
    pub balance: Decimal,
    /// Raw specification (restock) or purchase order (fulfillment)
    pub criteria: JsonValue,
    pub updated_at: DateTime<Utc>,
}

/// Supplier (restock) or dealership (fulfillment)
#[derive(Debug, Clone)]
pub struct Seller {
    pub id: i32,
    pub schedule: LoyaltySchedule,
}

/// Priced, quantity-tracked offer of a car
#[derive(Debug, Clone)]
pub struct Listing {
    pub id: i32,
    pub seller_id: i32,
    pub car: Car,
    pub price: Decimal,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub cycle: Cycle,
    pub as_of: DateTime<Utc>,
    /// In processing order
    pub buyers: Vec<Buyer>,
    pub sellers: HashMap<i32, Seller>,
    /// In primary key order
    pub listings: Vec<Listing>,
    /// Purchase counts keyed by (seller_id, buyer_id)
    pub loyalty: HashMap<(i32, i32), i32>,
    discounts: HashMap<(i32, i32), Discount>,
}

impl MarketSnapshot {
    /// Assemble a snapshot and normalise ordering
    ///
    /// Fulfillment serves the most recently updated customers first; restock walks
    /// dealerships in id order. Only discounts active at `as_of` are kept, and for a
    /// (seller, car) pair with several the lowest id wins.
    pub fn new(
        cycle: Cycle,
        as_of: DateTime<Utc>,
        mut buyers: Vec<Buyer>,
        sellers: Vec<Seller>,
        mut listings: Vec<Listing>,
        mut discounts: Vec<Discount>,
        loyalty: Vec<UniqueCustomer>,
    ) -> Self {
        match cycle {
            Cycle::Fulfillment => buyers.sort_by_key(|b| (Reverse(b.updated_at), b.id)),
            Cycle::Restock => buyers.sort_by_key(|b| b.id),
        }
        listings.sort_by_key(|l| l.id);

        discounts.sort_by_key(|d| d.id);
        let mut active = HashMap::new();
        for discount in discounts.into_iter().filter(|d| d.is_active_at(as_of)) {
            active.entry((discount.seller_id, discount.car_id)).or_insert(discount);
        }

        Self {
            cycle,
            as_of,
            buyers,
            sellers: sellers.into_iter().map(|s| (s.id, s)).collect(),
            listings,
            loyalty: loyalty
                .into_iter()
                .map(|row| ((row.seller_id, row.buyer_id), row.number_of_purchases))
                .collect(),
            discounts: active,
        }
    }

    /// Active item discount for a (seller, car) pair
    pub fn discount_for(&self, seller_id: i32, car_id: i32) -> Option<&Discount> {
        self.discounts.get(&(seller_id, car_id))
    }
}
