// Allocation Engine
//
// Greedy allocation of a buyer's budget over price-ranked candidates. One engine serves
// both cycles; the policy decides whether listing stock is a constraint (fulfillment,
// optional for restock) and how many units a buyer may take in a run.
//
// Unit counts are computed arithmetically rather than by looping purchase by purchase,
// and every allocation is clamped by `max_units_per_listing`, so a zero effective price
// cannot produce an unbounded allocation.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::market::pricing::PriceQuote;

/// Whether a seller's listing quantity limits what can be bought from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplyPolicy {
    /// Wholesale source treated as bottomless; listing quantity is neither checked nor decremented
    Unlimited,
    /// Each unit decrements the listing quantity, which must stay non-negative
    Finite,
}

impl SupplyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupplyPolicy::Unlimited => "unlimited",
            SupplyPolicy::Finite => "finite",
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, SupplyPolicy::Unlimited)
    }
}

impl fmt::Display for SupplyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SupplyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unlimited" => Ok(SupplyPolicy::Unlimited),
            "finite" => Ok(SupplyPolicy::Finite),
            _ => Err(format!("Invalid supply policy: {}", s)),
        }
    }
}

/// Limits applied while allocating for one buyer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationPolicy {
    pub supply: SupplyPolicy,
    pub max_units_per_listing: u32,
    /// `None` lets the budget alone decide
    pub max_units_per_buyer: Option<u32>,
}

impl AllocationPolicy {
    /// Multi-unit, multi-listing greedy restock
    pub fn restock(supply: SupplyPolicy, max_units_per_listing: u32) -> Self {
        Self {
            supply,
            max_units_per_listing,
            max_units_per_buyer: None,
        }
    }

    /// One stock-constrained unit per buyer per run
    pub fn fulfillment(max_units_per_listing: u32) -> Self {
        Self {
            supply: SupplyPolicy::Finite,
            max_units_per_listing,
            max_units_per_buyer: Some(1),
        }
    }
}

/// A selected listing annotated with its effective price for this buyer
#[derive(Debug, Clone)]
pub struct PricedCandidate {
    /// Position of the listing in the run's listing slice
    pub listing_index: usize,
    pub listing_id: i32,
    pub seller_id: i32,
    pub car_id: i32,
    pub quote: PriceQuote,
    /// Listing quantity at the time of pricing
    pub available: i32,
}

impl PricedCandidate {
    pub fn price(&self) -> Decimal {
        self.quote.effective_price
    }
}

/// Units taken from one listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub listing_index: usize,
    pub listing_id: i32,
    pub seller_id: i32,
    pub car_id: i32,
    pub unit_price: Decimal,
    pub units: u32,
    /// The per-listing unit cap cut this allocation short
    pub capped: bool,
}

impl Allocation {
    pub fn total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.units)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationOutcome {
    /// Nothing matched the buyer's criteria
    NoCandidates,
    /// The buyer cannot afford even the cheapest candidate
    InsufficientBalance { cheapest: Decimal },
    Allocated {
        allocations: Vec<Allocation>,
        spent: Decimal,
        remaining: Decimal,
    },
}

pub struct AllocationEngine {
    policy: AllocationPolicy,
}

impl AllocationEngine {
    pub fn new(policy: AllocationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    /// Sort candidates by effective price ascending
    ///
    /// The sort is stable, so equal prices keep discovery (listing id) order.
    pub fn rank(candidates: &mut [PricedCandidate]) {
        candidates.sort_by(|a, b| a.price().cmp(&b.price()));
    }

    /// Greedily spend `balance` over ranked candidates
    ///
    /// Walks candidates cheapest first, taking as many units of each as the budget and
    /// limits allow, and stops at the first candidate the remaining balance cannot cover.
    pub fn allocate(&self, ranked: &[PricedCandidate], balance: Decimal) -> AllocationOutcome {
        let cheapest = match ranked.iter().map(PricedCandidate::price).min() {
            Some(price) => price,
            None => return AllocationOutcome::NoCandidates,
        };

        if balance <= Decimal::ZERO {
            return AllocationOutcome::InsufficientBalance { cheapest };
        }

        let mut remaining = balance;
        let mut taken: u32 = 0;
        let mut allocations = Vec::new();

        for candidate in ranked {
            let buyer_room = match self.policy.max_units_per_buyer {
                Some(cap) if taken >= cap => break,
                Some(cap) => cap - taken,
                None => u32::MAX,
            };

            let price = candidate.price();
            if price > remaining {
                break;
            }

            let stock = match self.policy.supply {
                SupplyPolicy::Unlimited => u32::MAX,
                SupplyPolicy::Finite => candidate.available.max(0) as u32,
            };

            let uncapped = Self::affordable_units(remaining, price).min(stock).min(buyer_room);
            let units = uncapped.min(self.policy.max_units_per_listing);
            if units == 0 {
                continue;
            }

            let allocation = Allocation {
                listing_index: candidate.listing_index,
                listing_id: candidate.listing_id,
                seller_id: candidate.seller_id,
                car_id: candidate.car_id,
                unit_price: price,
                units,
                capped: units < uncapped,
            };

            remaining -= allocation.total();
            taken = taken.saturating_add(units);
            allocations.push(allocation);
        }

        if allocations.is_empty() {
            return AllocationOutcome::InsufficientBalance { cheapest };
        }

        AllocationOutcome::Allocated {
            allocations,
            spent: balance - remaining,
            remaining,
        }
    }

    /// Whole units of `price` that fit in `budget`; unbounded when the price is zero
    fn affordable_units(budget: Decimal, price: Decimal) -> u32 {
        if price <= Decimal::ZERO {
            return u32::MAX;
        }
        (budget / price).floor().to_u32().unwrap_or(u32::MAX)
    }
}
