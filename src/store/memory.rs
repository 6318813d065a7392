// In-memory marketplace store
//
// Table maps behind a tokio mutex. Mirrors the Postgres backend's semantics: one run lock
// per cycle, snapshot reads, and an all-or-nothing commit of the change set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::market::{
    Buyer, ChangeSet, CommitSummary, Cycle, Listing, LoyaltySchedule, MarketSnapshot, Seller,
};
use crate::models::{
    blank_purchase_order, Car, Customer, Dealership, DealershipCar, Discount, SaleRecord, Supplier,
    SupplierCar, UniqueCustomer,
};
use crate::store::{MarketSession, MarketplaceStore};

/// Every table the engine reads or writes
#[derive(Debug, Clone, Default)]
pub struct MarketState {
    pub cars: BTreeMap<i32, Car>,
    pub suppliers: BTreeMap<i32, Supplier>,
    pub dealerships: BTreeMap<i32, Dealership>,
    pub customers: BTreeMap<i32, Customer>,
    pub supplier_cars: BTreeMap<i32, SupplierCar>,
    pub dealership_cars: BTreeMap<i32, DealershipCar>,
    pub supplier_discounts: BTreeMap<i32, Discount>,
    pub dealership_discounts: BTreeMap<i32, Discount>,
    /// Purchase counts keyed by (supplier_id, dealership_id)
    pub supplier_customers: BTreeMap<(i32, i32), i32>,
    /// Purchase counts keyed by (dealership_id, customer_id)
    pub dealership_customers: BTreeMap<(i32, i32), i32>,
    pub supplier_sales: Vec<SaleRecord>,
    pub dealership_sales: Vec<SaleRecord>,
    last_id: i32,
}

impl MarketState {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> i32 {
        self.last_id += 1;
        self.last_id
    }

    pub fn add_car(
        &mut self,
        model: &str,
        registration_year: i16,
        power: Decimal,
        transmission: &str,
        fuel: &str,
        drive_type: &str,
    ) -> i32 {
        let id = self.next_id();
        self.cars.insert(
            id,
            Car {
                id,
                model: model.to_string(),
                registration_year,
                power,
                transmission: transmission.to_string(),
                fuel: fuel.to_string(),
                drive_type: drive_type.to_string(),
            },
        );
        id
    }

    /// # Arguments
    /// * `discount` - Loyalty schedule `{"<threshold>": percent}`
    pub fn add_supplier(
        &mut self,
        company_name: &str,
        balance: Decimal,
        discount: JsonValue,
    ) -> i32 {
        let id = self.next_id();
        self.suppliers.insert(
            id,
            Supplier {
                id,
                company_name: company_name.to_string(),
                balance,
                discount,
                number_of_buyers: 0,
            },
        );
        id
    }

    pub fn add_dealership(
        &mut self,
        company_name: &str,
        balance: Decimal,
        specification: JsonValue,
    ) -> i32 {
        let id = self.next_id();
        self.dealerships.insert(
            id,
            Dealership {
                id,
                company_name: company_name.to_string(),
                balance,
                specification,
                discount: JsonValue::Object(Default::default()),
                number_of_buyers: 0,
                updated_at: Utc::now(),
            },
        );
        id
    }

    pub fn add_customer(&mut self, name: &str, balance: Decimal, purchase_order: JsonValue) -> i32 {
        let id = self.next_id();
        self.customers.insert(
            id,
            Customer {
                id,
                name: name.to_string(),
                balance,
                purchase_order,
                updated_at: Utc::now(),
            },
        );
        id
    }

    pub fn add_supplier_car(
        &mut self,
        supplier_id: i32,
        car_id: i32,
        price: Decimal,
        quantity: i32,
    ) -> i32 {
        let id = self.next_id();
        self.supplier_cars.insert(
            id,
            SupplierCar {
                id,
                supplier_id,
                car_id,
                price,
                quantity,
            },
        );
        id
    }

    pub fn add_dealership_car(
        &mut self,
        dealership_id: i32,
        car_id: i32,
        price: Decimal,
        quantity: i32,
    ) -> i32 {
        let id = self.next_id();
        self.dealership_cars.insert(
            id,
            DealershipCar {
                id,
                dealership_id,
                car_id,
                supplier_id: None,
                price,
                quantity,
            },
        );
        id
    }

    pub fn add_supplier_discount(
        &mut self,
        supplier_id: i32,
        car_id: i32,
        percent: Decimal,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> i32 {
        let id = self.next_id();
        self.supplier_discounts.insert(
            id,
            Discount {
                id,
                seller_id: supplier_id,
                car_id,
                percent,
                start_date,
                end_date,
            },
        );
        id
    }

    pub fn add_dealership_discount(
        &mut self,
        dealership_id: i32,
        car_id: i32,
        percent: Decimal,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> i32 {
        let id = self.next_id();
        self.dealership_discounts.insert(
            id,
            Discount {
                id,
                seller_id: dealership_id,
                car_id,
                percent,
                start_date,
                end_date,
            },
        );
        id
    }

    /// Dealership inventory row for a car, if any
    pub fn dealership_stock(&self, dealership_id: i32, car_id: i32) -> Option<&DealershipCar> {
        self.dealership_cars
            .values()
            .find(|row| row.dealership_id == dealership_id && row.car_id == car_id)
    }

    fn snapshot(&self, cycle: Cycle, as_of: DateTime<Utc>) -> MarketSnapshot {
        match cycle {
            Cycle::Restock => {
                let buyers = self
                    .dealerships
                    .values()
                    .map(|d| Buyer {
                        id: d.id,
                        balance: d.balance,
                        criteria: d.specification.clone(),
                        updated_at: d.updated_at,
                    })
                    .collect();
                let sellers = self
                    .suppliers
                    .values()
                    .map(|s| Seller {
                        id: s.id,
                        schedule: LoyaltySchedule::from_json(s.id, &s.discount),
                    })
                    .collect();
                let listings = self
                    .supplier_cars
                    .values()
                    .filter_map(|row| {
                        self.listing(row.id, row.supplier_id, row.car_id, row.price, row.quantity)
                    })
                    .collect();

                MarketSnapshot::new(
                    cycle,
                    as_of,
                    buyers,
                    sellers,
                    listings,
                    self.supplier_discounts.values().cloned().collect(),
                    ledger_rows(&self.supplier_customers),
                )
            }
            Cycle::Fulfillment => {
                let buyers = self
                    .customers
                    .values()
                    .map(|c| Buyer {
                        id: c.id,
                        balance: c.balance,
                        criteria: c.purchase_order.clone(),
                        updated_at: c.updated_at,
                    })
                    .collect();
                let sellers = self
                    .dealerships
                    .values()
                    .map(|d| Seller {
                        id: d.id,
                        schedule: LoyaltySchedule::from_json(d.id, &d.discount),
                    })
                    .collect();
                let listings = self
                    .dealership_cars
                    .values()
                    .filter_map(|row| {
                        self.listing(row.id, row.dealership_id, row.car_id, row.price, row.quantity)
                    })
                    .collect();

                MarketSnapshot::new(
                    cycle,
                    as_of,
                    buyers,
                    sellers,
                    listings,
                    self.dealership_discounts.values().cloned().collect(),
                    ledger_rows(&self.dealership_customers),
                )
            }
        }
    }

    fn listing(
        &self,
        id: i32,
        seller_id: i32,
        car_id: i32,
        price: Decimal,
        quantity: i32,
    ) -> Option<Listing> {
        match self.cars.get(&car_id) {
            Some(car) => Some(Listing {
                id,
                seller_id,
                car: car.clone(),
                price,
                quantity,
            }),
            None => {
                tracing::warn!("Listing {} references missing car {}", id, car_id);
                None
            }
        }
    }

    /// Apply a change set; leaves `self` untouched on error
    fn apply(&mut self, changes: &ChangeSet) -> EngineResult<()> {
        let mut next = self.clone();

        for (&id, &delta) in &changes.buyer_balances {
            let balance = match changes.cycle {
                Cycle::Restock => next.dealerships.get_mut(&id).map(|d| &mut d.balance),
                Cycle::Fulfillment => next.customers.get_mut(&id).map(|c| &mut c.balance),
            };
            *balance.ok_or_else(|| missing("buyer", id))? += delta;
        }

        for (&id, delta) in &changes.sellers {
            let (balance, buyers) = match changes.cycle {
                Cycle::Restock => next
                    .suppliers
                    .get_mut(&id)
                    .map(|s| (&mut s.balance, &mut s.number_of_buyers)),
                Cycle::Fulfillment => next
                    .dealerships
                    .get_mut(&id)
                    .map(|d| (&mut d.balance, &mut d.number_of_buyers)),
            }
            .ok_or_else(|| missing("seller", id))?;
            *balance += delta.balance;
            *buyers += delta.new_buyers;
        }

        for (&id, &delta) in &changes.listing_quantities {
            let quantity = match changes.cycle {
                Cycle::Restock => next.supplier_cars.get_mut(&id).map(|l| &mut l.quantity),
                Cycle::Fulfillment => next.dealership_cars.get_mut(&id).map(|l| &mut l.quantity),
            }
            .ok_or_else(|| missing("listing", id))?;
            *quantity += delta;
            if *quantity < 0 {
                return Err(EngineError::CalculationError(format!(
                    "listing {} quantity would become {}",
                    id, quantity
                )));
            }
        }

        for (&(dealership_id, car_id), delta) in &changes.inventory {
            let existing = next
                .dealership_cars
                .values_mut()
                .find(|row| row.dealership_id == dealership_id && row.car_id == car_id);
            match existing {
                Some(row) => {
                    row.quantity += delta.quantity;
                    row.supplier_id = Some(delta.supplier_id);
                }
                None => {
                    let id = next.next_id();
                    next.dealership_cars.insert(
                        id,
                        DealershipCar {
                            id,
                            dealership_id,
                            car_id,
                            supplier_id: Some(delta.supplier_id),
                            price: Decimal::ZERO,
                            quantity: delta.quantity,
                        },
                    );
                }
            }
        }

        let ledger = match changes.cycle {
            Cycle::Restock => &mut next.supplier_customers,
            Cycle::Fulfillment => &mut next.dealership_customers,
        };
        for (&key, &increment) in &changes.loyalty {
            *ledger.entry(key).or_insert(0) += increment;
        }

        for &id in &changes.consumed_orders {
            let customer = next.customers.get_mut(&id).ok_or_else(|| missing("customer", id))?;
            customer.purchase_order = blank_purchase_order();
        }

        match changes.cycle {
            Cycle::Restock => next.supplier_sales.extend(changes.sales.iter().cloned()),
            Cycle::Fulfillment => next.dealership_sales.extend(changes.sales.iter().cloned()),
        }

        *self = next;
        Ok(())
    }
}

fn ledger_rows(ledger: &BTreeMap<(i32, i32), i32>) -> Vec<UniqueCustomer> {
    ledger
        .iter()
        .map(|(&(seller_id, buyer_id), &number_of_purchases)| UniqueCustomer {
            seller_id,
            buyer_id,
            number_of_purchases,
        })
        .collect()
}

fn missing(what: &str, id: i32) -> EngineError {
    EngineError::CalculationError(format!("{} {} does not exist", what, id))
}

/// Shared in-memory store; clones see the same state
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MarketState>>,
    restock_running: Arc<AtomicBool>,
    fulfillment_running: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new(state: MarketState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            ..Self::default()
        }
    }

    /// Inspect the current state
    pub async fn read<R>(&self, f: impl FnOnce(&MarketState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    /// Mutate the state directly, outside any run
    pub async fn write<R>(&self, f: impl FnOnce(&mut MarketState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    fn flag(&self, cycle: Cycle) -> &Arc<AtomicBool> {
        match cycle {
            Cycle::Restock => &self.restock_running,
            Cycle::Fulfillment => &self.fulfillment_running,
        }
    }
}

#[async_trait]
impl MarketplaceStore for InMemoryStore {
    type Session = MemorySession;

    async fn begin(&self, cycle: Cycle) -> EngineResult<MemorySession> {
        let flag = self.flag(cycle);
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::RunInProgress(cycle));
        }

        Ok(MemorySession {
            state: Arc::clone(&self.state),
            cycle,
            _lock: RunLock { flag: Arc::clone(flag) },
        })
    }
}

/// Releases the cycle flag when the session ends, committed or not
#[derive(Debug)]
struct RunLock {
    flag: Arc<AtomicBool>,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct MemorySession {
    state: Arc<Mutex<MarketState>>,
    cycle: Cycle,
    _lock: RunLock,
}

#[async_trait]
impl MarketSession for MemorySession {
    async fn load_snapshot(&mut self, as_of: DateTime<Utc>) -> EngineResult<MarketSnapshot> {
        let state = self.state.lock().await;
        Ok(state.snapshot(self.cycle, as_of))
    }

    async fn commit(self, changes: ChangeSet) -> EngineResult<CommitSummary> {
        let summary = changes.summary();
        if changes.is_empty() {
            return Ok(summary);
        }

        let mut state = self.state.lock().await;
        state.apply(&changes)?;
        tracing::debug!("Committed {} change set: {:?}", self.cycle, summary);
        Ok(summary)
    }
}
