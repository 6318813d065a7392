// Postgres marketplace store
//
// Each run is one transaction. The run lock is a transaction-scoped advisory lock keyed
// by cycle, so it is released by commit, rollback or a dropped connection alike.
// Writes are applied with one UNNEST-based statement per mutated table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::fmt;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::market::{
    Buyer, ChangeSet, CommitSummary, Cycle, Listing, LoyaltySchedule, MarketSnapshot, Seller,
};
use crate::models::{Car, Discount, UniqueCustomer};
use crate::store::{MarketSession, MarketplaceStore};

/// Table and column names that differ between the two markets
struct MarketTables {
    buyers: &'static str,
    buyer_criteria: &'static str,
    sellers: &'static str,
    listings: &'static str,
    listing_seller: &'static str,
    discounts: &'static str,
    ledger: &'static str,
    ledger_seller: &'static str,
    ledger_buyer: &'static str,
    sales: &'static str,
}

const RESTOCK_TABLES: MarketTables = MarketTables {
    buyers: "dealerships",
    buyer_criteria: "specification",
    sellers: "suppliers",
    listings: "supplier_cars",
    listing_seller: "supplier_id",
    discounts: "supplier_discounts",
    ledger: "supplier_unique_customers",
    ledger_seller: "supplier_id",
    ledger_buyer: "dealership_id",
    sales: "supplier_dealership_sales",
};

const FULFILLMENT_TABLES: MarketTables = MarketTables {
    buyers: "customers",
    buyer_criteria: "purchase_order",
    sellers: "dealerships",
    listings: "dealership_cars",
    listing_seller: "dealership_id",
    discounts: "dealership_discounts",
    ledger: "dealership_unique_customers",
    ledger_seller: "dealership_id",
    ledger_buyer: "customer_id",
    sales: "dealership_customer_sales",
};

fn tables(cycle: Cycle) -> &'static MarketTables {
    match cycle {
        Cycle::Restock => &RESTOCK_TABLES,
        Cycle::Fulfillment => &FULFILLMENT_TABLES,
    }
}

#[derive(FromRow)]
struct BuyerRow {
    id: i32,
    balance: Decimal,
    criteria: JsonValue,
    updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct SellerRow {
    id: i32,
    discount: JsonValue,
}

#[derive(FromRow)]
struct ListingRow {
    id: i32,
    seller_id: i32,
    price: Decimal,
    quantity: i32,
    car_id: i32,
    model: String,
    registration_year: i16,
    power: Decimal,
    transmission: String,
    fuel: String,
    drive_type: String,
}

impl From<ListingRow> for Listing {
    fn from(row: ListingRow) -> Self {
        Listing {
            id: row.id,
            seller_id: row.seller_id,
            price: row.price,
            quantity: row.quantity,
            car: Car {
                id: row.car_id,
                model: row.model,
                registration_year: row.registration_year,
                power: row.power,
                transmission: row.transmission,
                fuel: row.fuel,
                drive_type: row.drive_type,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgMarketplaceStore {
    pool: PgPool,
}

impl PgMarketplaceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MarketplaceStore for PgMarketplaceStore {
    type Session = PgSession;

    async fn begin(&self, cycle: Cycle) -> EngineResult<PgSession> {
        let mut tx = self.pool.begin().await?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(cycle.lock_key())
            .fetch_one(&mut *tx)
            .await?;

        if !acquired {
            tx.rollback().await?;
            return Err(EngineError::RunInProgress(cycle));
        }

        tracing::debug!("Acquired {} run lock", cycle);
        Ok(PgSession { tx, cycle })
    }
}

/// One run's transaction
pub struct PgSession {
    tx: Transaction<'static, Postgres>,
    cycle: Cycle,
}

impl fmt::Debug for PgSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgSession")
            .field("cycle", &self.cycle)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MarketSession for PgSession {
    async fn load_snapshot(&mut self, as_of: DateTime<Utc>) -> EngineResult<MarketSnapshot> {
        let t = tables(self.cycle);

        let buyers: Vec<BuyerRow> = sqlx::query_as(&format!(
            "SELECT id, balance, {} AS criteria, updated_at FROM {}",
            t.buyer_criteria, t.buyers
        ))
        .fetch_all(&mut *self.tx)
        .await?;

        let sellers: Vec<SellerRow> = sqlx::query_as(&format!(
            "SELECT id, discount FROM {}",
            t.sellers
        ))
        .fetch_all(&mut *self.tx)
        .await?;

        let listings: Vec<ListingRow> = sqlx::query_as(&format!(
            r#"
            SELECT l.id, l.{seller} AS seller_id, l.price, l.quantity,
                   c.id AS car_id, c.model, c.registration_year, c.power,
                   c.transmission, c.fuel, c.drive_type
            FROM {listings} l
            JOIN cars c ON c.id = l.car_id
            "#,
            seller = t.listing_seller,
            listings = t.listings
        ))
        .fetch_all(&mut *self.tx)
        .await?;

        let discounts: Vec<Discount> = sqlx::query_as(&format!(
            r#"
            SELECT id, {seller} AS seller_id, car_id, percent, start_date, end_date
            FROM {discounts}
            WHERE start_date <= $1 AND end_date >= $1
            "#,
            seller = t.listing_seller,
            discounts = t.discounts
        ))
        .bind(as_of)
        .fetch_all(&mut *self.tx)
        .await?;

        let loyalty: Vec<UniqueCustomer> = sqlx::query_as(&format!(
            "SELECT {} AS seller_id, {} AS buyer_id, number_of_purchases FROM {}",
            t.ledger_seller, t.ledger_buyer, t.ledger
        ))
        .fetch_all(&mut *self.tx)
        .await?;

        tracing::debug!(
            "Loaded {} snapshot: {} buyers, {} sellers, {} listings, {} active discounts",
            self.cycle,
            buyers.len(),
            sellers.len(),
            listings.len(),
            discounts.len()
        );

        let buyers = buyers
            .into_iter()
            .map(|row| Buyer {
                id: row.id,
                balance: row.balance,
                criteria: row.criteria,
                updated_at: row.updated_at,
            })
            .collect();
        let sellers = sellers
            .into_iter()
            .map(|row| Seller {
                id: row.id,
                schedule: LoyaltySchedule::from_json(row.id, &row.discount),
            })
            .collect();

        Ok(MarketSnapshot::new(
            self.cycle,
            as_of,
            buyers,
            sellers,
            listings.into_iter().map(Listing::from).collect(),
            discounts,
            loyalty,
        ))
    }

    async fn commit(mut self, changes: ChangeSet) -> EngineResult<CommitSummary> {
        let t = tables(self.cycle);
        let summary = changes.summary();

        if !changes.buyer_balances.is_empty() {
            let (ids, deltas): (Vec<i32>, Vec<Decimal>) = changes
                .buyer_balances
                .iter()
                .map(|(id, d)| (*id, *d))
                .unzip();
            sqlx::query(&format!(
                r#"
                UPDATE {buyers} AS t
                SET balance = t.balance + d.delta
                FROM UNNEST($1::int4[], $2::numeric[]) AS d(id, delta)
                WHERE t.id = d.id
                "#,
                buyers = t.buyers
            ))
            .bind(&ids)
            .bind(&deltas)
            .execute(&mut *self.tx)
            .await?;
        }

        if !changes.sellers.is_empty() {
            let mut ids = Vec::with_capacity(changes.sellers.len());
            let mut deltas = Vec::with_capacity(changes.sellers.len());
            let mut new_buyers = Vec::with_capacity(changes.sellers.len());
            for (id, delta) in &changes.sellers {
                ids.push(*id);
                deltas.push(delta.balance);
                new_buyers.push(delta.new_buyers);
            }
            sqlx::query(&format!(
                r#"
                UPDATE {sellers} AS t
                SET balance = t.balance + d.delta,
                    number_of_buyers = t.number_of_buyers + d.new_buyers
                FROM UNNEST($1::int4[], $2::numeric[], $3::int4[]) AS d(id, delta, new_buyers)
                WHERE t.id = d.id
                "#,
                sellers = t.sellers
            ))
            .bind(&ids)
            .bind(&deltas)
            .bind(&new_buyers)
            .execute(&mut *self.tx)
            .await?;
        }

        if !changes.listing_quantities.is_empty() {
            let (ids, deltas): (Vec<i32>, Vec<i32>) = changes
                .listing_quantities
                .iter()
                .map(|(id, d)| (*id, *d))
                .unzip();
            sqlx::query(&format!(
                r#"
                UPDATE {listings} AS t
                SET quantity = t.quantity + d.delta
                FROM UNNEST($1::int4[], $2::int4[]) AS d(id, delta)
                WHERE t.id = d.id
                "#,
                listings = t.listings
            ))
            .bind(&ids)
            .bind(&deltas)
            .execute(&mut *self.tx)
            .await?;
        }

        if !changes.inventory.is_empty() {
            let mut dealership_ids = Vec::with_capacity(changes.inventory.len());
            let mut car_ids = Vec::with_capacity(changes.inventory.len());
            let mut supplier_ids = Vec::with_capacity(changes.inventory.len());
            let mut quantities = Vec::with_capacity(changes.inventory.len());
            for ((dealership_id, car_id), delta) in &changes.inventory {
                dealership_ids.push(*dealership_id);
                car_ids.push(*car_id);
                supplier_ids.push(delta.supplier_id);
                quantities.push(delta.quantity);
            }
            sqlx::query(
                r#"
                INSERT INTO dealership_cars (dealership_id, car_id, supplier_id, price, quantity)
                SELECT d.dealership_id, d.car_id, d.supplier_id, 0, d.quantity
                FROM UNNEST($1::int4[], $2::int4[], $3::int4[], $4::int4[])
                     AS d(dealership_id, car_id, supplier_id, quantity)
                ON CONFLICT (dealership_id, car_id)
                DO UPDATE SET
                    quantity = dealership_cars.quantity + EXCLUDED.quantity,
                    supplier_id = EXCLUDED.supplier_id
                "#,
            )
            .bind(&dealership_ids)
            .bind(&car_ids)
            .bind(&supplier_ids)
            .bind(&quantities)
            .execute(&mut *self.tx)
            .await?;
        }

        if !changes.loyalty.is_empty() {
            let mut seller_ids = Vec::with_capacity(changes.loyalty.len());
            let mut buyer_ids = Vec::with_capacity(changes.loyalty.len());
            let mut increments = Vec::with_capacity(changes.loyalty.len());
            for ((seller_id, buyer_id), increment) in &changes.loyalty {
                seller_ids.push(*seller_id);
                buyer_ids.push(*buyer_id);
                increments.push(*increment);
            }
            sqlx::query(&format!(
                r#"
                INSERT INTO {ledger} ({seller}, {buyer}, number_of_purchases)
                SELECT * FROM UNNEST($1::int4[], $2::int4[], $3::int4[])
                ON CONFLICT ({seller}, {buyer})
                DO UPDATE SET number_of_purchases =
                    {ledger}.number_of_purchases + EXCLUDED.number_of_purchases
                "#,
                ledger = t.ledger,
                seller = t.ledger_seller,
                buyer = t.ledger_buyer
            ))
            .bind(&seller_ids)
            .bind(&buyer_ids)
            .bind(&increments)
            .execute(&mut *self.tx)
            .await?;
        }

        if !changes.consumed_orders.is_empty() {
            let ids: Vec<i32> = changes.consumed_orders.iter().copied().collect();
            sqlx::query(
                r#"
                UPDATE customers
                SET purchase_order = jsonb_build_object('max_price', '', 'car_model', '')
                WHERE id = ANY($1)
                "#,
            )
            .bind(&ids)
            .execute(&mut *self.tx)
            .await?;
        }

        if !changes.sales.is_empty() {
            let mut ids: Vec<Uuid> = Vec::with_capacity(changes.sales.len());
            let mut seller_ids = Vec::with_capacity(changes.sales.len());
            let mut buyer_ids = Vec::with_capacity(changes.sales.len());
            let mut car_ids = Vec::with_capacity(changes.sales.len());
            let mut prices = Vec::with_capacity(changes.sales.len());
            let mut created = Vec::with_capacity(changes.sales.len());
            for sale in &changes.sales {
                ids.push(sale.id);
                seller_ids.push(sale.seller_id);
                buyer_ids.push(sale.buyer_id);
                car_ids.push(sale.car_id);
                prices.push(sale.price);
                created.push(sale.created_at);
            }
            sqlx::query(&format!(
                r#"
                INSERT INTO {sales} (id, {seller}, {buyer}, car_id, price, created_at)
                SELECT * FROM UNNEST(
                    $1::uuid[], $2::int4[], $3::int4[],
                    $4::int4[], $5::numeric[], $6::timestamptz[]
                )
                "#,
                sales = t.sales,
                seller = t.ledger_seller,
                buyer = t.ledger_buyer
            ))
            .bind(&ids)
            .bind(&seller_ids)
            .bind(&buyer_ids)
            .bind(&car_ids)
            .bind(&prices)
            .bind(&created)
            .execute(&mut *self.tx)
            .await?;
        }

        self.tx.commit().await?;
        tracing::debug!("Committed {} change set: {:?}", self.cycle, summary);
        Ok(summary)
    }
}
