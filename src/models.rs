use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sqlx::FromRow;
use uuid::Uuid;

/// Catalog entry describing a physical car
///
/// Used purely as a match key; the engine never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Car {
    pub id: i32,
    pub model: String,
    pub registration_year: i16,
    pub power: Decimal,
    pub transmission: String,
    pub fuel: String,
    pub drive_type: String,
}

/// Wholesale seller
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Supplier {
    pub id: i32,
    pub company_name: String,
    pub balance: Decimal,
    /// Loyalty schedule as stored: `{"<purchase threshold>": percent}`
    pub discount: JsonValue,
    pub number_of_buyers: i32,
}

/// Dealership: buys from suppliers, sells to customers
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Dealership {
    pub id: i32,
    pub company_name: String,
    pub balance: Decimal,
    /// Standing restock preferences, flexible string map
    pub specification: JsonValue,
    /// Loyalty schedule offered to customers
    pub discount: JsonValue,
    pub number_of_buyers: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Customer {
    pub id: i32,
    pub name: String,
    pub balance: Decimal,
    /// One-shot order: `{"max_price": "...", "car_model": "..."}`
    pub purchase_order: JsonValue,
    pub updated_at: DateTime<Utc>,
}

/// A supplier's priced offer of a car
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SupplierCar {
    pub id: i32,
    pub supplier_id: i32,
    pub car_id: i32,
    pub price: Decimal,
    pub quantity: i32,
}

/// A dealership's stock of a car, one row per (dealership, car)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DealershipCar {
    pub id: i32,
    pub dealership_id: i32,
    pub car_id: i32,
    pub supplier_id: Option<i32>,
    pub price: Decimal,
    pub quantity: i32,
}

/// Percentage markdown on a (seller, car) pair within a validity window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Discount {
    pub id: i32,
    pub seller_id: i32,
    pub car_id: i32,
    pub percent: Decimal,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl Discount {
    /// Whether the discount window covers the given instant (inclusive)
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.start_date <= at && at <= self.end_date
    }
}

/// Per (seller, buyer) purchase counter driving loyalty tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UniqueCustomer {
    pub seller_id: i32,
    pub buyer_id: i32,
    pub number_of_purchases: i32,
}

/// Immutable record of one unit sold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SaleRecord {
    pub id: Uuid,
    pub seller_id: i32,
    pub buyer_id: i32,
    pub car_id: i32,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Empty specification, every field a wildcard
pub fn blank_specification() -> JsonValue {
    json!({
        "registration_year": "",
        "transmission": "",
        "power": "",
        "fuel": "",
        "drive_type": "",
    })
}

/// Purchase order value written back once an order is fulfilled
pub fn blank_purchase_order() -> JsonValue {
    json!({
        "max_price": "",
        "car_model": "",
    })
}
