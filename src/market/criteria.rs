// Buyer criteria
//
// Specifications and purchase orders are stored as flexible JSON maps whose values are
// usually strings, including numbers encoded as strings. Parsing is lenient about value
// types but strict about meaning: an unknown specification key or an unparseable number
// fails only the buyer that owns it.

use rust_decimal::Decimal;
use serde_json::{Map, Value as JsonValue};
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};
use crate::models::Car;

/// A dealership's standing restock preferences
///
/// `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Specification {
    pub model: Option<String>,
    pub registration_year: Option<i16>,
    pub power: Option<Decimal>,
    pub transmission: Option<String>,
    pub fuel: Option<String>,
    pub drive_type: Option<String>,
}

impl Specification {
    pub fn parse(buyer_id: i32, raw: &JsonValue) -> EngineResult<Self> {
        let mut spec = Specification::default();

        let map = match as_object(buyer_id, raw, "specification")? {
            Some(map) => map,
            None => return Ok(spec),
        };

        for (key, value) in map {
            let text = match text_value(buyer_id, key, value)? {
                Some(text) => text,
                None => continue,
            };

            match key.as_str() {
                "model" => spec.model = Some(text),
                "transmission" => spec.transmission = Some(text),
                "fuel" => spec.fuel = Some(text),
                "drive_type" => spec.drive_type = Some(text),
                "registration_year" => {
                    let year = text.parse::<i16>().map_err(|_| {
                        EngineError::malformed(
                            buyer_id,
                            format!("registration_year '{}' is not a year", text),
                        )
                    })?;
                    spec.registration_year = Some(year);
                }
                "power" => spec.power = Some(parse_decimal(buyer_id, key, &text)?),
                other => {
                    return Err(EngineError::malformed(
                        buyer_id,
                        format!("unknown specification field '{}'", other),
                    ))
                }
            }
        }

        Ok(spec)
    }

    /// Exact equality on every set field
    pub fn matches(&self, car: &Car) -> bool {
        self.model.as_ref().map_or(true, |m| *m == car.model)
            && self.registration_year.map_or(true, |y| y == car.registration_year)
            && self.power.map_or(true, |p| p == car.power)
            && self.transmission.as_ref().map_or(true, |t| *t == car.transmission)
            && self.fuel.as_ref().map_or(true, |f| *f == car.fuel)
            && self.drive_type.as_ref().map_or(true, |d| *d == car.drive_type)
    }
}

/// A customer's one-shot order
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseOrder {
    pub max_price: Decimal,
    /// `None` matches any model
    pub car_model: Option<String>,
}

impl PurchaseOrder {
    /// Parse a stored order
    ///
    /// Returns `Ok(None)` when there is no standing order (empty `max_price`).
    pub fn parse(buyer_id: i32, raw: &JsonValue) -> EngineResult<Option<Self>> {
        let map = match as_object(buyer_id, raw, "order")? {
            Some(map) => map,
            None => return Ok(None),
        };

        let max_price = match map.get("max_price") {
            Some(value) => text_value(buyer_id, "max_price", value)?,
            None => None,
        };
        let max_price = match max_price {
            Some(text) => parse_decimal(buyer_id, "max_price", &text)?,
            None => return Ok(None),
        };
        if max_price.is_sign_negative() {
            return Err(EngineError::malformed(
                buyer_id,
                format!("max_price {} is negative", max_price),
            ));
        }

        let car_model = match map.get("car_model") {
            Some(value) => text_value(buyer_id, "car_model", value)?,
            None => None,
        };

        Ok(Some(PurchaseOrder { max_price, car_model }))
    }

    /// Model match and listed price within the order's ceiling
    pub fn matches(&self, car: &Car, listed_price: Decimal) -> bool {
        self.car_model.as_ref().map_or(true, |m| *m == car.model) && listed_price <= self.max_price
    }
}

fn as_object<'a>(
    buyer_id: i32,
    raw: &'a JsonValue,
    what: &str,
) -> EngineResult<Option<&'a Map<String, JsonValue>>> {
    match raw {
        JsonValue::Null => Ok(None),
        JsonValue::Object(map) => Ok(Some(map)),
        other => Err(EngineError::malformed(
            buyer_id,
            format!("{} must be an object, got {}", what, other),
        )),
    }
}

/// Normalise a criteria value to trimmed text; null and "" are unset
fn text_value(buyer_id: i32, key: &str, value: &JsonValue) -> EngineResult<Option<String>> {
    let text = match value {
        JsonValue::Null => return Ok(None),
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        other => {
            return Err(EngineError::malformed(
                buyer_id,
                format!("field '{}' has unsupported value {}", key, other),
            ))
        }
    };

    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

fn parse_decimal(buyer_id: i32, key: &str, text: &str) -> EngineResult<Decimal> {
    Decimal::from_str(text).map_err(|_| {
        EngineError::malformed(buyer_id, format!("{} '{}' is not a number", key, text))
    })
}
