// Pricing Calculator
//
// Computes a listing's effective price from its base price and at most two discounts:
// an item discount tied to (seller, car) and a loyalty discount looked up from the seller's
// tiered schedule using the buyer's purchase count. The two are never stacked; the lower
// resulting price wins.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};
use crate::models::Discount;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Currency precision for every computed price
const CURRENCY_DP: u32 = 2;

/// Schedule key that turns a seller's loyalty discounts off
const LEGACY_COUNTER_KEY: &str = "number_of_purchases";

/// One rung of a seller's loyalty schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoyaltyTier {
    /// Minimum number of prior purchases for the tier to apply
    pub threshold: i32,
    pub percent: Decimal,
}

/// A seller's loyalty tiers in ascending threshold order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoyaltySchedule {
    tiers: Vec<LoyaltyTier>,
}

impl LoyaltySchedule {
    /// Build a schedule from tiers in any order
    ///
    /// When a threshold repeats, the tier given last wins.
    pub fn new(mut tiers: Vec<LoyaltyTier>) -> Self {
        tiers.sort_by_key(|tier| tier.threshold);
        let mut deduped: Vec<LoyaltyTier> = Vec::with_capacity(tiers.len());
        for tier in tiers {
            match deduped.last_mut() {
                Some(last) if last.threshold == tier.threshold => *last = tier,
                _ => deduped.push(tier),
            }
        }
        Self { tiers: deduped }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse the stored `{"<threshold>": percent}` map
    ///
    /// Invalid entries are dropped with a warning rather than failing the seller.
    pub fn from_json(seller_id: i32, raw: &JsonValue) -> Self {
        let map = match raw {
            JsonValue::Object(map) => map,
            JsonValue::Null => return Self::empty(),
            other => {
                tracing::warn!("Seller {} has a non-object loyalty schedule: {}", seller_id, other);
                return Self::empty();
            }
        };

        // a schedule carrying the purchase counter key disables loyalty for the seller
        if map.contains_key(LEGACY_COUNTER_KEY) {
            tracing::debug!(
                "Seller {} loyalty schedule has a '{}' key, loyalty disabled",
                seller_id,
                LEGACY_COUNTER_KEY
            );
            return Self::empty();
        }

        let mut tiers = Vec::with_capacity(map.len());
        for (key, value) in map {
            let threshold = match key.trim().parse::<i32>() {
                Ok(threshold) if threshold >= 0 => threshold,
                _ => {
                    tracing::warn!(
                        "Seller {} loyalty schedule: ignoring threshold '{}'",
                        seller_id,
                        key
                    );
                    continue;
                }
            };

            let percent = match value {
                JsonValue::Number(n) => Decimal::from_str(&n.to_string()).ok(),
                JsonValue::String(s) => Decimal::from_str(s.trim()).ok(),
                _ => None,
            };

            match percent {
                Some(percent) if is_valid_percent(percent) => {
                    tiers.push(LoyaltyTier { threshold, percent })
                }
                _ => tracing::warn!(
                    "Seller {} loyalty schedule: ignoring percent {} for threshold {}",
                    seller_id,
                    value,
                    threshold
                ),
            }
        }

        Self::new(tiers)
    }

    /// The tier with the highest threshold not exceeding `purchases`
    pub fn tier_for(&self, purchases: i32) -> Option<&LoyaltyTier> {
        self.tiers
            .iter()
            .take_while(|tier| tier.threshold <= purchases)
            .last()
    }

    pub fn tiers(&self) -> &[LoyaltyTier] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

/// Which discount produced the effective price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppliedDiscount {
    None,
    Item { discount_id: i32, percent: Decimal },
    Loyalty { threshold: i32, percent: Decimal },
}

/// Result of pricing one listing for one buyer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceQuote {
    pub base_price: Decimal,
    pub effective_price: Decimal,
    pub applied: AppliedDiscount,
}

/// Stateless price arithmetic
pub struct PricingCalculator;

impl PricingCalculator {
    /// Quote the effective price of a listing
    ///
    /// # Arguments
    /// * `base_price` - Listing price
    /// * `item_discount` - Active discount for the (seller, car) pair, if any
    /// * `purchases` - Buyer's purchase count with this seller; `None` when no ledger row exists
    /// * `schedule` - Seller's loyalty schedule
    pub fn quote(
        base_price: Decimal,
        item_discount: Option<&Discount>,
        purchases: Option<i32>,
        schedule: &LoyaltySchedule,
    ) -> EngineResult<PriceQuote> {
        let mut best: Option<(Decimal, AppliedDiscount)> = None;

        if let Some(tier) = purchases.and_then(|count| schedule.tier_for(count)) {
            let price = Self::discounted_price(base_price, tier.percent)?;
            best = Some((
                price,
                AppliedDiscount::Loyalty {
                    threshold: tier.threshold,
                    percent: tier.percent,
                },
            ));
        }

        if let Some(discount) = item_discount {
            if is_valid_percent(discount.percent) {
                let price = Self::discounted_price(base_price, discount.percent)?;
                if best.map_or(true, |(current, _)| price < current) {
                    best = Some((
                        price,
                        AppliedDiscount::Item {
                            discount_id: discount.id,
                            percent: discount.percent,
                        },
                    ));
                }
            } else {
                tracing::warn!(
                    "Ignoring discount {} with out-of-range percent {}",
                    discount.id,
                    discount.percent
                );
            }
        }

        let (effective_price, applied) =
            best.unwrap_or_else(|| (Self::round_currency(base_price), AppliedDiscount::None));

        Ok(PriceQuote {
            base_price,
            effective_price,
            applied,
        })
    }

    /// `price * (100 - percent) / 100`, rounded to currency precision
    pub fn discounted_price(price: Decimal, percent: Decimal) -> EngineResult<Decimal> {
        let keep = HUNDRED - percent;
        let scaled = price.checked_mul(keep).ok_or_else(|| {
            EngineError::CalculationError(format!("{} * {} overflowed", price, keep))
        })?;
        let result = scaled / HUNDRED;

        Ok(Self::round_currency(result.max(Decimal::ZERO)))
    }

    pub fn round_currency(amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(CURRENCY_DP, RoundingStrategy::MidpointAwayFromZero)
    }
}

/// Discount percents live in (0, 100]
pub fn is_valid_percent(percent: Decimal) -> bool {
    percent > Decimal::ZERO && percent <= HUNDRED
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn item_discount(percent: Decimal) -> Discount {
        let now = Utc::now();
        Discount {
            id: 11,
            seller_id: 1,
            car_id: 1,
            percent,
            start_date: now,
            end_date: now,
        }
    }

    fn schedule(pairs: &[(i32, Decimal)]) -> LoyaltySchedule {
        LoyaltySchedule::new(
            pairs
                .iter()
                .map(|&(threshold, percent)| LoyaltyTier { threshold, percent })
                .collect(),
        )
    }

    #[test]
    fn test_no_discount_keeps_base_price() {
        let quote =
            PricingCalculator::quote(dec!(7000), None, None, &LoyaltySchedule::empty()).unwrap();
        assert_eq!(quote.effective_price, dec!(7000));
        assert_eq!(quote.applied, AppliedDiscount::None);
    }

    #[test]
    fn test_item_discount_applied() {
        let discount = item_discount(dec!(50));
        let quote =
            PricingCalculator::quote(dec!(7000), Some(&discount), None, &LoyaltySchedule::empty())
                .unwrap();
        assert_eq!(quote.effective_price, dec!(3500));
        assert_eq!(
            quote.applied,
            AppliedDiscount::Item {
                discount_id: 11,
                percent: dec!(50)
            }
        );
    }

    #[test]
    fn test_loyalty_requires_ledger_row() {
        let tiers = schedule(&[(0, dec!(5))]);
        let quote = PricingCalculator::quote(dec!(1000), None, None, &tiers).unwrap();
        assert_eq!(quote.effective_price, dec!(1000));

        let quote = PricingCalculator::quote(dec!(1000), None, Some(0), &tiers).unwrap();
        assert_eq!(quote.effective_price, dec!(950));
    }

    #[test]
    fn test_loyalty_picks_highest_qualifying_threshold() {
        let tiers = schedule(&[(10, dec!(20)), (1, dec!(5)), (4, dec!(10))]);

        assert_eq!(tiers.tier_for(0), None);
        assert_eq!(tiers.tier_for(3).map(|t| t.percent), Some(dec!(5)));
        assert_eq!(tiers.tier_for(4).map(|t| t.percent), Some(dec!(10)));
        assert_eq!(tiers.tier_for(9).map(|t| t.percent), Some(dec!(10)));
        assert_eq!(tiers.tier_for(250).map(|t| t.percent), Some(dec!(20)));
    }

    #[test]
    fn test_discounts_not_stacked() {
        let tiers = schedule(&[(4, dec!(10))]);
        let discount = item_discount(dec!(50));

        let quote = PricingCalculator::quote(dec!(7000), Some(&discount), Some(5), &tiers).unwrap();
        // min(3500, 6300), not 7000 * 0.5 * 0.9
        assert_eq!(quote.effective_price, dec!(3500));

        let small = item_discount(dec!(5));
        let quote = PricingCalculator::quote(dec!(7000), Some(&small), Some(5), &tiers).unwrap();
        assert_eq!(quote.effective_price, dec!(6300));
        assert!(matches!(quote.applied, AppliedDiscount::Loyalty { threshold: 4, .. }));
    }

    #[test]
    fn test_full_discount_yields_zero() {
        let discount = item_discount(dec!(100));
        let quote =
            PricingCalculator::quote(dec!(7000), Some(&discount), None, &LoyaltySchedule::empty())
                .unwrap();
        assert_eq!(quote.effective_price, Decimal::ZERO);
    }

    #[test]
    fn test_out_of_range_item_discount_ignored() {
        let discount = item_discount(dec!(150));
        let quote =
            PricingCalculator::quote(dec!(100), Some(&discount), None, &LoyaltySchedule::empty())
                .unwrap();
        assert_eq!(quote.effective_price, dec!(100));
    }

    #[test]
    fn test_rounding_to_cents() {
        assert_eq!(
            PricingCalculator::discounted_price(dec!(99.99), dec!(33)).unwrap(),
            dec!(66.99)
        );
        assert_eq!(PricingCalculator::discounted_price(dec!(0.05), dec!(50)).unwrap(), dec!(0.03));
    }

    #[test]
    fn test_schedule_from_json_lenient() {
        let parsed = LoyaltySchedule::from_json(
            1,
            &json!({"4": 10, "10": "15.5", "gold": 3, "2": 0, "7": "abc"}),
        );
        assert_eq!(
            parsed.tiers(),
            &[
                LoyaltyTier { threshold: 4, percent: dec!(10) },
                LoyaltyTier { threshold: 10, percent: dec!(15.5) },
            ]
        );

        assert!(LoyaltySchedule::from_json(1, &json!([1, 2])).is_empty());
        assert!(LoyaltySchedule::from_json(1, &JsonValue::Null).is_empty());
    }

    #[test]
    fn test_purchase_counter_key_disables_schedule() {
        let parsed = LoyaltySchedule::from_json(
            1,
            &json!({"4": 10, "10": 15, "number_of_purchases": 3}),
        );
        assert!(parsed.is_empty());

        let quote = PricingCalculator::quote(dec!(1000), None, Some(12), &parsed).unwrap();
        assert_eq!(quote.effective_price, dec!(1000));
        assert_eq!(quote.applied, AppliedDiscount::None);
    }

    #[test]
    fn test_schedule_duplicate_threshold_last_wins() {
        let tiers = schedule(&[(4, dec!(10)), (4, dec!(12))]);
        assert_eq!(tiers.tiers().len(), 1);
        assert_eq!(tiers.tier_for(4).map(|t| t.percent), Some(dec!(12)));
    }
}
