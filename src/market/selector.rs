// Candidate Selector
//
// Filters the run's listings down to those a buyer could purchase. Returns positions into
// the listing slice (in listing id order) so the caller can mutate stock afterwards.

use rust_decimal::Decimal;

use crate::market::allocation::SupplyPolicy;
use crate::market::criteria::{PurchaseOrder, Specification};
use crate::market::snapshot::Listing;

pub struct CandidateSelector;

impl CandidateSelector {
    /// Supplier listings matching a dealership's standing specification
    ///
    /// Under `SupplyPolicy::Unlimited` the listing quantity is not a gate.
    pub fn restock_candidates(
        spec: &Specification,
        listings: &[Listing],
        supply: SupplyPolicy,
    ) -> Vec<usize> {
        listings
            .iter()
            .enumerate()
            .filter(|(_, listing)| listing.price >= Decimal::ZERO)
            .filter(|(_, listing)| supply.is_unlimited() || listing.quantity > 0)
            .filter(|(_, listing)| spec.matches(&listing.car))
            .map(|(index, _)| index)
            .collect()
    }

    /// In-stock, priced dealership listings matching a customer's order
    pub fn fulfillment_candidates(order: &PurchaseOrder, listings: &[Listing]) -> Vec<usize> {
        listings
            .iter()
            .enumerate()
            .filter(|(_, listing)| listing.quantity > 0 && listing.price > Decimal::ZERO)
            .filter(|(_, listing)| order.matches(&listing.car, listing.price))
            .map(|(index, _)| index)
            .collect()
    }
}
