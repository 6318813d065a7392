// End-to-end cycle tests against the in-memory store

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::market::{BuyerOutcome, Cycle, Orchestrator, SkipReason, SupplyPolicy};
use crate::models::blank_purchase_order;
use crate::store::{InMemoryStore, MarketState, MarketplaceStore};

fn window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (now - Duration::days(1), now + Duration::days(1))
}

fn orchestrator(state: MarketState) -> Orchestrator<InMemoryStore> {
    Orchestrator::new(InMemoryStore::new(state), EngineSettings::default())
}

fn reno(state: &mut MarketState) -> i32 {
    state.add_car("Reno", 2018, dec!(1.6), "automatic", "diesel", "front-wheel")
}

#[tokio::test]
async fn test_fulfillment_with_item_discount() {
    let now = Utc::now();
    let (start, end) = window(now);

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let dealer = state.add_dealership("Motors", dec!(0), json!({}));
    let listing = state.add_dealership_car(dealer, car, dec!(7000), 2);
    state.add_dealership_discount(dealer, car, dec!(50), start, end);
    let order = json!({"max_price": "9000", "car_model": "Reno"});
    let customer = state.add_customer("Ann", dec!(10000), order);

    let orchestrator = orchestrator(state);
    let report = orchestrator.run_cycle_at(Cycle::Fulfillment, now).await.unwrap();

    assert_eq!(report.buyers_served, 1);
    assert_eq!(report.units_sold, 1);
    assert_eq!(report.amount_settled, dec!(3500));

    orchestrator
        .store()
        .read(|s| {
            assert_eq!(s.customers[&customer].balance, dec!(6500));
            assert_eq!(s.customers[&customer].purchase_order, blank_purchase_order());
            assert_eq!(s.dealerships[&dealer].balance, dec!(3500));
            assert_eq!(s.dealerships[&dealer].number_of_buyers, 1);
            assert_eq!(s.dealership_cars[&listing].quantity, 1);
            assert_eq!(s.dealership_sales.len(), 1);
            assert_eq!(s.dealership_sales[0].price, dec!(3500));
            assert_eq!(s.dealership_sales[0].buyer_id, customer);
            assert_eq!(s.dealership_customers[&(dealer, customer)], 1);
        })
        .await;
}

#[tokio::test]
async fn test_restock_spends_whole_budget() {
    let now = Utc::now();
    let (start, end) = window(now);

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let supplier = state.add_supplier("Wholesale", dec!(0), json!({"4": 10}));
    let listing = state.add_supplier_car(supplier, car, dec!(7000), 0);
    state.add_supplier_discount(supplier, car, dec!(50), start, end);
    let spec = json!({"transmission": "automatic", "fuel": "diesel"});
    let dealer = state.add_dealership("Motors", dec!(17500), spec);

    let orchestrator = orchestrator(state);
    let report = orchestrator.run_cycle_at(Cycle::Restock, now).await.unwrap();

    assert_eq!(report.units_sold, 5);
    assert_eq!(
        report.outcome_for(dealer),
        Some(&BuyerOutcome::Purchased {
            buyer_id: dealer,
            units: 5,
            spent: dec!(17500),
            capped: false,
        })
    );

    orchestrator
        .store()
        .read(|s| {
            assert_eq!(s.dealerships[&dealer].balance, Decimal::ZERO);
            assert_eq!(s.suppliers[&supplier].balance, dec!(17500));
            assert_eq!(s.suppliers[&supplier].number_of_buyers, 1);
            assert_eq!(s.supplier_sales.len(), 5);
            assert!(s.supplier_sales.iter().all(|sale| sale.price == dec!(3500)));
            assert_eq!(s.supplier_customers[&(supplier, dealer)], 5);

            // unlimited supply leaves the supplier listing alone
            assert_eq!(s.supplier_cars[&listing].quantity, 0);

            let stock = s.dealership_stock(dealer, car).unwrap();
            assert_eq!(stock.quantity, 5);
            assert_eq!(stock.supplier_id, Some(supplier));
        })
        .await;
}

#[tokio::test]
async fn test_unmatched_order_changes_nothing() {
    let now = Utc::now();

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let dealer = state.add_dealership("Motors", dec!(0), json!({}));
    state.add_dealership_car(dealer, car, dec!(7000), 2);
    let order = json!({"max_price": "9000", "car_model": "Volga"});
    let customer = state.add_customer("Ann", dec!(10000), order.clone());

    let orchestrator = orchestrator(state);
    let report = orchestrator.run_cycle_at(Cycle::Fulfillment, now).await.unwrap();

    assert_eq!(
        report.outcome_for(customer),
        Some(&BuyerOutcome::Skipped {
            buyer_id: customer,
            reason: SkipReason::NoCandidates,
        })
    );
    assert_eq!(report.commit.sales_recorded, 0);

    orchestrator
        .store()
        .read(|s| {
            assert_eq!(s.customers[&customer].balance, dec!(10000));
            assert_eq!(s.customers[&customer].purchase_order, order);
            assert!(s.dealership_sales.is_empty());
            assert!(s.dealership_customers.is_empty());
        })
        .await;
}

#[tokio::test]
async fn test_free_units_terminate_at_cap() {
    let now = Utc::now();
    let (start, end) = window(now);

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let supplier = state.add_supplier("Wholesale", dec!(0), json!({}));
    state.add_supplier_car(supplier, car, dec!(7000), 0);
    state.add_supplier_discount(supplier, car, dec!(100), start, end);
    let dealer = state.add_dealership("Motors", dec!(1000), json!({}));

    let settings = EngineSettings {
        max_units_per_listing: 25,
        ..EngineSettings::default()
    };
    let orchestrator = Orchestrator::new(InMemoryStore::new(state), settings);
    let report = orchestrator.run_cycle_at(Cycle::Restock, now).await.unwrap();

    assert_eq!(report.units_sold, 25);
    assert_eq!(report.capped_allocations, 1);
    assert_eq!(orchestrator.metrics().summary(Cycle::Restock).capped_allocations, 1);

    orchestrator
        .store()
        .read(|s| {
            assert_eq!(s.dealerships[&dealer].balance, dec!(1000));
            assert_eq!(s.dealership_stock(dealer, car).unwrap().quantity, 25);
            assert_eq!(s.supplier_customers[&(supplier, dealer)], 25);
        })
        .await;
}

#[tokio::test]
async fn test_malformed_criteria_only_fails_that_buyer() {
    let now = Utc::now();

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let dealer = state.add_dealership("Motors", dec!(0), json!({}));
    state.add_dealership_car(dealer, car, dec!(5000), 5);
    let broken_order = json!({"max_price": "lots", "car_model": "Reno"});
    let broken = state.add_customer("Bob", dec!(10000), broken_order);
    let fine_order = json!({"max_price": "6000", "car_model": "Reno"});
    let fine = state.add_customer("Ann", dec!(10000), fine_order);

    let orchestrator = orchestrator(state);
    let report = orchestrator.run_cycle_at(Cycle::Fulfillment, now).await.unwrap();

    assert_eq!(report.buyers_failed, 1);
    assert_eq!(report.buyers_served, 1);
    assert!(matches!(
        report.outcome_for(broken),
        Some(BuyerOutcome::Failed { .. })
    ));

    orchestrator
        .store()
        .read(|s| {
            assert_eq!(s.customers[&broken].balance, dec!(10000));
            assert_eq!(s.customers[&fine].balance, dec!(5000));
        })
        .await;
}

#[tokio::test]
async fn test_most_recent_order_served_first() {
    let now = Utc::now();

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let dealer = state.add_dealership("Motors", dec!(0), json!({}));
    let listing = state.add_dealership_car(dealer, car, dec!(5000), 1);
    let older = state.add_customer("Old", dec!(10000), json!({"max_price": "6000"}));
    let newer = state.add_customer("New", dec!(10000), json!({"max_price": "6000"}));
    state.customers.get_mut(&older).unwrap().updated_at = now - Duration::hours(2);
    state.customers.get_mut(&newer).unwrap().updated_at = now - Duration::minutes(5);

    let orchestrator = orchestrator(state);
    let report = orchestrator.run_cycle_at(Cycle::Fulfillment, now).await.unwrap();

    assert!(matches!(report.outcome_for(newer), Some(BuyerOutcome::Purchased { .. })));
    assert_eq!(
        report.outcome_for(older),
        Some(&BuyerOutcome::Skipped {
            buyer_id: older,
            reason: SkipReason::NoCandidates,
        })
    );
    assert_eq!(
        orchestrator.store().read(|s| s.dealership_cars[&listing].quantity).await,
        0
    );
}

#[tokio::test]
async fn test_fulfilled_order_not_repeated() {
    let now = Utc::now();

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let dealer = state.add_dealership("Motors", dec!(0), json!({}));
    state.add_dealership_car(dealer, car, dec!(1000), 5);
    let customer = state.add_customer("Ann", dec!(10000), json!({"max_price": "2000"}));

    let orchestrator = orchestrator(state);
    orchestrator.run_cycle_at(Cycle::Fulfillment, now).await.unwrap();
    let second = orchestrator.run_cycle_at(Cycle::Fulfillment, now).await.unwrap();

    assert_eq!(
        second.outcome_for(customer),
        Some(&BuyerOutcome::Skipped {
            buyer_id: customer,
            reason: SkipReason::NoOrder,
        })
    );

    orchestrator
        .store()
        .read(|s| {
            assert_eq!(s.customers[&customer].balance, dec!(9000));
            assert_eq!(s.dealership_sales.len(), 1);
        })
        .await;
}

#[tokio::test]
async fn test_insufficient_balance_after_discount() {
    let now = Utc::now();

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let dealer = state.add_dealership("Motors", dec!(0), json!({}));
    state.add_dealership_car(dealer, car, dec!(5000), 1);
    let customer = state.add_customer("Ann", dec!(4999.99), json!({"max_price": "6000"}));

    let orchestrator = orchestrator(state);
    let report = orchestrator.run_cycle_at(Cycle::Fulfillment, now).await.unwrap();

    assert_eq!(
        report.outcome_for(customer),
        Some(&BuyerOutcome::Skipped {
            buyer_id: customer,
            reason: SkipReason::InsufficientBalance,
        })
    );
}

#[tokio::test]
async fn test_loyalty_tier_beats_item_discount() {
    let now = Utc::now();
    let (start, end) = window(now);

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let dealer = state.add_dealership("Motors", dec!(0), json!({}));
    state.dealerships.get_mut(&dealer).unwrap().discount = json!({"1": 10, "3": 20});
    state.add_dealership_car(dealer, car, dec!(1000), 3);
    state.add_dealership_discount(dealer, car, dec!(5), start, end);
    let regular = state.add_customer("Ann", dec!(5000), json!({"max_price": "1000"}));
    let newcomer = state.add_customer("Bob", dec!(5000), json!({"max_price": "1000"}));
    state.dealership_customers.insert((dealer, regular), 2);

    let orchestrator = orchestrator(state);
    orchestrator.run_cycle_at(Cycle::Fulfillment, now).await.unwrap();

    orchestrator
        .store()
        .read(|s| {
            // two prior purchases qualify for the 10% tier, which beats the 5% item discount
            assert_eq!(s.customers[&regular].balance, dec!(4100));
            // no ledger row yet, so only the item discount applies
            assert_eq!(s.customers[&newcomer].balance, dec!(4050));
            assert_eq!(s.dealership_customers[&(dealer, regular)], 3);
            assert_eq!(s.dealership_customers[&(dealer, newcomer)], 1);
            assert_eq!(s.dealerships[&dealer].number_of_buyers, 1);
        })
        .await;
}

#[tokio::test]
async fn test_expired_discount_ignored() {
    let now = Utc::now();

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let dealer = state.add_dealership("Motors", dec!(0), json!({}));
    state.add_dealership_car(dealer, car, dec!(1000), 1);
    let (start, end) = (now - Duration::days(3), now - Duration::days(1));
    state.add_dealership_discount(dealer, car, dec!(50), start, end);
    let customer = state.add_customer("Ann", dec!(5000), json!({"max_price": "1000"}));

    let orchestrator = orchestrator(state);
    orchestrator.run_cycle_at(Cycle::Fulfillment, now).await.unwrap();

    assert_eq!(
        orchestrator.store().read(|s| s.customers[&customer].balance).await,
        dec!(4000)
    );
}

#[tokio::test]
async fn test_distinct_buyer_counted_once_across_runs() {
    let now = Utc::now();

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let supplier = state.add_supplier("Wholesale", dec!(0), json!({}));
    state.add_supplier_car(supplier, car, dec!(3000), 0);
    let dealer = state.add_dealership("Motors", dec!(10000), json!({}));

    let orchestrator = orchestrator(state);
    orchestrator.run_cycle_at(Cycle::Restock, now).await.unwrap();
    orchestrator
        .store()
        .write(|s| s.dealerships.get_mut(&dealer).unwrap().balance += dec!(5000))
        .await;
    orchestrator.run_cycle_at(Cycle::Restock, now).await.unwrap();

    orchestrator
        .store()
        .read(|s| {
            // 10000 buys 3 leaving 1000; topped up to 6000 buys 2 more
            assert_eq!(s.supplier_customers[&(supplier, dealer)], 5);
            assert_eq!(s.suppliers[&supplier].number_of_buyers, 1);
            assert_eq!(s.dealerships[&dealer].balance, Decimal::ZERO);
            assert_eq!(s.dealership_stock(dealer, car).unwrap().quantity, 5);
        })
        .await;
}

#[tokio::test]
async fn test_zero_count_ledger_row_counts_buyer_on_purchase() {
    let now = Utc::now();

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let supplier = state.add_supplier("Wholesale", dec!(0), json!({}));
    state.add_supplier_car(supplier, car, dec!(1000), 0);
    let dealer = state.add_dealership("Motors", dec!(1000), json!({}));
    state.supplier_customers.insert((supplier, dealer), 0);

    let orchestrator = orchestrator(state);
    orchestrator.run_cycle_at(Cycle::Restock, now).await.unwrap();

    orchestrator
        .store()
        .read(|s| {
            assert_eq!(s.supplier_customers[&(supplier, dealer)], 1);
            assert_eq!(s.suppliers[&supplier].number_of_buyers, 1);
        })
        .await;
}

#[tokio::test]
async fn test_finite_restock_draws_down_supplier_stock() {
    let now = Utc::now();

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let supplier = state.add_supplier("Wholesale", dec!(0), json!({}));
    let listing = state.add_supplier_car(supplier, car, dec!(1000), 2);
    let first = state.add_dealership("Motors", dec!(10000), json!({}));
    let second = state.add_dealership("Autos", dec!(10000), json!({}));

    let settings = EngineSettings {
        restock_supply: SupplyPolicy::Finite,
        ..EngineSettings::default()
    };
    let orchestrator = Orchestrator::new(InMemoryStore::new(state), settings);
    let report = orchestrator.run_cycle_at(Cycle::Restock, now).await.unwrap();

    assert_eq!(report.units_sold, 2);
    assert_eq!(
        report.outcome_for(second),
        Some(&BuyerOutcome::Skipped {
            buyer_id: second,
            reason: SkipReason::NoCandidates,
        })
    );

    orchestrator
        .store()
        .read(|s| {
            assert_eq!(s.supplier_cars[&listing].quantity, 0);
            assert_eq!(s.dealerships[&first].balance, dec!(8000));
        })
        .await;
}

#[tokio::test]
async fn test_restocked_units_not_offered_until_priced() {
    let now = Utc::now();

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let supplier = state.add_supplier("Wholesale", dec!(0), json!({}));
    state.add_supplier_car(supplier, car, dec!(1000), 0);
    let dealer = state.add_dealership("Motors", dec!(1000), json!({}));
    let customer = state.add_customer("Ann", dec!(5000), json!({"max_price": "5000"}));

    let orchestrator = orchestrator(state);
    orchestrator.run_cycle_at(Cycle::Restock, now).await.unwrap();
    let report = orchestrator.run_cycle_at(Cycle::Fulfillment, now).await.unwrap();

    assert_eq!(
        report.outcome_for(customer),
        Some(&BuyerOutcome::Skipped {
            buyer_id: customer,
            reason: SkipReason::NoCandidates,
        })
    );
    assert_eq!(
        orchestrator.store().read(|s| s.dealership_stock(dealer, car).unwrap().quantity).await,
        1
    );
}

#[tokio::test]
async fn test_concurrent_run_rejected() {
    let store = InMemoryStore::default();
    let orchestrator = Orchestrator::new(store.clone(), EngineSettings::default());

    let held = store.begin(Cycle::Fulfillment).await.unwrap();
    let err = orchestrator.run_fulfillment_cycle().await.unwrap_err();
    assert!(matches!(err, EngineError::RunInProgress(Cycle::Fulfillment)));

    // the other cycle is unaffected
    assert!(orchestrator.run_restock_cycle().await.is_ok());

    drop(held);
    assert!(orchestrator.run_fulfillment_cycle().await.is_ok());
}

#[tokio::test]
async fn test_non_positive_balance_skipped() {
    let now = Utc::now();

    let mut state = MarketState::new();
    let car = reno(&mut state);
    let supplier = state.add_supplier("Wholesale", dec!(0), json!({}));
    state.add_supplier_car(supplier, car, dec!(0), 0);
    let dealer = state.add_dealership("Motors", dec!(0), json!({}));

    let orchestrator = orchestrator(state);
    let report = orchestrator.run_cycle_at(Cycle::Restock, now).await.unwrap();

    assert_eq!(
        report.outcome_for(dealer),
        Some(&BuyerOutcome::Skipped {
            buyer_id: dealer,
            reason: SkipReason::NonPositiveBalance,
        })
    );
    assert!(orchestrator.store().read(|s| s.dealership_cars.is_empty()).await);
}
