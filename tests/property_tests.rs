//! Property-based tests for the ledger and pricing invariants.

mod common;

use chrono::Utc;
use common::TestDb;
use proptest::prelude::*;
use rust_decimal::Decimal;
use sea_orm::Iterable;
use storefront_core::{
    entities::{
        discount::{self, DiscountType},
        order::OrderStatus,
        stock_history::{ChangeType, JournalType},
    },
    errors::ServiceError,
    services::{
        discounts::{compute_discount, CartLine},
        stock_ledger::AdjustStock,
    },
};
use uuid::Uuid;

fn discount_model(kind: DiscountType, is_percentage: bool, value: i64) -> discount::Model {
    let now = Utc::now();
    discount::Model {
        id: Uuid::new_v4(),
        code: "PROP".to_string(),
        name: "property".to_string(),
        discount_type: kind.to_string(),
        is_percentage,
        value: Decimal::from(value),
        min_spend: None,
        buy_quantity: None,
        get_quantity: None,
        product_id: None,
        max_uses: None,
        max_uses_per_user: None,
        uses_count: 0,
        is_active: true,
        starts_at: now,
        ends_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn price_strategy() -> impl Strategy<Value = i64> {
    0i64..10_000_000
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn percentage_discount_stays_within_the_total(total in price_strategy(), pct in 0i64..=100) {
        let d = discount_model(DiscountType::Seasonal, true, pct);
        let total = Decimal::from(total);
        let outcome = compute_discount(&d, total, &[]).unwrap();
        prop_assert!(outcome.amount >= Decimal::ZERO);
        prop_assert!(outcome.amount <= total);
        prop_assert_eq!(outcome.amount.fract(), Decimal::ZERO);
    }

    #[test]
    fn fixed_discount_is_capped_at_the_total(total in price_strategy(), value in price_strategy()) {
        let d = discount_model(DiscountType::Manual, false, value);
        let total = Decimal::from(total);
        let outcome = compute_discount(&d, total, &[]).unwrap();
        prop_assert_eq!(outcome.amount, Decimal::from(value).min(total));
    }

    #[test]
    fn buy_x_get_y_grants_whole_multiples(quantity in 0i32..500, buy in 1i32..10, get in 1i32..5) {
        let mut d = discount_model(DiscountType::BuyXGetY, false, 0);
        d.buy_quantity = Some(buy);
        d.get_quantity = Some(get);
        let items = [CartLine { product_id: Uuid::new_v4(), quantity, unit_price: Decimal::from(1_000) }];

        let outcome = compute_discount(&d, Decimal::from(quantity * 1_000), &items).unwrap();
        let granted: i32 = outcome.extra_items.iter().map(|b| b.quantity).sum();
        prop_assert_eq!(granted, (quantity / buy) * get);
        prop_assert_eq!(outcome.amount, Decimal::ZERO);
    }

    #[test]
    fn min_spend_is_never_silently_skipped(total in price_strategy(), min in price_strategy()) {
        let mut d = discount_model(DiscountType::MinSpend, false, 1_000);
        d.min_spend = Some(Decimal::from(min));
        let result = compute_discount(&d, Decimal::from(total), &[]);
        if total < min {
            prop_assert!(matches!(result, Err(ServiceError::MinSpendNotMet(_))));
        } else {
            prop_assert!(result.is_ok());
        }
    }

    #[test]
    fn change_type_follows_the_sign(diff in -1_000i32..1_000) {
        let kind = ChangeType::from_diff(diff);
        if diff > 0 {
            prop_assert_eq!(kind, ChangeType::Increase);
        } else if diff < 0 {
            prop_assert_eq!(kind, ChangeType::Decrease);
        } else {
            prop_assert_eq!(kind, ChangeType::Adjustment);
        }
    }
}

#[test]
fn terminal_statuses_have_no_way_out() {
    for from in OrderStatus::iter().filter(|s| s.is_terminal()) {
        for to in OrderStatus::iter() {
            assert!(!from.can_transition_to(to), "{from} -> {to}");
        }
    }
}

proptest! {
    // Each case opens its own database
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn final_quantity_is_initial_plus_accepted_deltas(
        initial in 0i32..50,
        deltas in prop::collection::vec(-20i32..20, 1..15),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let t = TestDb::new().await;
            let product = t.seed_product("Prop", 1_000).await;
            let store = t.seed_store("Prop store").await;
            let stock = t.seed_stock(product.id, store.id, initial).await;
            let ledger = t.ledger();

            let mut expected = initial;
            for delta in deltas {
                let result = ledger
                    .adjust_stock(stock.id, AdjustStock::new(delta, "prop", JournalType::Adjustment))
                    .await;
                match result {
                    Ok(updated) => {
                        expected += delta;
                        assert_eq!(updated.quantity, expected);
                    }
                    Err(ServiceError::InsufficientStock(_)) => assert!(expected + delta < 0),
                    Err(ServiceError::ValidationError(_)) => assert_eq!(delta, 0),
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }

            assert_eq!(t.stock(stock.id).await.quantity, expected);
            for row in t.history(stock.id).await {
                assert_eq!(row.quantity_old + row.quantity_diff, row.quantity_new);
            }
        });
    }
}
