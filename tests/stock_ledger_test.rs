mod common;

use assert_matches::assert_matches;
use common::TestDb;
use storefront_core::{
    entities::stock_history::{ChangeType, JournalType},
    errors::ServiceError,
    events::Event,
    services::stock_ledger::{apply_delta, AdjustStock, LedgerEntry},
};
use uuid::Uuid;

#[tokio::test]
async fn adjusting_down_records_one_history_row() {
    let mut t = TestDb::new().await;
    let product = t.seed_product("Arabica 250g", 85_000).await;
    let store = t.seed_store("Bandung").await;
    let stock = t.seed_stock(product.id, store.id, 50).await;

    let updated = t
        .ledger()
        .adjust_stock(stock.id, AdjustStock::new(-10, "u1", JournalType::Sale))
        .await
        .unwrap();

    assert_eq!(updated.quantity, 40);

    let history = t.history(stock.id).await;
    assert_eq!(history.len(), 2, "initial row plus the adjustment");
    let row = &history[1];
    assert_eq!(row.quantity_old, 50);
    assert_eq!(row.quantity_diff, -10);
    assert_eq!(row.quantity_new, 40);
    assert_eq!(row.change_type, ChangeType::Decrease);
    assert_eq!(row.journal_type, JournalType::Sale);
    assert_eq!(row.created_by, "u1");

    let events = t.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::StockAdjusted { stock_id, old_quantity: 50, new_quantity: 40, .. } if *stock_id == stock.id
    )));
}

#[tokio::test]
async fn adjusting_up_is_an_increase() {
    let t = TestDb::new().await;
    let product = t.seed_product("Robusta 1kg", 120_000).await;
    let store = t.seed_store("Jakarta").await;
    let stock = t.seed_stock(product.id, store.id, 5).await;

    let updated = t
        .ledger()
        .adjust_stock(
            stock.id,
            AdjustStock::new(7, "warehouse", JournalType::Purchase).with_note("restock"),
        )
        .await
        .unwrap();
    assert_eq!(updated.quantity, 12);

    let last = t.history(stock.id).await.pop().unwrap();
    assert_eq!(last.change_type, ChangeType::Increase);
    assert_eq!(last.note.as_deref(), Some("restock"));
}

#[tokio::test]
async fn adjusting_below_zero_is_rejected_without_side_effects() {
    let t = TestDb::new().await;
    let product = t.seed_product("Filter paper", 30_000).await;
    let store = t.seed_store("Surabaya").await;
    let stock = t.seed_stock(product.id, store.id, 3).await;

    let err = t
        .ledger()
        .adjust_stock(stock.id, AdjustStock::new(-4, "u1", JournalType::Sale))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    assert_eq!(t.stock(stock.id).await.quantity, 3);
    assert_eq!(t.history(stock.id).await.len(), 1);
}

#[tokio::test]
async fn manual_correction_may_go_negative() {
    let t = TestDb::new().await;
    let product = t.seed_product("Grinder", 900_000).await;
    let store = t.seed_store("Medan").await;
    let stock = t.seed_stock(product.id, store.id, 1).await;

    let updated = t
        .ledger()
        .adjust_stock(
            stock.id,
            AdjustStock::new(-3, "admin:rina", JournalType::Adjustment).allowing_negative(),
        )
        .await
        .unwrap();
    assert_eq!(updated.quantity, -2);

    // Negative rows never count as sellable
    assert_eq!(t.ledger().available_quantity(product.id).await.unwrap(), 0);
}

#[tokio::test]
async fn zero_delta_is_a_validation_error() {
    let t = TestDb::new().await;
    let product = t.seed_product("Scale", 250_000).await;
    let store = t.seed_store("Bali").await;
    let stock = t.seed_stock(product.id, store.id, 4).await;

    let err = t
        .ledger()
        .adjust_stock(stock.id, AdjustStock::new(0, "u1", JournalType::Adjustment))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn unknown_stock_is_not_found() {
    let t = TestDb::new().await;
    let err = t
        .ledger()
        .adjust_stock(Uuid::new_v4(), AdjustStock::new(1, "u1", JournalType::Purchase))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn adjust_by_product_and_store() {
    let t = TestDb::new().await;
    let product = t.seed_product("Kettle", 400_000).await;
    let store = t.seed_store("Yogyakarta").await;
    t.seed_stock(product.id, store.id, 2).await;

    let updated = t
        .ledger()
        .adjust_stock_for(
            product.id,
            store.id,
            AdjustStock::new(8, "u1", JournalType::Purchase),
        )
        .await
        .unwrap();
    assert_eq!(updated.quantity, 10);

    let other_store = t.seed_store("Malang").await;
    let err = t
        .ledger()
        .adjust_stock_for(
            product.id,
            other_store.id,
            AdjustStock::new(1, "u1", JournalType::Purchase),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn creating_a_second_row_for_the_same_pair_conflicts() {
    let t = TestDb::new().await;
    let product = t.seed_product("Dripper", 150_000).await;
    let store = t.seed_store("Semarang").await;
    let stock = t.seed_stock(product.id, store.id, 6).await;

    let first = t.history(stock.id).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].quantity_old, 0);
    assert_eq!(first[0].quantity_new, 6);
    assert_eq!(first[0].journal_type, JournalType::Purchase);

    let err = t
        .ledger()
        .create_stock(product.id, store.id, 1, "seed")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));
}

#[tokio::test]
async fn creating_stock_for_missing_product_fails() {
    let t = TestDb::new().await;
    let store = t.seed_store("Makassar").await;
    let err = t
        .ledger()
        .create_stock(Uuid::new_v4(), store.id, 1, "seed")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn set_absolute_writes_an_adjustment_row() {
    let t = TestDb::new().await;
    let product = t.seed_product("Milk jug", 95_000).await;
    let store = t.seed_store("Depok").await;
    let stock = t.seed_stock(product.id, store.id, 9).await;

    let updated = t
        .ledger()
        .set_absolute(stock.id, 4, "admin:budi", Some("stock take".into()))
        .await
        .unwrap();
    assert_eq!(updated.quantity, 4);

    let last = t.history(stock.id).await.pop().unwrap();
    assert_eq!(last.quantity_old, 9);
    assert_eq!(last.quantity_diff, -5);
    assert_eq!(last.quantity_new, 4);
    assert_eq!(last.change_type, ChangeType::Adjustment);
    assert_eq!(last.journal_type, JournalType::Adjustment);
    assert_eq!(last.created_by, "admin:budi");
}

#[tokio::test]
async fn set_absolute_rejects_negative_targets() {
    let t = TestDb::new().await;
    let product = t.seed_product("Tamper", 175_000).await;
    let store = t.seed_store("Bogor").await;
    let stock = t.seed_stock(product.id, store.id, 2).await;

    let err = t
        .ledger()
        .set_absolute(stock.id, -1, "admin", None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn stale_compare_and_swap_fails_and_writes_nothing() {
    let t = TestDb::new().await;
    let product = t.seed_product("Mug", 60_000).await;
    let store = t.seed_store("Solo").await;
    let stale = t.seed_stock(product.id, store.id, 10).await;

    // Someone else moves the row after `stale` was read
    t.ledger()
        .adjust_stock(stale.id, AdjustStock::new(-1, "other", JournalType::Sale))
        .await
        .unwrap();
    let history_before = t.history(stale.id).await.len();

    let err = apply_delta(
        t.db.as_ref(),
        &stale,
        -2,
        &LedgerEntry::new("u1", JournalType::Sale),
        false,
    )
    .await
    .unwrap_err();

    assert_matches!(err, ServiceError::ConcurrentModification(id) if id == stale.id);
    assert!(err.is_retryable());
    assert_eq!(t.stock(stale.id).await.quantity, 9);
    assert_eq!(t.history(stale.id).await.len(), history_before);
}

#[tokio::test]
async fn every_history_row_balances() {
    let t = TestDb::new().await;
    let product = t.seed_product("Syrup", 70_000).await;
    let store = t.seed_store("Cirebon").await;
    let stock = t.seed_stock(product.id, store.id, 20).await;
    let ledger = t.ledger();

    for delta in [-3, 5, -7, 1, -2] {
        ledger
            .adjust_stock(stock.id, AdjustStock::new(delta, "u1", JournalType::Adjustment))
            .await
            .unwrap();
    }
    ledger.set_absolute(stock.id, 30, "admin", None).await.unwrap();

    let history = t.history(stock.id).await;
    assert_eq!(history.len(), 7);
    for row in &history {
        assert_eq!(row.quantity_old + row.quantity_diff, row.quantity_new);
    }
    assert_eq!(history.last().unwrap().quantity_new, t.stock(stock.id).await.quantity);
}

#[tokio::test]
async fn set_absolute_rejects_an_out_of_range_diff() {
    let t = TestDb::new().await;
    let product = t.seed_product("Scale", 320_000).await;
    let store = t.seed_store("Depok").await;
    let stock = t.seed_stock(product.id, store.id, 0).await;
    t.ledger()
        .adjust_stock(
            stock.id,
            AdjustStock::new(-5, "admin", JournalType::Adjustment).allowing_negative(),
        )
        .await
        .unwrap();
    let history_before = t.history(stock.id).await.len();

    let err = t
        .ledger()
        .set_absolute(stock.id, i32::MAX, "admin", None)
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::ValidationError(_));
    assert_eq!(t.stock(stock.id).await.quantity, -5);
    assert_eq!(t.history(stock.id).await.len(), history_before);
}
