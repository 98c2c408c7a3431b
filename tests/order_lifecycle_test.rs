mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::TestDb;
use sea_orm::{ActiveModelTrait, Set};
use storefront_core::{
    db::RetryPolicy,
    entities::{
        order::{OrderStatus, PaymentMethod},
        order_item_allocation,
        stock_history::{ChangeType, JournalType},
    },
    errors::ServiceError,
    events::Event,
    jobs::{run_auto_confirm_pass, run_expiry_pass, JobReport},
    services::{
        order_status::{Actor, PAYMENT_GATEWAY_ACTOR},
        orders::{CreateOrderInput, OrderDetails},
        stock_ledger::SYSTEM_ACTOR,
    },
};
use uuid::Uuid;

/// Places a one-line order of `quantity` units from a fresh store.
async fn place_order(
    t: &TestDb,
    user: Uuid,
    quantity: i32,
    payment_method: PaymentMethod,
) -> (OrderDetails, Uuid) {
    let product = t.seed_product("Kopi Tubruk", 50_000).await;
    let store = t.seed_store("Pasar Baru").await;
    let stock = t.seed_stock(product.id, store.id, 10).await;
    t.seed_cart(user, &[(&product, quantity)]).await;

    let details = t
        .orders()
        .create_order(
            user,
            CreateOrderInput {
                coupon_codes: Vec::new(),
                store_id: Some(store.id),
                payment_method,
            },
        )
        .await
        .unwrap();
    (details, stock.id)
}

#[tokio::test]
async fn one_broken_order_does_not_stop_the_expiry_pass() {
    let t = TestDb::new().await;
    let (broken, _) = place_order(&t, Uuid::new_v4(), 1, PaymentMethod::BankTransfer).await;
    let (healthy, healthy_stock) =
        place_order(&t, Uuid::new_v4(), 2, PaymentMethod::BankTransfer).await;

    // Restocking the first order cannot find its stock row
    let mut allocation: order_item_allocation::ActiveModel =
        broken.allocations[0].clone().into();
    allocation.stock_id = Set(Uuid::new_v4());
    allocation.update(t.db.as_ref()).await.unwrap();

    let later = Utc::now() + Duration::hours(2);
    let report = run_expiry_pass(&t.db, &RetryPolicy::immediate(3), &t.events, later)
        .await
        .unwrap();

    assert_eq!(
        report,
        JobReport {
            selected: 2,
            succeeded: 1,
            skipped: 0,
            failed: 1
        }
    );

    let orders = t.orders();
    let broken = orders.get_order(broken.order.id).await.unwrap().order;
    assert_eq!(broken.status, OrderStatus::WaitingForPayment);
    assert_eq!(orders.status_history(broken.id).await.unwrap().len(), 1);

    let healthy = orders.get_order(healthy.order.id).await.unwrap().order;
    assert_eq!(healthy.status, OrderStatus::Cancelled);
    assert_eq!(t.stock(healthy_stock).await.quantity, 10);
}

#[tokio::test]
async fn expiry_cancels_unpaid_orders_and_restocks() {
    let mut t = TestDb::new().await;
    let user = Uuid::new_v4();
    let (details, stock_id) = place_order(&t, user, 3, PaymentMethod::BankTransfer).await;
    assert_eq!(t.stock(stock_id).await.quantity, 7);
    t.drain_events();

    let history_before = t.history(stock_id).await.len();
    let later = Utc::now() + Duration::hours(2);
    let report = run_expiry_pass(&t.db, &RetryPolicy::immediate(3), &t.events, later)
        .await
        .unwrap();

    assert_eq!(
        report,
        JobReport {
            selected: 1,
            succeeded: 1,
            skipped: 0,
            failed: 0
        }
    );

    let order = t.orders().get_order(details.order.id).await.unwrap().order;
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(t.stock(stock_id).await.quantity, 10);

    let history = t.history(stock_id).await;
    assert_eq!(history.len(), history_before + 1);
    let restock = history.last().unwrap();
    assert_eq!(restock.change_type, ChangeType::Increase);
    assert_eq!(restock.journal_type, JournalType::Return);
    assert_eq!(restock.quantity_diff, 3);
    assert_eq!(restock.created_by, SYSTEM_ACTOR);

    let log = t.orders().status_history(order.id).await.unwrap();
    let last = log.last().unwrap();
    assert_eq!(last.old_status, Some(OrderStatus::WaitingForPayment));
    assert_eq!(last.new_status, OrderStatus::Cancelled);
    assert_eq!(last.changed_by, SYSTEM_ACTOR);

    let events = t.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::OrderCancelled { order_id, .. } if *order_id == order.id)));
}

#[tokio::test]
async fn expiry_ignores_open_windows_and_gateway_orders() {
    let t = TestDb::new().await;
    let (open, _) = place_order(&t, Uuid::new_v4(), 1, PaymentMethod::BankTransfer).await;
    let (gateway, _) = place_order(&t, Uuid::new_v4(), 1, PaymentMethod::PaymentGateway).await;

    let report = run_expiry_pass(&t.db, &RetryPolicy::immediate(3), &t.events, Utc::now())
        .await
        .unwrap();
    assert_eq!(report.selected, 0);

    // Even after the window, gateway orders are left to the gateway
    let later = Utc::now() + Duration::hours(2);
    let report = run_expiry_pass(&t.db, &RetryPolicy::immediate(3), &t.events, later)
        .await
        .unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.succeeded, 1);

    let open = t.orders().get_order(open.order.id).await.unwrap().order;
    let gateway = t.orders().get_order(gateway.order.id).await.unwrap().order;
    assert_eq!(open.status, OrderStatus::Cancelled);
    assert_eq!(gateway.status, OrderStatus::WaitingForPayment);
}

#[tokio::test]
async fn expiry_is_idempotent() {
    let t = TestDb::new().await;
    let (_, stock_id) = place_order(&t, Uuid::new_v4(), 2, PaymentMethod::BankTransfer).await;
    let later = Utc::now() + Duration::hours(2);
    let policy = RetryPolicy::immediate(3);

    run_expiry_pass(&t.db, &policy, &t.events, later).await.unwrap();
    let second = run_expiry_pass(&t.db, &policy, &t.events, later).await.unwrap();

    assert_eq!(second.selected, 0);
    assert_eq!(t.stock(stock_id).await.quantity, 10);
}

#[tokio::test]
async fn paid_orders_are_not_expired() {
    let t = TestDb::new().await;
    let (details, stock_id) = place_order(&t, Uuid::new_v4(), 2, PaymentMethod::BankTransfer).await;
    t.order_status()
        .confirm_payment(details.order.id, &Actor::Admin("ops".into()))
        .await
        .unwrap();

    let later = Utc::now() + Duration::hours(2);
    let report = run_expiry_pass(&t.db, &RetryPolicy::immediate(3), &t.events, later)
        .await
        .unwrap();
    assert_eq!(report.selected, 0);
    assert_eq!(t.stock(stock_id).await.quantity, 8);
}

#[tokio::test]
async fn auto_confirm_moves_old_deliveries_once() {
    let t = TestDb::new().await;
    let (details, stock_id) = place_order(&t, Uuid::new_v4(), 1, PaymentMethod::BankTransfer).await;
    let status = t.order_status();
    let admin = Actor::Admin("ops".into());
    status.confirm_payment(details.order.id, &admin).await.unwrap();
    status.mark_delivered(details.order.id, &admin).await.unwrap();

    let three_days_later = Utc::now() + Duration::days(3);
    let report = run_auto_confirm_pass(&t.db, &t.events, three_days_later, Duration::days(2))
        .await
        .unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.succeeded, 1);

    let order = t.orders().get_order(details.order.id).await.unwrap().order;
    assert_eq!(order.status, OrderStatus::OrderConfirmation);
    assert_eq!(t.stock(stock_id).await.quantity, 9);

    let last = t.orders().status_history(order.id).await.unwrap().pop().unwrap();
    assert_eq!(last.changed_by, SYSTEM_ACTOR);
    assert_eq!(last.old_status, Some(OrderStatus::Delivered));

    let again = run_auto_confirm_pass(&t.db, &t.events, three_days_later, Duration::days(2))
        .await
        .unwrap();
    assert_eq!(again, JobReport::default());
}

#[tokio::test]
async fn auto_confirm_waits_for_the_grace_period() {
    let t = TestDb::new().await;
    let (details, _) = place_order(&t, Uuid::new_v4(), 1, PaymentMethod::BankTransfer).await;
    let status = t.order_status();
    let admin = Actor::Admin("ops".into());
    status.confirm_payment(details.order.id, &admin).await.unwrap();
    status.mark_delivered(details.order.id, &admin).await.unwrap();

    let report = run_auto_confirm_pass(&t.db, &t.events, Utc::now(), Duration::days(2))
        .await
        .unwrap();
    assert_eq!(report.selected, 0);
}

#[tokio::test]
async fn cancelling_returns_every_allocation() {
    let t = TestDb::new().await;
    let user = Uuid::new_v4();
    let beans = t.seed_product("Toraja", 120_000).await;
    let a = t.seed_store("A").await;
    let b = t.seed_store("B").await;
    let stock_a = t.seed_stock(beans.id, a.id, 4).await;
    let stock_b = t.seed_stock(beans.id, b.id, 3).await;
    t.seed_cart(user, &[(&beans, 6)]).await;

    let details = t
        .orders()
        .create_order(
            user,
            CreateOrderInput {
                coupon_codes: Vec::new(),
                store_id: None,
                payment_method: PaymentMethod::BankTransfer,
            },
        )
        .await
        .unwrap();
    assert_eq!(details.allocations.len(), 2);

    let order = t
        .order_status()
        .cancel_order(details.order.id, &Actor::Customer(user), Some("changed my mind".into()))
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);

    assert_eq!(t.stock(stock_a.id).await.quantity, 4);
    assert_eq!(t.stock(stock_b.id).await.quantity, 3);

    for stock_id in [stock_a.id, stock_b.id] {
        let returns: Vec<_> = t
            .history(stock_id)
            .await
            .into_iter()
            .filter(|row| row.journal_type == JournalType::Return)
            .collect();
        assert_eq!(returns.len(), 1);
        assert_eq!(returns[0].change_type, ChangeType::Increase);
        assert_eq!(returns[0].created_by, user.to_string());
    }
}

#[tokio::test]
async fn customers_cannot_cancel_other_orders() {
    let t = TestDb::new().await;
    let owner = Uuid::new_v4();
    let (details, _) = place_order(&t, owner, 1, PaymentMethod::BankTransfer).await;

    let err = t
        .order_status()
        .cancel_order(details.order.id, &Actor::Customer(Uuid::new_v4()), None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(_));
}

#[tokio::test]
async fn invalid_transitions_are_rejected() {
    let t = TestDb::new().await;
    let (details, _) = place_order(&t, Uuid::new_v4(), 1, PaymentMethod::BankTransfer).await;
    let status = t.order_status();
    let admin = Actor::Admin("ops".into());

    let err = status.mark_delivered(details.order.id, &admin).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));

    status.confirm_payment(details.order.id, &admin).await.unwrap();
    let err = status
        .cancel_order(details.order.id, &admin, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));

    let log = t.orders().status_history(details.order.id).await.unwrap();
    assert_eq!(log.len(), 2);
}

#[tokio::test]
async fn buyer_confirms_receipt() {
    let t = TestDb::new().await;
    let user = Uuid::new_v4();
    let (details, _) = place_order(&t, user, 1, PaymentMethod::BankTransfer).await;
    let status = t.order_status();
    let admin = Actor::Admin("ops".into());
    status.confirm_payment(details.order.id, &admin).await.unwrap();
    status.mark_delivered(details.order.id, &admin).await.unwrap();

    let err = status
        .confirm_received(details.order.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(_));

    let order = status.confirm_received(details.order.id, user).await.unwrap();
    assert_eq!(order.status, OrderStatus::OrderConfirmation);
}

#[tokio::test]
async fn payment_proof_rules() {
    let t = TestDb::new().await;
    let user = Uuid::new_v4();
    let (details, _) = place_order(&t, user, 1, PaymentMethod::BankTransfer).await;
    let status = t.order_status();

    let err = status
        .submit_payment_proof(details.order.id, user, "   ".into())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let err = status
        .submit_payment_proof(details.order.id, Uuid::new_v4(), "receipt.jpg".into())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(_));

    let order = status
        .submit_payment_proof(details.order.id, user, "receipt.jpg".into())
        .await
        .unwrap();
    assert_eq!(order.payment_proof.as_deref(), Some("receipt.jpg"));
    assert_eq!(order.status, OrderStatus::WaitingForPayment);

    let gateway_user = Uuid::new_v4();
    let (gateway, _) = place_order(&t, gateway_user, 1, PaymentMethod::PaymentGateway).await;
    let err = status
        .submit_payment_proof(gateway.order.id, gateway_user, "receipt.jpg".into())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));
}

#[tokio::test]
async fn gateway_notifications_drive_the_order() {
    let t = TestDb::new().await;
    let (paid, _) = place_order(&t, Uuid::new_v4(), 1, PaymentMethod::PaymentGateway).await;
    let (denied, denied_stock) =
        place_order(&t, Uuid::new_v4(), 2, PaymentMethod::PaymentGateway).await;
    let status = t.order_status();

    let order = status
        .apply_payment_notification(paid.order.id, "pending")
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::WaitingForPayment);
    assert_eq!(t.orders().status_history(paid.order.id).await.unwrap().len(), 1);

    let order = status
        .apply_payment_notification(paid.order.id, "Settlement")
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::InProcess);
    let last = t.orders().status_history(paid.order.id).await.unwrap().pop().unwrap();
    assert_eq!(last.changed_by, PAYMENT_GATEWAY_ACTOR);

    let order = status
        .apply_payment_notification(denied.order.id, "deny")
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(t.stock(denied_stock).await.quantity, 10);

    let err = status
        .apply_payment_notification(paid.order.id, "refunded-ish")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}
