use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use tracing::{info, instrument, warn};

use super::JobReport;
use crate::{
    db::{retryable_transaction, DbPool, RetryPolicy},
    entities::order::{self, OrderStatus, PaymentMethod},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        order_status::{cancel_in, find_order_in},
        stock_ledger::SYSTEM_ACTOR,
    },
};

pub const EXPIRY_NOTE: &str = "expired, no payment";

/// Cancels unpaid bank-transfer orders whose payment window closed before `now`.
///
/// Each order is cancelled in its own transaction, which also returns its
/// allocated units to stock. Orders that changed status since selection are
/// counted as skipped.
#[instrument(skip(db, retry, events))]
pub async fn run_expiry_pass(
    db: &DbPool,
    retry: &RetryPolicy,
    events: &EventSender,
    now: DateTime<Utc>,
) -> Result<JobReport, ServiceError> {
    let candidates = order::Entity::find()
        .filter(order::Column::Status.eq(OrderStatus::WaitingForPayment))
        .filter(order::Column::PaymentMethod.eq(PaymentMethod::BankTransfer))
        .filter(order::Column::ExpiredAt.lt(now))
        .order_by_asc(order::Column::ExpiredAt)
        .all(db)
        .await?;

    let mut report = JobReport::selected(candidates.len());

    for candidate in candidates {
        let order_id = candidate.id;
        let outcome = retryable_transaction(db, retry, "expire_order", |txn| {
            Box::pin(async move {
                let order = find_order_in(txn, order_id).await?;
                if order.status != OrderStatus::WaitingForPayment {
                    return Ok(None);
                }
                cancel_in(txn, &order, SYSTEM_ACTOR, Some(EXPIRY_NOTE)).await
            })
        })
        .await;

        match outcome {
            Ok(Some(change)) => {
                report.succeeded += 1;
                counter!("storefront.orders.expired", 1);
                info!(
                    %order_id,
                    restocked_units = change.restocked_units,
                    "Expired unpaid order"
                );
                events
                    .emit(Event::OrderStatusChanged {
                        order_id,
                        old_status: change.old_status,
                        new_status: OrderStatus::Cancelled,
                        changed_by: SYSTEM_ACTOR.to_string(),
                    })
                    .await;
                events
                    .emit(Event::OrderCancelled {
                        order_id,
                        reason: EXPIRY_NOTE.to_string(),
                    })
                    .await;
            }
            Ok(None) => {
                report.skipped += 1;
                info!(%order_id, "Order left WAITING_FOR_PAYMENT before expiry, skipping");
            }
            Err(e) => {
                report.failed += 1;
                warn!(%order_id, error = %e, "Failed to expire order");
            }
        }
    }

    report.log("order_expiry");
    Ok(report)
}
