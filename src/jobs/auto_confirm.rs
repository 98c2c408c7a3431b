use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use tracing::{info, instrument, warn};

use super::JobReport;
use crate::{
    db::{with_transaction, DbPool},
    entities::order::{self, OrderStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        order_status::{find_order_in, set_status_in},
        stock_ledger::SYSTEM_ACTOR,
    },
};

pub const AUTO_CONFIRM_NOTE: &str = "confirmed automatically";

/// Confirms delivered orders the customer never acknowledged.
///
/// An order qualifies once it was created more than `grace` before `now`.
#[instrument(skip(db, events))]
pub async fn run_auto_confirm_pass(
    db: &DbPool,
    events: &EventSender,
    now: DateTime<Utc>,
    grace: Duration,
) -> Result<JobReport, ServiceError> {
    let cutoff = now - grace;
    let candidates = order::Entity::find()
        .filter(order::Column::Status.eq(OrderStatus::Delivered))
        .filter(order::Column::CreatedAt.lt(cutoff))
        .order_by_asc(order::Column::CreatedAt)
        .all(db)
        .await?;

    let mut report = JobReport::selected(candidates.len());

    for candidate in candidates {
        let order_id = candidate.id;
        let outcome = with_transaction(db, |txn| {
            Box::pin(async move {
                let order = find_order_in(txn, order_id).await?;
                if order.status != OrderStatus::Delivered {
                    return Ok::<_, ServiceError>(None);
                }
                set_status_in(
                    txn,
                    &order,
                    OrderStatus::OrderConfirmation,
                    SYSTEM_ACTOR,
                    Some(AUTO_CONFIRM_NOTE),
                )
                .await
            })
        })
        .await;

        match outcome {
            Ok(Some(_)) => {
                report.succeeded += 1;
                counter!("storefront.orders.auto_confirmed", 1);
                info!(%order_id, "Auto-confirmed delivered order");
                events
                    .emit(Event::OrderStatusChanged {
                        order_id,
                        old_status: OrderStatus::Delivered,
                        new_status: OrderStatus::OrderConfirmation,
                        changed_by: SYSTEM_ACTOR.to_string(),
                    })
                    .await;
            }
            Ok(None) => report.skipped += 1,
            Err(e) => {
                report.failed += 1;
                warn!(%order_id, error = %e, "Failed to auto-confirm order");
            }
        }
    }

    report.log("order_auto_confirm");
    Ok(report)
}
