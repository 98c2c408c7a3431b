use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveEnum, ActiveModelTrait, ActiveValue::Set, ColumnTrait,
    ConnectionTrait, EntityTrait, QueryFilter,
};
use strum::EnumString;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::{retryable_transaction, DbPool, RetryPolicy},
    entities::{
        order::{self, Entity as OrderEntity, Model as OrderModel, OrderStatus, PaymentMethod},
        order_item,
        order_item_allocation,
        order_status_log,
        stock_history::JournalType,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::stock_ledger::{apply_delta, find_stock_in, LedgerEntry, SYSTEM_ACTOR},
};

/// Actor recorded for gateway-driven payment transitions.
pub const PAYMENT_GATEWAY_ACTOR: &str = "PAYMENT_GATEWAY";

/// Who is asking for a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Customer(Uuid),
    Admin(String),
    System,
}

impl Actor {
    /// Value written to `changed_by` / `created_by`.
    pub fn label(&self) -> String {
        match self {
            Actor::Customer(id) => id.to_string(),
            Actor::Admin(name) => format!("admin:{}", name),
            Actor::System => SYSTEM_ACTOR.to_string(),
        }
    }
}

/// Transaction status reported by the payment gateway webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum GatewayStatus {
    Capture,
    Settlement,
    Success,
    Pending,
    Deny,
    Cancel,
    Expire,
    Failure,
}

impl GatewayStatus {
    pub fn target_status(&self) -> OrderStatus {
        match self {
            GatewayStatus::Capture | GatewayStatus::Settlement | GatewayStatus::Success => {
                OrderStatus::InProcess
            }
            GatewayStatus::Pending => OrderStatus::WaitingForPayment,
            GatewayStatus::Deny
            | GatewayStatus::Cancel
            | GatewayStatus::Expire
            | GatewayStatus::Failure => OrderStatus::Cancelled,
        }
    }
}

/// Result of a committed status change.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub order: OrderModel,
    pub old_status: OrderStatus,
    /// Units put back on the shelf (cancellations only)
    pub restocked_units: i64,
}

#[derive(Clone)]
pub struct OrderStatusService {
    db: Arc<DbPool>,
    retry: RetryPolicy,
    event_sender: Arc<EventSender>,
}

impl OrderStatusService {
    pub fn new(db: Arc<DbPool>, retry: RetryPolicy, event_sender: Arc<EventSender>) -> Self {
        Self {
            db,
            retry,
            event_sender,
        }
    }

    /// Moves an order to `to`, validating the state machine.
    ///
    /// The update is guarded on the status that was read, so of two
    /// concurrent writers only one can win. Cancelling restocks every
    /// allocation the order holds.
    #[instrument(skip(self, note), fields(order_id = %order_id, to = %to))]
    pub async fn transition(
        &self,
        order_id: Uuid,
        to: OrderStatus,
        actor: &str,
        note: Option<String>,
    ) -> Result<OrderModel, ServiceError> {
        let change = retryable_transaction(&self.db, &self.retry, "order_transition", |txn| {
            let actor = actor.to_string();
            let note = note.clone();
            Box::pin(async move {
                let order = find_order_in(txn, order_id).await?;
                ensure_transition(&order, to)?;

                let change = if to == OrderStatus::Cancelled {
                    cancel_in(txn, &order, &actor, note.as_deref()).await?
                } else {
                    set_status_in(txn, &order, to, &actor, note.as_deref())
                        .await?
                        .map(|updated| StatusChange {
                            order: updated,
                            old_status: order.status,
                            restocked_units: 0,
                        })
                };

                // Lost the status guard; re-read and re-validate
                change.ok_or(ServiceError::ConcurrentModification(order_id))
            })
        })
        .await?;

        self.publish(&change, actor, note.as_deref()).await;
        Ok(change.order)
    }

    /// Stores a bank-transfer payment proof; the status does not change.
    #[instrument(skip(self, proof))]
    pub async fn submit_payment_proof(
        &self,
        order_id: Uuid,
        user_id: Uuid,
        proof: String,
    ) -> Result<OrderModel, ServiceError> {
        let proof = proof.trim().to_string();
        if proof.is_empty() {
            return Err(ServiceError::ValidationError(
                "payment proof must not be empty".to_string(),
            ));
        }

        let order = self.get(order_id).await?;
        ensure_owner(&order, user_id)?;
        if order.payment_method != PaymentMethod::BankTransfer {
            return Err(ServiceError::InvalidStatus(format!(
                "order {} is not paid by bank transfer",
                order_id
            )));
        }
        if order.status != OrderStatus::WaitingForPayment {
            return Err(ServiceError::InvalidStatus(format!(
                "order {} is {} and no longer accepts payment proof",
                order_id, order.status
            )));
        }

        let result = OrderEntity::update_many()
            .col_expr(order::Column::PaymentProof, Expr::value(proof))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::WaitingForPayment))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "order {} changed while the payment proof was submitted",
                order_id
            )));
        }

        info!(%order_id, "Payment proof submitted");
        self.get(order_id).await
    }

    pub async fn confirm_payment(
        &self,
        order_id: Uuid,
        actor: &Actor,
    ) -> Result<OrderModel, ServiceError> {
        self.transition(
            order_id,
            OrderStatus::InProcess,
            &actor.label(),
            Some("payment confirmed".to_string()),
        )
        .await
    }

    pub async fn mark_delivered(
        &self,
        order_id: Uuid,
        actor: &Actor,
    ) -> Result<OrderModel, ServiceError> {
        self.transition(order_id, OrderStatus::Delivered, &actor.label(), None)
            .await
    }

    /// The buyer confirms receipt of a delivered order.
    pub async fn confirm_received(
        &self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<OrderModel, ServiceError> {
        let order = self.get(order_id).await?;
        ensure_owner(&order, user_id)?;

        self.transition(
            order_id,
            OrderStatus::OrderConfirmation,
            &Actor::Customer(user_id).label(),
            Some("received by customer".to_string()),
        )
        .await
    }

    /// Cancels an unpaid order. Customers may only cancel their own orders.
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        actor: &Actor,
        reason: Option<String>,
    ) -> Result<OrderModel, ServiceError> {
        let order = self.get(order_id).await?;
        match actor {
            Actor::Customer(user_id) => ensure_owner(&order, *user_id)?,
            Actor::Admin(_) | Actor::System => {}
        }

        self.transition(order_id, OrderStatus::Cancelled, &actor.label(), reason)
            .await
    }

    /// Applies a payment gateway notification.
    ///
    /// A notification for the status the order already has is a no-op.
    #[instrument(skip(self))]
    pub async fn apply_payment_notification(
        &self,
        order_id: Uuid,
        external_status: &str,
    ) -> Result<OrderModel, ServiceError> {
        let status: GatewayStatus = external_status.trim().parse().map_err(|_| {
            ServiceError::ValidationError(format!(
                "unknown payment status '{}'",
                external_status
            ))
        })?;
        let target = status.target_status();

        let order = self.get(order_id).await?;
        if order.status == target {
            info!(%order_id, status = %target, "Payment notification repeats current status");
            return Ok(order);
        }

        self.transition(
            order_id,
            target,
            PAYMENT_GATEWAY_ACTOR,
            Some(format!("gateway status {}", external_status.trim())),
        )
        .await
    }

    async fn get(&self, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        find_order_in(self.db.as_ref(), order_id).await
    }

    async fn publish(&self, change: &StatusChange, actor: &str, note: Option<&str>) {
        let order = &change.order;
        info!(
            order_id = %order.id,
            from = %change.old_status,
            to = %order.status,
            actor,
            "Order status updated"
        );

        self.event_sender
            .emit(Event::OrderStatusChanged {
                order_id: order.id,
                old_status: change.old_status,
                new_status: order.status,
                changed_by: actor.to_string(),
            })
            .await;

        if order.status == OrderStatus::Cancelled {
            counter!("storefront.orders.cancelled", 1);
            self.event_sender
                .emit(Event::OrderCancelled {
                    order_id: order.id,
                    reason: note.unwrap_or("cancelled").to_string(),
                })
                .await;
        }
    }
}

fn ensure_owner(order: &OrderModel, user_id: Uuid) -> Result<(), ServiceError> {
    if order.user_id != user_id {
        warn!(order_id = %order.id, %user_id, "Order accessed by non-owner");
        return Err(ServiceError::Forbidden(format!(
            "order {} belongs to another customer",
            order.id
        )));
    }
    Ok(())
}

fn ensure_transition(order: &OrderModel, to: OrderStatus) -> Result<(), ServiceError> {
    if !order.status.can_transition_to(to) {
        warn!(order_id = %order.id, from = %order.status, to = %to, "Invalid status transition");
        return Err(ServiceError::InvalidStatus(format!(
            "Cannot transition order {} from {} to {}",
            order.id, order.status, to
        )));
    }
    Ok(())
}

pub async fn find_order_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<OrderModel, ServiceError> {
    OrderEntity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

/// Appends a status log row.
pub async fn append_status_log<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    old_status: Option<OrderStatus>,
    new_status: OrderStatus,
    changed_by: &str,
    note: Option<&str>,
) -> Result<order_status_log::Model, ServiceError> {
    let row = order_status_log::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        old_status: Set(old_status),
        new_status: Set(new_status),
        changed_by: Set(changed_by.to_string()),
        note: Set(note.map(str::to_string)),
        created_at: Set(Utc::now()),
    };
    Ok(row.insert(conn).await?)
}

/// Status-guarded update plus its log row.
///
/// Returns `None` when the order no longer has the status in `order`, which
/// means another writer got there first.
pub async fn set_status_in<C: ConnectionTrait>(
    conn: &C,
    order: &OrderModel,
    to: OrderStatus,
    actor: &str,
    note: Option<&str>,
) -> Result<Option<OrderModel>, ServiceError> {
    ensure_transition(order, to)?;

    let now = Utc::now();
    let result = OrderEntity::update_many()
        .col_expr(order::Column::Status, Expr::value(to.into_value()))
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::Status.eq(order.status))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Ok(None);
    }

    append_status_log(conn, order.id, Some(order.status), to, actor, note).await?;

    Ok(Some(OrderModel {
        status: to,
        updated_at: now,
        ..order.clone()
    }))
}

/// Cancels an order and returns every allocated unit to the stock it came from.
pub async fn cancel_in<C: ConnectionTrait>(
    conn: &C,
    order: &OrderModel,
    actor: &str,
    note: Option<&str>,
) -> Result<Option<StatusChange>, ServiceError> {
    let Some(updated) = set_status_in(conn, order, OrderStatus::Cancelled, actor, note).await?
    else {
        return Ok(None);
    };

    let restocked_units = restock_in(conn, order.id, actor).await?;

    Ok(Some(StatusChange {
        order: updated,
        old_status: order.status,
        restocked_units,
    }))
}

async fn restock_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    actor: &str,
) -> Result<i64, ServiceError> {
    let item_ids: Vec<Uuid> = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|item| item.id)
        .collect();

    if item_ids.is_empty() {
        return Ok(0);
    }

    let allocations = order_item_allocation::Entity::find()
        .filter(order_item_allocation::Column::OrderItemId.is_in(item_ids))
        .all(conn)
        .await?;

    let entry = LedgerEntry::new(actor, JournalType::Return)
        .with_note(format!("order {} cancelled", order_id));

    let mut units = 0i64;
    for allocation in allocations {
        let stock = find_stock_in(conn, allocation.stock_id).await?;
        apply_delta(conn, &stock, allocation.quantity, &entry, true).await?;
        units += allocation.quantity as i64;
    }

    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_statuses_map_onto_order_states() {
        let cases = [
            ("capture", OrderStatus::InProcess),
            ("settlement", OrderStatus::InProcess),
            ("SUCCESS", OrderStatus::InProcess),
            ("pending", OrderStatus::WaitingForPayment),
            ("deny", OrderStatus::Cancelled),
            ("cancel", OrderStatus::Cancelled),
            ("expire", OrderStatus::Cancelled),
            ("failure", OrderStatus::Cancelled),
        ];
        for (raw, expected) in cases {
            let status: GatewayStatus = raw.parse().unwrap();
            assert_eq!(status.target_status(), expected, "{raw}");
        }
        assert!("refund".parse::<GatewayStatus>().is_err());
    }

    #[test]
    fn actor_labels() {
        let id = Uuid::new_v4();
        assert_eq!(Actor::Customer(id).label(), id.to_string());
        assert_eq!(Actor::Admin("ops".into()).label(), "admin:ops");
        assert_eq!(Actor::System.label(), "SYSTEM");
    }
}
