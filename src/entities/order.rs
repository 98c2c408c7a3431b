use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Order lifecycle.
///
/// `WaitingForPayment -> InProcess -> Delivered -> OrderConfirmation`, or
/// `WaitingForPayment -> Cancelled`. A gateway "pending" notification may
/// move an `InProcess` order back to `WaitingForPayment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[sea_orm(string_value = "WAITING_FOR_PAYMENT")]
    WaitingForPayment,
    #[sea_orm(string_value = "IN_PROCESS")]
    InProcess,
    #[sea_orm(string_value = "DELIVERED")]
    Delivered,
    #[sea_orm(string_value = "ORDER_CONFIRMATION")]
    OrderConfirmation,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::WaitingForPayment => "WAITING_FOR_PAYMENT",
            OrderStatus::InProcess => "IN_PROCESS",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::OrderConfirmation => "ORDER_CONFIRMATION",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::OrderConfirmation | OrderStatus::Cancelled)
    }

    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, to),
            (WaitingForPayment, InProcess)
                | (WaitingForPayment, Cancelled)
                | (InProcess, WaitingForPayment)
                | (InProcess, Delivered)
                | (Delivered, OrderConfirmation)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    /// Manual transfer, confirmed by an uploaded proof; subject to expiry
    #[sea_orm(string_value = "BANK_TRANSFER")]
    BankTransfer,
    /// Hosted gateway, confirmed by webhook notifications
    #[sea_orm(string_value = "PAYMENT_GATEWAY")]
    PaymentGateway,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    /// Set when the buyer picked a store; otherwise stock was allocated across stores
    #[sea_orm(nullable)]
    pub store_id: Option<Uuid>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub discount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub final_price: Decimal,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    #[sea_orm(nullable)]
    pub payment_proof: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
    #[sea_orm(has_many = "super::order_status_log::Entity")]
    StatusLogs,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::order_status_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StatusLogs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Iterable;

    #[test]
    fn happy_path_transitions_are_allowed() {
        use OrderStatus::*;
        assert!(WaitingForPayment.can_transition_to(InProcess));
        assert!(InProcess.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(OrderConfirmation));
        assert!(WaitingForPayment.can_transition_to(Cancelled));
        assert!(InProcess.can_transition_to(WaitingForPayment));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [OrderStatus::OrderConfirmation, OrderStatus::Cancelled] {
            assert!(from.is_terminal());
            for to in OrderStatus::iter() {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn cancellation_only_before_payment() {
        assert!(!OrderStatus::InProcess.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::WaitingForPayment.can_transition_to(OrderStatus::Delivered));
    }
}
