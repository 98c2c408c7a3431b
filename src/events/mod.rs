use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entities::order::OrderStatus;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Publishes an event for a change that has already committed.
    ///
    /// A delivery failure is logged and swallowed: the data change stands.
    pub async fn emit(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "Dropping domain event");
        }
    }
}

/// Domain events published after a successful commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
        final_price: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
        changed_by: String,
    },
    OrderCancelled {
        order_id: Uuid,
        reason: String,
    },
    StockAdjusted {
        stock_id: Uuid,
        product_id: Uuid,
        store_id: Uuid,
        old_quantity: i32,
        new_quantity: i32,
    },
    StockTransferred {
        transfer_id: Uuid,
        product_id: Uuid,
        from_store_id: Uuid,
        to_store_id: Uuid,
        quantity: i32,
    },
    DiscountRedeemed {
        discount_id: Uuid,
        order_id: Uuid,
        user_id: Uuid,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::StockAdjusted { .. } => "stock_adjusted",
            Event::StockTransferred { .. } => "stock_transferred",
            Event::DiscountRedeemed { .. } => "discount_redeemed",
        }
    }
}

/// Event envelope with the time it was observed by the processor.
#[derive(Debug, Clone, Serialize)]
pub struct ObservedEvent {
    pub event: Event,
    pub observed_at: DateTime<Utc>,
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        let observed = ObservedEvent {
            event,
            observed_at: Utc::now(),
        };

        match &observed.event {
            Event::OrderCreated {
                order_id,
                user_id,
                final_price,
            } => {
                info!(%order_id, %user_id, %final_price, "order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
                changed_by,
            } => {
                info!(%order_id, %old_status, %new_status, changed_by = %changed_by, "order status changed");
            }
            Event::OrderCancelled { order_id, reason } => {
                info!(%order_id, reason = %reason, "order cancelled");
            }
            Event::StockAdjusted {
                stock_id,
                old_quantity,
                new_quantity,
                ..
            } => {
                debug!(%stock_id, old_quantity, new_quantity, "stock adjusted");
            }
            Event::StockTransferred {
                transfer_id,
                product_id,
                from_store_id,
                to_store_id,
                quantity,
            } => {
                info!(%transfer_id, %product_id, %from_store_id, %to_store_id, quantity, "stock transferred");
            }
            Event::DiscountRedeemed {
                discount_id,
                order_id,
                ..
            } => {
                debug!(%discount_id, %order_id, "discount redeemed");
            }
        }

        if let Ok(json) = serde_json::to_string(&observed) {
            debug!(target: "storefront_core::events", payload = %json);
        }
    }

    info!("Event processing loop stopped");
}
