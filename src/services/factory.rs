use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::{DbPool, RetryPolicy},
    events::EventSender,
    services::{
        discounts::DiscountEngine, order_status::OrderStatusService, orders::OrderService,
        stock_ledger::StockLedger,
    },
};

/// Builds services that share one pool, retry policy and event channel.
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    retry: RetryPolicy,
    payment_window: chrono::Duration,
}

impl ServiceFactory {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        retry: RetryPolicy,
        payment_window: chrono::Duration,
    ) -> Self {
        Self {
            db_pool,
            event_sender: Arc::new(event_sender),
            retry,
            payment_window,
        }
    }

    /// Takes the retry policy and payment window from configuration.
    pub fn from_config(db_pool: Arc<DbPool>, event_sender: EventSender, config: &AppConfig) -> Self {
        Self::new(
            db_pool,
            event_sender,
            config.retry_policy(),
            config.payment_window(),
        )
    }

    pub fn stock_ledger(&self) -> StockLedger {
        StockLedger::new(
            self.db_pool.clone(),
            self.retry.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn discount_engine(&self) -> DiscountEngine {
        DiscountEngine::new(self.db_pool.clone())
    }

    pub fn order_service(&self) -> OrderService {
        OrderService::new(
            self.db_pool.clone(),
            self.retry.clone(),
            self.event_sender.clone(),
            self.payment_window,
        )
    }

    pub fn order_status_service(&self) -> OrderStatusService {
        OrderStatusService::new(
            self.db_pool.clone(),
            self.retry.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }

    pub fn event_sender(&self) -> &Arc<EventSender> {
        &self.event_sender
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub stock: Arc<StockLedger>,
    pub discounts: Arc<DiscountEngine>,
    pub orders: Arc<OrderService>,
    pub order_status: Arc<OrderStatusService>,
}

impl ServiceContainer {
    pub fn new(factory: &ServiceFactory) -> Self {
        Self {
            stock: Arc::new(factory.stock_ledger()),
            discounts: Arc::new(factory.discount_engine()),
            orders: Arc::new(factory.order_service()),
            order_status: Arc::new(factory.order_status_service()),
        }
    }
}
