//! storefront-core
//!
//! Inventory ledger, discount engine and order lifecycle for a multi-store
//! online shop.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod jobs;
pub mod migrator;
pub mod services;

pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::db::{DbPool, RetryPolicy};
    pub use crate::entities::order::{OrderStatus, PaymentMethod};
    pub use crate::entities::stock_history::{ChangeType, JournalType};
    pub use crate::errors::{ErrorKind, ServiceError};
    pub use crate::events::{Event, EventSender};
    pub use crate::services::{
        discounts::DiscountEngine,
        factory::{ServiceContainer, ServiceFactory},
        order_status::{Actor, OrderStatusService},
        orders::{CreateOrderInput, OrderService},
        stock_ledger::{AdjustStock, StockLedger},
    };
}
