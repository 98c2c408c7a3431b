#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, Set};
use storefront_core::{
    db::{self, DbConfig, DbPool, RetryPolicy},
    entities::{cart, cart_item, discount::DiscountType, order, product, stock, stock_history, store},
    events::{Event, EventSender},
    services::{
        discounts::{DiscountEngine, NewDiscount},
        factory::ServiceFactory,
        order_status::OrderStatusService,
        orders::OrderService,
        stock_ledger::StockLedger,
    },
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A migrated SQLite database in a temp directory plus the shared services.
pub struct TestDb {
    pub db: Arc<DbPool>,
    pub events: Arc<EventSender>,
    event_rx: mpsc::Receiver<Event>,
    _dir: TempDir,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("storefront_test.db");

        // One connection: SQLite serialises writers anyway, and a transaction
        // holding the only connection makes lock errors impossible.
        let config = DbConfig {
            url: format!("sqlite://{}?mode=rwc", path.display()),
            max_connections: 1,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            ..Default::default()
        };

        let pool = db::establish_connection_with_config(&config)
            .await
            .expect("failed to open test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations");

        let (tx, event_rx) = mpsc::channel(4096);

        Self {
            db: Arc::new(pool),
            events: Arc::new(EventSender::new(tx)),
            event_rx,
            _dir: dir,
        }
    }

    pub fn factory(&self) -> ServiceFactory {
        ServiceFactory::new(
            self.db.clone(),
            self.events.as_ref().clone(),
            RetryPolicy::immediate(3),
            chrono::Duration::hours(1),
        )
    }

    pub fn ledger(&self) -> StockLedger {
        self.factory().stock_ledger()
    }

    pub fn orders(&self) -> OrderService {
        self.factory().order_service()
    }

    pub fn order_status(&self) -> OrderStatusService {
        self.factory().order_status_service()
    }

    pub fn discounts(&self) -> DiscountEngine {
        self.factory().discount_engine()
    }

    /// Events published so far, oldest first.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn seed_product(&self, name: &str, price: i64) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price: Set(Decimal::from(price)),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
        .expect("failed to insert product")
    }

    pub async fn seed_store(&self, name: &str) -> store::Model {
        let now = Utc::now();
        store::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
        .expect("failed to insert store")
    }

    pub async fn seed_stock(&self, product_id: Uuid, store_id: Uuid, quantity: i32) -> stock::Model {
        self.ledger()
            .create_stock(product_id, store_id, quantity, "seed")
            .await
            .expect("failed to create stock")
    }

    /// Creates an active cart holding `lines` of (product, quantity).
    pub async fn seed_cart(&self, user_id: Uuid, lines: &[(&product::Model, i32)]) -> cart::Model {
        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
        .expect("failed to insert cart");

        for (i, (product, quantity)) in lines.iter().enumerate() {
            cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                product_id: Set(product.id),
                quantity: Set(*quantity),
                price: Set(product.price),
                sub_total: Set(product.price * Decimal::from(*quantity)),
                created_at: Set(now + chrono::Duration::milliseconds(i as i64)),
            }
            .insert(self.db.as_ref())
            .await
            .expect("failed to insert cart item");
        }

        cart
    }

    pub async fn seed_discount(&self, input: NewDiscount) -> storefront_core::entities::discount::Model {
        self.discounts()
            .create_discount(input)
            .await
            .expect("failed to create discount")
    }

    pub async fn stock(&self, stock_id: Uuid) -> stock::Model {
        stock::Entity::find_by_id(stock_id)
            .one(self.db.as_ref())
            .await
            .expect("query failed")
            .expect("stock missing")
    }

    pub async fn history(&self, stock_id: Uuid) -> Vec<stock_history::Model> {
        self.ledger().history(stock_id).await.expect("history failed")
    }

    pub async fn order_count(&self) -> u64 {
        order::Entity::find()
            .count(self.db.as_ref())
            .await
            .expect("count failed")
    }

    pub async fn history_count(&self) -> u64 {
        stock_history::Entity::find()
            .count(self.db.as_ref())
            .await
            .expect("count failed")
    }

    pub async fn active_cart(&self, user_id: Uuid) -> Option<cart::Model> {
        cart::Entity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .filter(cart::Column::IsActive.eq(true))
            .one(self.db.as_ref())
            .await
            .expect("query failed")
    }
}

/// A fixed-amount discount starting yesterday with no limits.
pub fn discount(code: &str, kind: DiscountType, value: i64) -> NewDiscount {
    NewDiscount {
        code: code.to_string(),
        name: format!("{code} promo"),
        discount_type: kind,
        is_percentage: false,
        value: Decimal::from(value),
        min_spend: None,
        buy_quantity: None,
        get_quantity: None,
        product_id: None,
        max_uses: None,
        max_uses_per_user: None,
        starts_at: Utc::now() - chrono::Duration::days(1),
        ends_at: None,
    }
}
