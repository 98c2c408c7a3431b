use crate::{
    db::{retryable_transaction, DbPool, RetryPolicy},
    entities::{
        cart::{self, Entity as Cart},
        cart_item::{self, Entity as CartItem},
        order::{self, OrderStatus, PaymentMethod},
        order_item, order_item_allocation, order_status_log, product,
        stock::{self},
        stock_history::JournalType,
        store,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        discounts::{evaluate_in, record_redemptions, CartLine, DiscountEvaluation},
        order_status::{append_status_log, find_order_in},
        stock_ledger::{apply_delta, eligible_stocks_in, LedgerEntry},
    },
};
use chrono::{Duration, Utc};
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Checkout request for the caller's active cart.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderInput {
    /// Coupon codes, applied in order; blanks are ignored
    #[validate(length(max = 10))]
    #[serde(default)]
    pub coupon_codes: Vec<String>,
    /// Take every line from this store; allocate across stores when None
    pub store_id: Option<Uuid>,
    pub payment_method: PaymentMethod,
}

/// An order with its lines and the stock slices that supplied them.
#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub allocations: Vec<order_item_allocation::Model>,
}

impl OrderDetails {
    pub fn paid_items(&self) -> impl Iterator<Item = &order_item::Model> {
        self.items.iter().filter(|i| !i.is_bonus)
    }

    pub fn bonus_items(&self) -> impl Iterator<Item = &order_item::Model> {
        self.items.iter().filter(|i| i.is_bonus)
    }
}

/// A line to be written, before it has an id.
struct PlannedLine {
    product: product::Model,
    quantity: i32,
    price: Decimal,
    is_bonus: bool,
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
    retry: RetryPolicy,
    event_sender: Arc<EventSender>,
    payment_window: Duration,
}

impl OrderService {
    pub fn new(
        db: Arc<DbPool>,
        retry: RetryPolicy,
        event_sender: Arc<EventSender>,
        payment_window: Duration,
    ) -> Self {
        Self {
            db,
            retry,
            event_sender,
            payment_window,
        }
    }

    /// Turns the user's active cart into an order.
    ///
    /// One transaction covers the stock reservation, the order rows, discount
    /// redemptions and closing the cart; any failure leaves nothing behind.
    #[instrument(skip(self, input), fields(user_id = %user_id, coupons = input.coupon_codes.len()))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        input: CreateOrderInput,
    ) -> Result<OrderDetails, ServiceError> {
        input.validate()?;

        let start = std::time::Instant::now();
        let payment_window = self.payment_window;

        let (details, evaluation) =
            retryable_transaction(&self.db, &self.retry, "create_order", |txn| {
                let input = input.clone();
                Box::pin(async move {
                    create_order_in(txn, user_id, &input, payment_window).await
                })
            })
            .await?;

        histogram!("storefront.orders.create_duration", start.elapsed());
        counter!("storefront.orders.created", 1);
        info!(
            order_id = %details.order.id,
            total_price = %details.order.total_price,
            discount = %details.order.discount,
            final_price = %details.order.final_price,
            lines = details.items.len(),
            "Order created"
        );

        self.event_sender
            .emit(Event::OrderCreated {
                order_id: details.order.id,
                user_id,
                final_price: details.order.final_price,
            })
            .await;
        for discount_id in &evaluation.applied_discount_ids {
            self.event_sender
                .emit(Event::DiscountRedeemed {
                    discount_id: *discount_id,
                    order_id: details.order.id,
                    user_id,
                })
                .await;
        }

        Ok(details)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        load_details_in(self.db.as_ref(), order_id).await
    }

    /// Status log for an order, oldest first.
    pub async fn status_history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_status_log::Model>, ServiceError> {
        let rows = order_status_log::Entity::find()
            .filter(order_status_log::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_log::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;
        Ok(rows)
    }
}

async fn create_order_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    input: &CreateOrderInput,
    payment_window: Duration,
) -> Result<(OrderDetails, DiscountEvaluation), ServiceError> {
    let now = Utc::now();

    let cart = Cart::find()
        .filter(cart::Column::UserId.eq(user_id))
        .filter(cart::Column::IsActive.eq(true))
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::EmptyCart(format!("user {} has no active cart", user_id)))?;

    let cart_items = CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart.id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .all(conn)
        .await?;

    if cart_items.is_empty() {
        return Err(ServiceError::EmptyCart(format!("cart {} has no items", cart.id)));
    }

    if let Some(store_id) = input.store_id {
        store::Entity::find_by_id(store_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Store {} not found", store_id)))?;
    }

    // Merge repeated products, keeping cart order
    let mut quantities: Vec<(Uuid, i32)> = Vec::new();
    for item in &cart_items {
        if item.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "cart item {} has a non-positive quantity",
                item.id
            )));
        }
        match quantities.iter_mut().find(|(pid, _)| *pid == item.product_id) {
            Some((_, qty)) => {
                *qty = qty.checked_add(item.quantity).ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "cart quantity for product {} is out of range",
                        item.product_id
                    ))
                })?;
            }
            None => quantities.push((item.product_id, item.quantity)),
        }
    }

    let mut products: HashMap<Uuid, product::Model> = HashMap::new();
    let mut stocks: HashMap<Uuid, Vec<stock::Model>> = HashMap::new();
    let mut total_price = Decimal::ZERO;
    let mut lines = Vec::with_capacity(quantities.len());

    for (product_id, quantity) in &quantities {
        let product = load_sellable_product(conn, *product_id).await?;
        let rows = eligible_stocks_in(conn, *product_id, input.store_id).await?;
        ensure_available(&product, &rows, *quantity)?;

        total_price += product.price * Decimal::from(*quantity);
        lines.push(CartLine {
            product_id: *product_id,
            quantity: *quantity,
            unit_price: product.price,
        });
        stocks.insert(*product_id, rows);
        products.insert(*product_id, product);
    }

    let evaluation = evaluate_in(conn, &input.coupon_codes, user_id, total_price, &lines, now).await?;
    let discount = evaluation.discount_amount.min(total_price);
    let final_price = (total_price - discount).max(Decimal::ZERO);

    let mut planned: Vec<PlannedLine> = quantities
        .iter()
        .map(|(product_id, quantity)| PlannedLine {
            product: products[product_id].clone(),
            quantity: *quantity,
            price: products[product_id].price,
            is_bonus: false,
        })
        .collect();

    // Bonus units need stock too, on top of what the paid lines take
    for bonus in &evaluation.extra_items {
        if !products.contains_key(&bonus.product_id) {
            let product = load_sellable_product(conn, bonus.product_id).await?;
            let rows = eligible_stocks_in(conn, bonus.product_id, input.store_id).await?;
            stocks.insert(bonus.product_id, rows);
            products.insert(bonus.product_id, product);
        }

        let product = &products[&bonus.product_id];
        let already_taken: i32 = planned
            .iter()
            .filter(|line| line.product.id == bonus.product_id)
            .map(|line| line.quantity)
            .sum();
        ensure_available(product, &stocks[&bonus.product_id], already_taken + bonus.quantity)?;

        planned.push(PlannedLine {
            product: product.clone(),
            quantity: bonus.quantity,
            price: Decimal::ZERO,
            is_bonus: true,
        });
    }

    let order_id = Uuid::new_v4();
    let actor = user_id.to_string();

    let order = order::ActiveModel {
        id: Set(order_id),
        user_id: Set(user_id),
        store_id: Set(input.store_id),
        total_price: Set(total_price),
        discount: Set(discount),
        final_price: Set(final_price),
        status: Set(OrderStatus::WaitingForPayment),
        payment_method: Set(input.payment_method),
        payment_proof: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        expired_at: Set(now + payment_window),
    }
    .insert(conn)
    .await?;

    let entry = LedgerEntry::new(actor.as_str(), JournalType::Sale)
        .with_note(format!("order {}", order_id));

    let mut items = Vec::with_capacity(planned.len());
    let mut allocations = Vec::new();

    for line in planned {
        let item = order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            product_id: Set(line.product.id),
            product_name: Set(line.product.name.clone()),
            quantity: Set(line.quantity),
            price: Set(line.price),
            sub_total: Set(line.price * Decimal::from(line.quantity)),
            is_bonus: Set(line.is_bonus),
        }
        .insert(conn)
        .await?;

        let rows = stocks.get_mut(&line.product.id).ok_or_else(|| {
            ServiceError::InternalError(format!("no stock rows loaded for {}", line.product.id))
        })?;
        allocations.extend(allocate_line(conn, &item, rows, &entry).await?);
        items.push(item);
    }

    record_redemptions(conn, &evaluation, user_id, order_id).await?;

    CartItem::delete_many()
        .filter(cart_item::Column::CartId.eq(cart.id))
        .exec(conn)
        .await?;

    let mut closed: cart::ActiveModel = cart.into();
    closed.is_active = Set(false);
    closed.updated_at = Set(now);
    closed.update(conn).await?;

    append_status_log(
        conn,
        order_id,
        None,
        OrderStatus::WaitingForPayment,
        &actor,
        Some("order created"),
    )
    .await?;

    Ok((
        OrderDetails {
            order,
            items,
            allocations,
        },
        evaluation,
    ))
}

async fn load_sellable_product<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<product::Model, ServiceError> {
    let product = product::Entity::find_by_id(product_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

    if !product.is_active {
        return Err(ServiceError::InvalidStatus(format!(
            "product {} is no longer sold",
            product.name
        )));
    }
    Ok(product)
}

fn ensure_available(
    product: &product::Model,
    rows: &[stock::Model],
    wanted: i32,
) -> Result<(), ServiceError> {
    let available: i64 = rows.iter().map(|s| s.quantity.max(0) as i64).sum();
    if (wanted as i64) > available {
        return Err(ServiceError::InsufficientStock(format!(
            "{}: requested {}, available {}",
            product.name, wanted, available
        )));
    }
    Ok(())
}

/// Takes an order line's quantity from `rows` in order, updating them in place.
async fn allocate_line<C: ConnectionTrait>(
    conn: &C,
    item: &order_item::Model,
    rows: &mut [stock::Model],
    entry: &LedgerEntry,
) -> Result<Vec<order_item_allocation::Model>, ServiceError> {
    let mut remaining = item.quantity;
    let mut allocations = Vec::new();

    for row in rows.iter_mut() {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(row.quantity);
        if take <= 0 {
            continue;
        }

        *row = apply_delta(conn, row, -take, entry, false).await?;
        remaining -= take;

        let allocation = order_item_allocation::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_item_id: Set(item.id),
            stock_id: Set(row.id),
            quantity: Set(take),
            created_at: Set(Utc::now()),
        }
        .insert(conn)
        .await?;
        allocations.push(allocation);
    }

    if remaining > 0 {
        return Err(ServiceError::InsufficientStock(format!(
            "{}: {} unit(s) could not be allocated",
            item.product_name, remaining
        )));
    }

    Ok(allocations)
}

async fn load_details_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<OrderDetails, ServiceError> {
    let order = find_order_in(conn, order_id).await?;

    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::IsBonus)
        .order_by_asc(order_item::Column::ProductName)
        .all(conn)
        .await?;

    let item_ids: Vec<Uuid> = items.iter().map(|i| i.id).collect();
    let allocations = if item_ids.is_empty() {
        Vec::new()
    } else {
        order_item_allocation::Entity::find()
            .filter(order_item_allocation::Column::OrderItemId.is_in(item_ids))
            .order_by_asc(order_item_allocation::Column::CreatedAt)
            .all(conn)
            .await?
    };

    Ok(OrderDetails {
        order,
        items,
        allocations,
    })
}
