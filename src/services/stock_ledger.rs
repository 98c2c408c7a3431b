use crate::{
    db::{retryable_transaction, with_transaction, DbPool, RetryPolicy},
    entities::{
        product,
        stock::{self, Entity as Stock},
        stock_history::{self, ChangeType, Entity as StockHistory, JournalType},
        store,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set, SqlErr,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Actor recorded for changes made by background jobs.
pub const SYSTEM_ACTOR: &str = "SYSTEM";

/// A relative stock change requested by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustStock {
    pub delta: i32,
    pub actor: String,
    pub journal_type: JournalType,
    pub note: Option<String>,
    /// Permit the row to go below zero (manual corrections only)
    pub allow_negative: bool,
}

impl AdjustStock {
    pub fn new(delta: i32, actor: impl Into<String>, journal_type: JournalType) -> Self {
        Self {
            delta,
            actor: actor.into(),
            journal_type,
            note: None,
            allow_negative: false,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn allowing_negative(mut self) -> Self {
        self.allow_negative = true;
        self
    }

    fn entry(&self) -> LedgerEntry {
        LedgerEntry {
            actor: self.actor.clone(),
            journal_type: self.journal_type,
            note: self.note.clone(),
            transfer_id: None,
        }
    }
}

/// Who and why, attached to every history row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub actor: String,
    pub journal_type: JournalType,
    pub note: Option<String>,
    pub transfer_id: Option<Uuid>,
}

impl LedgerEntry {
    pub fn new(actor: impl Into<String>, journal_type: JournalType) -> Self {
        Self {
            actor: actor.into(),
            journal_type,
            note: None,
            transfer_id: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_transfer(mut self, transfer_id: Uuid) -> Self {
        self.transfer_id = Some(transfer_id);
        self
    }
}

/// Both sides of a completed store-to-store transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockTransfer {
    pub transfer_id: Uuid,
    pub from: stock::Model,
    pub to: stock::Model,
}

/// Inventory ledger: the only writer of `stocks.quantity`.
///
/// Relative changes use an optimistic compare-and-swap on the quantity that
/// was read, retried a bounded number of times. Every successful change
/// appends exactly one history row in the same transaction.
#[derive(Clone)]
pub struct StockLedger {
    db: Arc<DbPool>,
    retry: RetryPolicy,
    event_sender: Arc<EventSender>,
}

impl StockLedger {
    pub fn new(db: Arc<DbPool>, retry: RetryPolicy, event_sender: Arc<EventSender>) -> Self {
        Self {
            db,
            retry,
            event_sender,
        }
    }

    /// Applies a signed delta to a stock row.
    #[instrument(skip(self, input), fields(delta = input.delta, actor = %input.actor))]
    pub async fn adjust_stock(
        &self,
        stock_id: Uuid,
        input: AdjustStock,
    ) -> Result<stock::Model, ServiceError> {
        validate_delta(input.delta)?;

        let (before, after) = retryable_transaction(&self.db, &self.retry, "adjust_stock", |txn| {
            let input = input.clone();
            Box::pin(async move {
                let current = find_stock_in(txn, stock_id).await?;
                let updated = apply_delta(
                    txn,
                    &current,
                    input.delta,
                    &input.entry(),
                    input.allow_negative,
                )
                .await?;
                Ok::<_, ServiceError>((current.quantity, updated))
            })
        })
        .await?;

        self.after_adjustment(before, &after).await;
        Ok(after)
    }

    /// Same as [`adjust_stock`](Self::adjust_stock), addressed by product and store.
    #[instrument(skip(self, input), fields(delta = input.delta, actor = %input.actor))]
    pub async fn adjust_stock_for(
        &self,
        product_id: Uuid,
        store_id: Uuid,
        input: AdjustStock,
    ) -> Result<stock::Model, ServiceError> {
        validate_delta(input.delta)?;

        let (before, after) =
            retryable_transaction(&self.db, &self.retry, "adjust_stock_for", |txn| {
                let input = input.clone();
                Box::pin(async move {
                    let current = find_stock_for_in(txn, product_id, store_id)
                        .await?
                        .ok_or_else(|| missing_pair(product_id, store_id))?;
                    let updated = apply_delta(
                        txn,
                        &current,
                        input.delta,
                        &input.entry(),
                        input.allow_negative,
                    )
                    .await?;
                    Ok::<_, ServiceError>((current.quantity, updated))
                })
            })
            .await?;

        self.after_adjustment(before, &after).await;
        Ok(after)
    }

    /// Opens a stock row for a (product, store) pair with an initial history entry.
    #[instrument(skip(self))]
    pub async fn create_stock(
        &self,
        product_id: Uuid,
        store_id: Uuid,
        initial_quantity: i32,
        actor: &str,
    ) -> Result<stock::Model, ServiceError> {
        if initial_quantity < 0 {
            return Err(ServiceError::ValidationError(format!(
                "initial quantity must not be negative, got {}",
                initial_quantity
            )));
        }

        let journal_type = if initial_quantity == 0 {
            JournalType::Adjustment
        } else {
            JournalType::Purchase
        };
        let entry = LedgerEntry::new(actor, journal_type).with_note("initial stock");

        let created = with_transaction(&self.db, |txn| {
            Box::pin(async move {
                product::Entity::find_by_id(product_id)
                    .one(txn)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Product {} not found", product_id))
                    })?;
                ensure_store_exists(txn, store_id).await?;

                if find_stock_for_in(txn, product_id, store_id).await?.is_some() {
                    return Err(ServiceError::Conflict(format!(
                        "Stock already exists for product {} in store {}",
                        product_id, store_id
                    )));
                }

                insert_stock_in(txn, product_id, store_id, initial_quantity, &entry).await
            })
        })
        .await?;

        info!(
            stock_id = %created.id,
            %product_id,
            %store_id,
            quantity = created.quantity,
            "Stock row created"
        );
        Ok(created)
    }

    /// Administrative overwrite of a stock quantity.
    ///
    /// Runs as a single transaction without the compare-and-swap loop; the
    /// history row records the diff against the row as read.
    #[instrument(skip(self, note))]
    pub async fn set_absolute(
        &self,
        stock_id: Uuid,
        new_quantity: i32,
        actor: &str,
        note: Option<String>,
    ) -> Result<stock::Model, ServiceError> {
        if new_quantity < 0 {
            return Err(ServiceError::ValidationError(format!(
                "stock quantity must not be negative, got {}",
                new_quantity
            )));
        }

        let mut entry = LedgerEntry::new(actor, JournalType::Adjustment);
        entry.note = note;

        let (before, after) = with_transaction(&self.db, |txn| {
            Box::pin(async move {
                let current = find_stock_in(txn, stock_id).await?;
                let diff = new_quantity.checked_sub(current.quantity).ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "setting stock {} from {} to {} is out of range",
                        stock_id, current.quantity, new_quantity
                    ))
                })?;
                let now = Utc::now();

                let mut active: stock::ActiveModel = current.clone().into();
                active.quantity = Set(new_quantity);
                active.updated_at = Set(now);
                let updated = active.update(txn).await?;

                record_history(
                    txn,
                    stock_id,
                    current.quantity,
                    diff,
                    ChangeType::Adjustment,
                    &entry,
                )
                .await?;

                Ok::<_, ServiceError>((current.quantity, updated))
            })
        })
        .await?;

        self.after_adjustment(before, &after).await;
        Ok(after)
    }

    /// Moves `quantity` units of a product from one store to another.
    #[instrument(skip(self))]
    pub async fn transfer_stock(
        &self,
        product_id: Uuid,
        from_store_id: Uuid,
        to_store_id: Uuid,
        quantity: i32,
        actor: &str,
    ) -> Result<StockTransfer, ServiceError> {
        if from_store_id == to_store_id {
            return Err(ServiceError::ValidationError(
                "store mismatch: source and destination store must differ".to_string(),
            ));
        }
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "transfer quantity must be positive, got {}",
                quantity
            )));
        }

        let transfer_id = Uuid::new_v4();
        let outgoing = LedgerEntry::new(actor, JournalType::Transfer)
            .with_transfer(transfer_id)
            .with_note(format!("transfer to store {}", to_store_id));
        let incoming = LedgerEntry::new(actor, JournalType::Transfer)
            .with_transfer(transfer_id)
            .with_note(format!("transfer from store {}", from_store_id));

        let transfer = retryable_transaction(&self.db, &self.retry, "transfer_stock", |txn| {
            let outgoing = outgoing.clone();
            let incoming = incoming.clone();
            Box::pin(async move {
                let source = find_stock_for_in(txn, product_id, from_store_id)
                    .await?
                    .ok_or_else(|| missing_pair(product_id, from_store_id))?;

                if source.quantity < quantity {
                    return Err(ServiceError::InsufficientStock(format!(
                        "store {} holds {} units of product {}, cannot transfer {}",
                        from_store_id, source.quantity, product_id, quantity
                    )));
                }

                ensure_store_exists(txn, to_store_id).await?;

                let from = apply_delta(txn, &source, -quantity, &outgoing, false).await?;

                let to = match find_stock_for_in(txn, product_id, to_store_id).await? {
                    Some(destination) => {
                        apply_delta(txn, &destination, quantity, &incoming, false).await?
                    }
                    None => {
                        open_destination_in(txn, product_id, to_store_id, quantity, &incoming)
                            .await?
                    }
                };

                Ok::<_, ServiceError>(StockTransfer {
                    transfer_id,
                    from,
                    to,
                })
            })
        })
        .await?;

        counter!("storefront.stock.transfers", 1);
        info!(
            %transfer_id,
            %product_id,
            %from_store_id,
            %to_store_id,
            quantity,
            "Stock transferred"
        );

        self.event_sender
            .emit(Event::StockTransferred {
                transfer_id,
                product_id,
                from_store_id,
                to_store_id,
                quantity,
            })
            .await;

        Ok(transfer)
    }

    pub async fn get_stock(&self, stock_id: Uuid) -> Result<stock::Model, ServiceError> {
        find_stock_in(self.db.as_ref(), stock_id).await
    }

    pub async fn find_stock(
        &self,
        product_id: Uuid,
        store_id: Uuid,
    ) -> Result<Option<stock::Model>, ServiceError> {
        find_stock_for_in(self.db.as_ref(), product_id, store_id).await
    }

    /// Every store's row for a product, largest quantity first.
    pub async fn stocks_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<stock::Model>, ServiceError> {
        eligible_stocks_in(self.db.as_ref(), product_id, None).await
    }

    /// Units of a product that can still be sold, across all stores.
    pub async fn available_quantity(&self, product_id: Uuid) -> Result<i64, ServiceError> {
        let rows = self.stocks_for_product(product_id).await?;
        Ok(rows.iter().map(|s| s.quantity.max(0) as i64).sum())
    }

    /// History rows for a stock, oldest first.
    pub async fn history(
        &self,
        stock_id: Uuid,
    ) -> Result<Vec<stock_history::Model>, ServiceError> {
        let rows = StockHistory::find()
            .filter(stock_history::Column::StockId.eq(stock_id))
            .order_by_asc(stock_history::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;
        Ok(rows)
    }

    async fn after_adjustment(&self, before: i32, after: &stock::Model) {
        counter!("storefront.stock.adjustments", 1);
        info!(
            stock_id = %after.id,
            old_quantity = before,
            new_quantity = after.quantity,
            "Stock adjusted"
        );

        self.event_sender
            .emit(Event::StockAdjusted {
                stock_id: after.id,
                product_id: after.product_id,
                store_id: after.store_id,
                old_quantity: before,
                new_quantity: after.quantity,
            })
            .await;
    }
}

fn validate_delta(delta: i32) -> Result<(), ServiceError> {
    if delta == 0 {
        return Err(ServiceError::ValidationError(
            "stock adjustment must change the quantity".to_string(),
        ));
    }
    Ok(())
}

fn missing_pair(product_id: Uuid, store_id: Uuid) -> ServiceError {
    ServiceError::NotFound(format!(
        "No stock for product {} in store {}",
        product_id, store_id
    ))
}

async fn ensure_store_exists<C: ConnectionTrait>(
    conn: &C,
    store_id: Uuid,
) -> Result<(), ServiceError> {
    store::Entity::find_by_id(store_id)
        .one(conn)
        .await?
        .map(|_| ())
        .ok_or_else(|| ServiceError::NotFound(format!("Store {} not found", store_id)))
}

pub async fn find_stock_in<C: ConnectionTrait>(
    conn: &C,
    stock_id: Uuid,
) -> Result<stock::Model, ServiceError> {
    Stock::find_by_id(stock_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Stock {} not found", stock_id)))
}

pub async fn find_stock_for_in<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    store_id: Uuid,
) -> Result<Option<stock::Model>, ServiceError> {
    let row = Stock::find()
        .filter(stock::Column::ProductId.eq(product_id))
        .filter(stock::Column::StoreId.eq(store_id))
        .one(conn)
        .await?;
    Ok(row)
}

/// Rows that may supply a product, in allocation order.
///
/// Scoped to one store when `store_id` is given; otherwise every store,
/// largest quantity first, ties broken by age and then id.
pub async fn eligible_stocks_in<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    store_id: Option<Uuid>,
) -> Result<Vec<stock::Model>, ServiceError> {
    let mut query = Stock::find().filter(stock::Column::ProductId.eq(product_id));
    if let Some(store_id) = store_id {
        query = query.filter(stock::Column::StoreId.eq(store_id));
    }

    let rows = query
        .order_by_desc(stock::Column::Quantity)
        .order_by_asc(stock::Column::CreatedAt)
        .order_by_asc(stock::Column::Id)
        .all(conn)
        .await?;
    Ok(rows)
}

/// One compare-and-swap attempt plus its history row.
///
/// Fails with [`ServiceError::ConcurrentModification`] when the row no longer
/// holds the quantity in `stock`; the caller's transaction must then be
/// rolled back and retried from a fresh read.
pub async fn apply_delta<C: ConnectionTrait>(
    conn: &C,
    stock: &stock::Model,
    delta: i32,
    entry: &LedgerEntry,
    allow_negative: bool,
) -> Result<stock::Model, ServiceError> {
    let new_quantity = stock.quantity.checked_add(delta).ok_or_else(|| {
        ServiceError::ValidationError(format!(
            "adjusting stock {} by {} overflows",
            stock.id, delta
        ))
    })?;

    if new_quantity < 0 && !allow_negative {
        return Err(ServiceError::InsufficientStock(format!(
            "stock {} holds {} units, cannot remove {}",
            stock.id,
            stock.quantity,
            delta.unsigned_abs()
        )));
    }

    let now = Utc::now();
    let result = Stock::update_many()
        .col_expr(stock::Column::Quantity, Expr::value(new_quantity))
        .col_expr(stock::Column::UpdatedAt, Expr::value(now))
        .filter(stock::Column::Id.eq(stock.id))
        .filter(stock::Column::Quantity.eq(stock.quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        counter!("storefront.stock.cas_conflicts", 1);
        debug!(
            stock_id = %stock.id,
            expected = stock.quantity,
            "Stock changed since it was read"
        );
        return Err(ServiceError::ConcurrentModification(stock.id));
    }

    record_history(
        conn,
        stock.id,
        stock.quantity,
        delta,
        ChangeType::from_diff(delta),
        entry,
    )
    .await?;

    Ok(stock::Model {
        quantity: new_quantity,
        updated_at: now,
        ..stock.clone()
    })
}

/// Appends one history row. History is never updated or deleted.
pub async fn record_history<C: ConnectionTrait>(
    conn: &C,
    stock_id: Uuid,
    quantity_old: i32,
    quantity_diff: i32,
    change_type: ChangeType,
    entry: &LedgerEntry,
) -> Result<stock_history::Model, ServiceError> {
    let row = stock_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        stock_id: Set(stock_id),
        quantity_old: Set(quantity_old),
        quantity_diff: Set(quantity_diff),
        quantity_new: Set(quantity_old + quantity_diff),
        change_type: Set(change_type),
        journal_type: Set(entry.journal_type),
        transfer_id: Set(entry.transfer_id),
        note: Set(entry.note.clone()),
        created_by: Set(entry.actor.clone()),
        created_at: Set(Utc::now()),
    };

    Ok(row.insert(conn).await?)
}

/// Inserts a new stock row and its opening history entry.
async fn insert_stock_in<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    store_id: Uuid,
    quantity: i32,
    entry: &LedgerEntry,
) -> Result<stock::Model, ServiceError> {
    let now = Utc::now();
    let row = stock::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(product_id),
        store_id: Set(store_id),
        quantity: Set(quantity),
        created_at: Set(now),
        updated_at: Set(now),
    };

    let created = row
        .insert(conn)
        .await
        .map_err(|e| unique_pair_violation(e, product_id, store_id))?;

    record_history(
        conn,
        created.id,
        0,
        quantity,
        ChangeType::from_diff(quantity),
        entry,
    )
    .await?;

    Ok(created)
}

/// Creates the receiving row of a transfer.
///
/// Losing the unique (product, store) race here is retryable: the next attempt
/// finds the row and increments it instead.
async fn open_destination_in<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    store_id: Uuid,
    quantity: i32,
    entry: &LedgerEntry,
) -> Result<stock::Model, ServiceError> {
    insert_stock_in(conn, product_id, store_id, quantity, entry)
        .await
        .map_err(|err| match err {
            ServiceError::Conflict(_) => ServiceError::ConcurrentModification(product_id),
            other => other,
        })
}

/// A concurrent creator won the unique (product, store) index.
fn unique_pair_violation(err: DbErr, product_id: Uuid, store_id: Uuid) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => {
            warn!(%product_id, %store_id, "Lost race creating stock row");
            ServiceError::Conflict(format!(
                "Stock already exists for product {} in store {}",
                product_id, store_id
            ))
        }
        _ => ServiceError::DatabaseError(err),
    }
}
