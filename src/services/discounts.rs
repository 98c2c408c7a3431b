use crate::{
    db::DbPool,
    entities::{
        discount::{self, DiscountType, Entity as Discount},
        discount_redemption::{self, Entity as DiscountRedemption},
    },
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait,
    PaginatorTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// A cart line as seen by the discount engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
}

/// Free units granted by a BUY_X_GET_Y discount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusItem {
    pub discount_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Result of applying one discount to a cart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscountOutcome {
    pub amount: Decimal,
    pub extra_items: Vec<BonusItem>,
}

/// Combined result of every code in a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscountEvaluation {
    /// Never exceeds the cart total
    pub discount_amount: Decimal,
    pub applied_discount_ids: Vec<Uuid>,
    pub extra_items: Vec<BonusItem>,
}

impl DiscountEvaluation {
    pub fn is_empty(&self) -> bool {
        self.applied_discount_ids.is_empty()
    }
}

/// Input for creating a discount code.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewDiscount {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub discount_type: DiscountType,
    pub is_percentage: bool,
    #[validate(custom = "non_negative_amount")]
    pub value: Decimal,
    pub min_spend: Option<Decimal>,
    #[validate(range(min = 1))]
    pub buy_quantity: Option<i32>,
    #[validate(range(min = 1))]
    pub get_quantity: Option<i32>,
    pub product_id: Option<Uuid>,
    #[validate(range(min = 1))]
    pub max_uses: Option<i32>,
    #[validate(range(min = 1))]
    pub max_uses_per_user: Option<i32>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

fn non_negative_amount(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        let mut err = ValidationError::new("value");
        err.message = Some("discount value must not be negative".into());
        return Err(err);
    }
    Ok(())
}

/// Discount evaluation and redemption bookkeeping.
#[derive(Clone)]
pub struct DiscountEngine {
    db: Arc<DbPool>,
}

impl DiscountEngine {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Evaluates coupon codes against a cart, outside of any order.
    #[instrument(skip(self, codes, cart_items), fields(codes = codes.len()))]
    pub async fn evaluate_discounts(
        &self,
        codes: &[String],
        user_id: Uuid,
        total_price: Decimal,
        cart_items: &[CartLine],
    ) -> Result<DiscountEvaluation, ServiceError> {
        evaluate_in(
            self.db.as_ref(),
            codes,
            user_id,
            total_price,
            cart_items,
            Utc::now(),
        )
        .await
    }

    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_discount(&self, input: NewDiscount) -> Result<discount::Model, ServiceError> {
        input.validate()?;

        let code = input.code.trim().to_string();
        if let Some(ends_at) = input.ends_at {
            if ends_at < input.starts_at {
                return Err(ServiceError::ValidationError(
                    "discount must not end before it starts".to_string(),
                ));
            }
        }

        let exists = Discount::find()
            .filter(discount::Column::Code.eq(code.as_str()))
            .count(self.db.as_ref())
            .await?;
        if exists > 0 {
            return Err(ServiceError::Conflict(format!(
                "Discount code {} already exists",
                code
            )));
        }

        let now = Utc::now();
        let model = discount::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code),
            name: Set(input.name),
            discount_type: Set(input.discount_type.to_string()),
            is_percentage: Set(input.is_percentage),
            value: Set(input.value),
            min_spend: Set(input.min_spend),
            buy_quantity: Set(input.buy_quantity),
            get_quantity: Set(input.get_quantity),
            product_id: Set(input.product_id),
            max_uses: Set(input.max_uses),
            max_uses_per_user: Set(input.max_uses_per_user),
            uses_count: Set(0),
            is_active: Set(true),
            starts_at: Set(input.starts_at),
            ends_at: Set(input.ends_at),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await?;

        info!(discount_id = %model.id, code = %model.code, "Discount created");
        Ok(model)
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<discount::Model>, ServiceError> {
        let found = Discount::find()
            .filter(discount::Column::Code.eq(code.trim()))
            .one(self.db.as_ref())
            .await?;
        Ok(found)
    }
}

/// Trims, drops blanks, and rejects a code repeated within one request.
fn normalize_codes(codes: &[String]) -> Result<Vec<String>, ServiceError> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(codes.len());

    for code in codes.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
        if !seen.insert(code.to_string()) {
            return Err(ServiceError::ValidationError(format!(
                "coupon code {} was submitted more than once",
                code
            )));
        }
        normalized.push(code.to_string());
    }

    Ok(normalized)
}

/// Evaluates every code in order; the first failure rejects the whole request.
pub async fn evaluate_in<C: ConnectionTrait>(
    conn: &C,
    codes: &[String],
    user_id: Uuid,
    total_price: Decimal,
    cart_items: &[CartLine],
    now: DateTime<Utc>,
) -> Result<DiscountEvaluation, ServiceError> {
    let codes = normalize_codes(codes)?;
    let mut evaluation = DiscountEvaluation::default();

    for code in codes {
        let discount = Discount::find()
            .filter(discount::Column::Code.eq(code.as_str()))
            .one(conn)
            .await?
            .filter(|d| d.is_live_at(now))
            .ok_or_else(|| ServiceError::InvalidCoupon(code.clone()))?;

        if let Some(per_user) = discount.max_uses_per_user {
            let used = DiscountRedemption::find()
                .filter(discount_redemption::Column::DiscountId.eq(discount.id))
                .filter(discount_redemption::Column::UserId.eq(user_id))
                .count(conn)
                .await?;
            if used >= per_user.max(0) as u64 {
                return Err(ServiceError::CouponUsageExceeded(format!(
                    "{} may be used {} time(s) per customer",
                    code, per_user
                )));
            }
        }

        if let Some(max_uses) = discount.max_uses {
            if discount.uses_count >= max_uses {
                return Err(ServiceError::CouponUsageExceeded(code));
            }
        }

        let outcome = compute_discount(&discount, total_price, cart_items)?;
        debug!(code = %code, amount = %outcome.amount, bonus_lines = outcome.extra_items.len(), "Discount applies");

        evaluation.discount_amount += outcome.amount;
        evaluation.applied_discount_ids.push(discount.id);
        evaluation.extra_items.extend(outcome.extra_items);
    }

    evaluation.discount_amount = evaluation.discount_amount.min(total_price).max(Decimal::ZERO);
    Ok(evaluation)
}

/// Per-type arithmetic for a single discount.
///
/// Also enforces the discount's minimum spend: a cart below it is an error,
/// never a silent zero.
pub fn compute_discount(
    discount: &discount::Model,
    total: Decimal,
    items: &[CartLine],
) -> Result<DiscountOutcome, ServiceError> {
    let kind = discount
        .kind()
        .ok_or_else(|| unsupported(discount, "unknown discount type"))?;

    if discount.value.is_sign_negative() && !discount.value.is_zero() {
        return Err(unsupported(discount, "negative discount value"));
    }

    let min_spend = match (kind, discount.min_spend) {
        (_, Some(min)) => Some(min),
        (DiscountType::MinSpend, None) => {
            return Err(unsupported(discount, "minimum spend is not configured"))
        }
        _ => None,
    };
    if let Some(min) = min_spend {
        if total < min {
            return Err(ServiceError::MinSpendNotMet(format!(
                "{} requires a minimum spend of {}, cart total is {}",
                discount.code, min, total
            )));
        }
    }

    let outcome = match kind {
        DiscountType::Manual | DiscountType::Seasonal => {
            let amount = if discount.is_percentage {
                (total * discount.value / Decimal::ONE_HUNDRED)
                    .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            } else {
                discount.value
            };
            DiscountOutcome {
                amount: amount.min(total),
                extra_items: Vec::new(),
            }
        }
        DiscountType::MinSpend => DiscountOutcome {
            amount: discount.value.min(total),
            extra_items: Vec::new(),
        },
        DiscountType::Bundle => {
            let amount = match discount.buy_quantity {
                Some(buy) if buy > 0 => discount.value.min(total),
                _ => Decimal::ZERO,
            };
            DiscountOutcome {
                amount,
                extra_items: Vec::new(),
            }
        }
        DiscountType::BuyXGetY => {
            let (buy, get) = match (discount.buy_quantity, discount.get_quantity) {
                (Some(buy), Some(get)) if buy > 0 && get > 0 => (buy, get),
                _ => return Err(unsupported(discount, "buy and get quantities are required")),
            };

            let extra_items = items
                .iter()
                .filter(|item| discount.product_id.map_or(true, |p| p == item.product_id))
                .filter_map(|item| {
                    let bonus = (item.quantity / buy) * get;
                    (bonus > 0).then(|| BonusItem {
                        discount_id: discount.id,
                        product_id: item.product_id,
                        quantity: bonus,
                    })
                })
                .collect();

            DiscountOutcome {
                amount: Decimal::ZERO,
                extra_items,
            }
        }
    };

    Ok(outcome)
}

fn unsupported(discount: &discount::Model, reason: &str) -> ServiceError {
    warn!(code = %discount.code, discount_type = %discount.discount_type, reason, "Unsupported coupon");
    ServiceError::UnsupportedCoupon(format!("{}: {}", discount.code, reason))
}

/// Records one redemption per applied discount and bumps its usage counter.
///
/// The counter update is conditional on `max_uses`, so two orders racing for
/// the last use cannot both succeed.
pub async fn record_redemptions<C: ConnectionTrait>(
    conn: &C,
    evaluation: &DiscountEvaluation,
    user_id: Uuid,
    order_id: Uuid,
) -> Result<(), ServiceError> {
    for discount_id in &evaluation.applied_discount_ids {
        let updated = Discount::update_many()
            .col_expr(
                discount::Column::UsesCount,
                Expr::col(discount::Column::UsesCount).add(1),
            )
            .col_expr(discount::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(discount::Column::Id.eq(*discount_id))
            .filter(
                Condition::any()
                    .add(discount::Column::MaxUses.is_null())
                    .add(
                        Expr::col(discount::Column::UsesCount)
                            .lt(Expr::col(discount::Column::MaxUses)),
                    ),
            )
            .exec(conn)
            .await?;

        if updated.rows_affected == 0 {
            return Err(ServiceError::CouponUsageExceeded(format!(
                "discount {} has no uses left",
                discount_id
            )));
        }

        discount_redemption::ActiveModel {
            id: Set(Uuid::new_v4()),
            discount_id: Set(*discount_id),
            user_id: Set(user_id),
            order_id: Set(order_id),
            created_at: Set(Utc::now()),
        }
        .insert(conn)
        .await?;
    }

    Ok(())
}
