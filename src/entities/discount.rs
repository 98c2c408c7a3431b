use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Kinds of discount the engine knows how to compute.
///
/// Stored as plain text so a row written by a newer release with a type this
/// build does not know still loads, and is rejected at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountType {
    Manual,
    Seasonal,
    MinSpend,
    Bundle,
    #[strum(serialize = "BUY_X_GET_Y")]
    #[serde(rename = "BUY_X_GET_Y")]
    BuyXGetY,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "discounts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub code: String,
    pub name: String,
    pub discount_type: String,
    pub is_percentage: bool,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub value: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))", nullable)]
    pub min_spend: Option<Decimal>,
    #[sea_orm(nullable)]
    pub buy_quantity: Option<i32>,
    #[sea_orm(nullable)]
    pub get_quantity: Option<i32>,
    /// BUY_X_GET_Y target; unscoped when None
    #[sea_orm(nullable)]
    pub product_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub max_uses: Option<i32>,
    #[sea_orm(nullable)]
    pub max_uses_per_user: Option<i32>,
    pub uses_count: i32,
    pub is_active: bool,
    pub starts_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Parsed type, or `None` for a type this build does not support.
    pub fn kind(&self) -> Option<DiscountType> {
        self.discount_type.parse().ok()
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.starts_at <= now && self.ends_at.map_or(true, |end| now <= end)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::discount_redemption::Entity")]
    Redemptions,
}

impl Related<super::discount_redemption::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Redemptions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
