use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a stock change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    #[sea_orm(string_value = "INCREASE")]
    Increase,
    #[sea_orm(string_value = "DECREASE")]
    Decrease,
    #[sea_orm(string_value = "ADJUSTMENT")]
    Adjustment,
}

impl ChangeType {
    /// INCREASE or DECREASE by sign; a zero diff is an ADJUSTMENT.
    pub fn from_diff(diff: i32) -> Self {
        match diff {
            d if d > 0 => ChangeType::Increase,
            d if d < 0 => ChangeType::Decrease,
            _ => ChangeType::Adjustment,
        }
    }
}

/// Business reason for a stock change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalType {
    #[sea_orm(string_value = "PURCHASE")]
    Purchase,
    #[sea_orm(string_value = "SALE")]
    Sale,
    #[sea_orm(string_value = "RETURN")]
    Return,
    #[sea_orm(string_value = "TRANSFER")]
    Transfer,
    #[sea_orm(string_value = "ADJUSTMENT")]
    Adjustment,
}

/// Append-only journal of stock changes.
///
/// Invariant: `quantity_old + quantity_diff == quantity_new`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_histories")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub stock_id: Uuid,
    pub quantity_old: i32,
    pub quantity_diff: i32,
    pub quantity_new: i32,
    pub change_type: ChangeType,
    pub journal_type: JournalType,
    /// Shared by both sides of a store-to-store transfer
    #[sea_orm(nullable)]
    pub transfer_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub note: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::stock::Entity",
        from = "Column::StockId",
        to = "super::stock::Column::Id"
    )]
    Stock,
}

impl Related<super::stock::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Stock.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, _insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        if let ActiveValue::NotSet = active_model.created_at {
            active_model.created_at = Set(Utc::now());
        }
        Ok(active_model)
    }
}
