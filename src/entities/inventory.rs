use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stock for one merchant's product, or one of its variants.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventories")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub merchant_id: Uuid,
    #[sea_orm(nullable)]
    pub product_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub variant_id: Option<Uuid>,
    /// On-hand stock.
    pub quantity: i32,
    /// Stock earmarked for orders that have not been paid yet.
    pub reserved_quantity: i32,
    pub low_stock_threshold: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Stock that can still be promised to new orders.
    pub fn available_quantity(&self) -> i32 {
        (self.quantity - self.reserved_quantity).max(0)
    }
}

/// Stock level after removing `ordered` units; never below zero.
pub fn floored_decrement(current: i32, ordered: i32) -> i32 {
    current.saturating_sub(ordered).max(0)
}
