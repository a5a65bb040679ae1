//! Rate limit bucket entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Fixed-window counter for one scope key.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "rate_limit_bucket")]
pub struct Model {
    /// Composite scope key, e.g. `email-webhook:ip:203.0.113.7`.
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,

    /// Hits counted in the current window.
    pub count: i32,

    /// End of the current window.
    pub reset_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
