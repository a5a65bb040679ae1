//! Email event entity (append-only delivery history).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Email event model.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "email_event")]
pub struct Model {
    /// Unique identifier.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Local message, when resolvable.
    #[sea_orm(nullable)]
    pub message_id: Option<String>,

    /// Event type, e.g. `email.sent` or a provider webhook type.
    #[sea_orm(column_name = "type")]
    pub event_type: String,

    /// Provider-side event id.
    #[sea_orm(nullable)]
    pub provider_event_id: Option<String>,

    /// Recipient address reported with the event.
    #[sea_orm(nullable)]
    pub email: Option<String>,

    /// When the event happened.
    pub occurred_at: DateTimeWithTimeZone,

    /// Raw event snapshot.
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Json,

    /// When the row was written.
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::email_message::Entity",
        from = "Column::MessageId",
        to = "super::email_message::Column::Id",
        on_delete = "SetNull"
    )]
    EmailMessage,
}

impl Related<super::email_message::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::EmailMessage.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
