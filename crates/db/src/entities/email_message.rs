//! Email message entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Message category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    #[sea_orm(string_value = "transactional")]
    Transactional,
    #[sea_orm(string_value = "editorial")]
    Editorial,
    #[sea_orm(string_value = "system")]
    System,
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "sent")]
    Sent,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "bounced")]
    Bounced,
    #[sea_orm(string_value = "complained")]
    Complained,
    #[sea_orm(string_value = "opened")]
    Opened,
    #[sea_orm(string_value = "clicked")]
    Clicked,
    #[sea_orm(string_value = "suppressed")]
    Suppressed,
}

impl EmailStatus {
    /// Whether the send handler may (re)deliver a message in this state.
    #[must_use]
    pub const fn is_sendable(self) -> bool {
        matches!(self, Self::Queued | Self::Failed)
    }
}

/// Email message model.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "email_message")]
pub struct Model {
    /// Unique identifier.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Recipient address.
    pub to_email: String,

    /// Recipient user, when known.
    #[sea_orm(nullable)]
    pub to_user_id: Option<String>,

    /// Provider that delivers the message.
    pub provider: String,

    /// Template the message was rendered from.
    pub template_key: String,

    /// Message category.
    pub message_type: MessageType,

    /// Topic tag.
    pub topic: String,

    /// Delivery status.
    pub status: EmailStatus,

    /// Rendered subject.
    pub subject: String,

    /// Sender.
    pub from_email: String,

    /// Reply-to address.
    #[sea_orm(nullable)]
    pub reply_to: Option<String>,

    /// Rendered HTML body.
    #[sea_orm(column_type = "Text")]
    pub html: String,

    /// Rendered plain-text body.
    #[sea_orm(column_type = "Text")]
    pub text: String,

    /// Caller-defined grouping key.
    #[sea_orm(nullable)]
    pub correlation_key: Option<String>,

    /// Deduplication key, unique when present.
    #[sea_orm(nullable, unique)]
    pub idempotency_key: Option<String>,

    /// Provider-side scheduled delivery time.
    #[sea_orm(nullable)]
    pub scheduled_at: Option<DateTimeWithTimeZone>,

    /// Template data used for rendering.
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Json,

    /// Free-form metadata.
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Json,

    /// Provider send attempts.
    pub attempts: i32,

    /// Provider message id once sent.
    #[sea_orm(nullable, indexed)]
    pub provider_message_id: Option<String>,

    /// Last provider error.
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    /// When the provider accepted the message.
    #[sea_orm(nullable)]
    pub sent_at: Option<DateTimeWithTimeZone>,

    /// Occurrence time of the last provider event applied to `status`.
    #[sea_orm(nullable)]
    pub status_updated_at: Option<DateTimeWithTimeZone>,

    /// When the message was queued.
    pub created_at: DateTimeWithTimeZone,

    /// When the row last changed.
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::email_event::Entity")]
    EmailEvent,
}

impl Related<super::email_event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::EmailEvent.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
