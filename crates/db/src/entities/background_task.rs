//! Background task entity.
//!
//! The table behind this entity is created lazily by
//! [`BackgroundTaskRepository::ensure_schema`](crate::repositories::BackgroundTaskRepository::ensure_schema)
//! rather than by a migration.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Kinds of background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum TaskName {
    #[sea_orm(string_value = "email.send")]
    #[serde(rename = "email.send")]
    EmailSend,
    #[sea_orm(string_value = "webhook.dispatch")]
    #[serde(rename = "webhook.dispatch")]
    WebhookDispatch,
    #[sea_orm(string_value = "search.reindex")]
    #[serde(rename = "search.reindex")]
    SearchReindex,
    #[sea_orm(string_value = "news.publish")]
    #[serde(rename = "news.publish")]
    NewsPublish,
    #[sea_orm(string_value = "blog.publish")]
    #[serde(rename = "blog.publish")]
    BlogPublish,
}

impl TaskName {
    /// Wire name stored in the `name` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmailSend => "email.send",
            Self::WebhookDispatch => "webhook.dispatch",
            Self::SearchReindex => "search.reindex",
            Self::NewsPublish => "news.publish",
            Self::BlogPublish => "blog.publish",
        }
    }
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl TaskStatus {
    /// Whether the task will never run again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Background task model.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "background_task")]
pub struct Model {
    /// Unique identifier.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Task kind.
    pub name: TaskName,

    /// Handler input.
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Json,

    /// Earliest time the task may run.
    pub run_at: DateTimeWithTimeZone,

    /// Lifecycle state.
    pub status: TaskStatus,

    /// Number of finished execution attempts.
    pub attempts: i32,

    /// Last failure message, truncated.
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    /// When the current lease was taken.
    #[sea_orm(nullable)]
    pub locked_at: Option<DateTimeWithTimeZone>,

    /// Worker owning the current lease.
    #[sea_orm(nullable)]
    pub locked_by: Option<String>,

    /// When the current lease may be reclaimed by another worker.
    #[sea_orm(nullable)]
    pub lease_expires_at: Option<DateTimeWithTimeZone>,

    /// When the task was enqueued.
    pub created_at: DateTimeWithTimeZone,

    /// When the row last changed.
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
