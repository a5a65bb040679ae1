//! Email event repository.

use std::sync::Arc;

use crate::entities::{EmailEvent, email_event};
use atelier_common::{AppError, AppResult};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};

/// Append-only access to delivery events.
#[derive(Clone)]
pub struct EmailEventRepository {
    db: Arc<DatabaseConnection>,
}

impl EmailEventRepository {
    /// Create a new email event repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Append an event.
    pub async fn create(&self, model: email_event::ActiveModel) -> AppResult<email_event::Model> {
        model
            .insert(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Events for a message, oldest first.
    pub async fn find_by_message_id(&self, message_id: &str) -> AppResult<Vec<email_event::Model>> {
        EmailEvent::find()
            .filter(email_event::Column::MessageId.eq(message_id))
            .order_by_asc(email_event::Column::OccurredAt)
            .order_by_asc(email_event::Column::CreatedAt)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }
}
