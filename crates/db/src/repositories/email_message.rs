//! Email message repository.

use std::sync::Arc;

use crate::entities::{
    EmailMessage,
    email_message::{self, EmailStatus},
};
use atelier_common::{AppError, AppResult};
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    SqlErr, sea_query::Expr,
};

/// Email message repository for database operations.
#[derive(Clone)]
pub struct EmailMessageRepository {
    db: Arc<DatabaseConnection>,
}

impl EmailMessageRepository {
    /// Create a new email message repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find a message by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<email_message::Model>> {
        EmailMessage::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find a message by its idempotency key.
    pub async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> AppResult<Option<email_message::Model>> {
        EmailMessage::find()
            .filter(email_message::Column::IdempotencyKey.eq(key))
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find a message by the id the provider assigned on send.
    pub async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> AppResult<Option<email_message::Model>> {
        EmailMessage::find()
            .filter(email_message::Column::ProviderMessageId.eq(provider_message_id))
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Insert a new message.
    ///
    /// A duplicate idempotency key surfaces as [`AppError::Conflict`].
    pub async fn create(&self, model: email_message::ActiveModel) -> AppResult<email_message::Model> {
        model.insert(self.db.as_ref()).await.map_err(map_insert_error)
    }

    /// Bump the provider attempt counter ahead of a send.
    pub async fn increment_attempts(&self, id: &str, now: DateTime<Utc>) -> AppResult<()> {
        EmailMessage::update_many()
            .col_expr(
                email_message::Column::Attempts,
                Expr::col(email_message::Column::Attempts).add(1),
            )
            .col_expr(email_message::Column::UpdatedAt, Expr::value(now.fixed_offset()))
            .filter(email_message::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    /// Record a successful provider hand-off.
    pub async fn mark_sent(
        &self,
        id: &str,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        EmailMessage::update_many()
            .col_expr(email_message::Column::Status, Expr::value(EmailStatus::Sent))
            .col_expr(
                email_message::Column::ProviderMessageId,
                Expr::value(provider_message_id),
            )
            .col_expr(
                email_message::Column::LastError,
                Expr::value(Option::<String>::None),
            )
            .col_expr(email_message::Column::SentAt, Expr::value(now.fixed_offset()))
            .col_expr(email_message::Column::UpdatedAt, Expr::value(now.fixed_offset()))
            .filter(email_message::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    /// Record a failed provider hand-off.
    pub async fn mark_failed(&self, id: &str, error: &str, now: DateTime<Utc>) -> AppResult<()> {
        EmailMessage::update_many()
            .col_expr(email_message::Column::Status, Expr::value(EmailStatus::Failed))
            .col_expr(email_message::Column::LastError, Expr::value(error))
            .col_expr(email_message::Column::UpdatedAt, Expr::value(now.fixed_offset()))
            .filter(email_message::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    /// Apply a provider-reported status to the message with the given
    /// provider id.
    ///
    /// Only applies when `occurred_at` is not older than the last applied
    /// provider event. Returns the number of rows changed.
    pub async fn apply_provider_status(
        &self,
        provider_message_id: &str,
        status: EmailStatus,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        let occurred_at: DateTime<FixedOffset> = occurred_at.fixed_offset();

        let result = EmailMessage::update_many()
            .col_expr(email_message::Column::Status, Expr::value(status))
            .col_expr(email_message::Column::StatusUpdatedAt, Expr::value(occurred_at))
            .col_expr(email_message::Column::UpdatedAt, Expr::value(now.fixed_offset()))
            .filter(email_message::Column::ProviderMessageId.eq(provider_message_id))
            .filter(
                Condition::any()
                    .add(email_message::Column::StatusUpdatedAt.is_null())
                    .add(email_message::Column::StatusUpdatedAt.lte(occurred_at)),
            )
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected)
    }

}

fn map_insert_error(err: DbErr) -> AppError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(detail)) => AppError::Conflict(detail),
        _ => AppError::Database(err.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    fn create_test_message(id: &str, status: EmailStatus) -> email_message::Model {
        let now = Utc::now().fixed_offset();
        email_message::Model {
            id: id.to_string(),
            to_email: "a@b.com".to_string(),
            to_user_id: None,
            provider: "log".to_string(),
            template_key: "auth-welcome".to_string(),
            message_type: email_message::MessageType::Transactional,
            topic: "auth".to_string(),
            status,
            subject: "Welcome".to_string(),
            from_email: "Atelier <hello@example.com>".to_string(),
            reply_to: None,
            html: "<p>Hi</p>".to_string(),
            text: "Hi".to_string(),
            correlation_key: None,
            idempotency_key: Some("user:1:welcome".to_string()),
            scheduled_at: None,
            payload: serde_json::json!({}),
            metadata: serde_json::json!({}),
            attempts: 0,
            provider_message_id: None,
            last_error: None,
            sent_at: None,
            status_updated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_find_by_idempotency_key() {
        let message = create_test_message("msg1", EmailStatus::Queued);

        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[message]])
                .into_connection(),
        );

        let repo = EmailMessageRepository::new(db);
        let found = repo
            .find_by_idempotency_key("user:1:welcome")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(found.id, "msg1");
    }

    #[tokio::test]
    async fn test_find_by_provider_message_id_not_found() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([Vec::<email_message::Model>::new()])
                .into_connection(),
        );

        let repo = EmailMessageRepository::new(db);
        assert!(repo.find_by_provider_message_id("re_123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_provider_status_reports_rows() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 0,
                }])
                .into_connection(),
        );

        let repo = EmailMessageRepository::new(db);
        let changed = repo
            .apply_provider_status("re_123", EmailStatus::Bounced, Utc::now(), Utc::now())
            .await
            .unwrap();

        assert_eq!(changed, 0);
    }
}
