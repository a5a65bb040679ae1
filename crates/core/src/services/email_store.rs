//! Persistence for email messages and their delivery events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use atelier_common::{AppError, AppResult};
use atelier_db::entities::{
    email_event,
    email_message::{self, EmailStatus},
};
use atelier_db::repositories::{EmailEventRepository, EmailMessageRepository};
use chrono::{DateTime, Utc};
use sea_orm::ActiveModelTrait;
use tokio::sync::Mutex;

/// Message and event storage used by the email pipeline.
#[async_trait]
pub trait EmailStore: Send + Sync {
    /// Find a message by ID.
    async fn find_message(&self, id: &str) -> AppResult<Option<email_message::Model>>;

    /// Find a message by idempotency key.
    async fn find_by_idempotency_key(&self, key: &str) -> AppResult<Option<email_message::Model>>;

    /// Find a message by provider message id.
    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> AppResult<Option<email_message::Model>>;

    /// Insert a message. A taken idempotency key is [`AppError::Conflict`].
    async fn insert_message(&self, message: email_message::Model) -> AppResult<email_message::Model>;

    /// Bump the provider attempt counter.
    async fn increment_attempts(&self, id: &str, now: DateTime<Utc>) -> AppResult<()>;

    /// Record provider acceptance.
    async fn mark_sent(&self, id: &str, provider_message_id: &str, now: DateTime<Utc>)
    -> AppResult<()>;

    /// Record a provider failure.
    async fn mark_failed(&self, id: &str, error: &str, now: DateTime<Utc>) -> AppResult<()>;

    /// Apply a webhook status unless a newer provider event already did.
    /// Returns the number of messages changed.
    async fn apply_provider_status(
        &self,
        provider_message_id: &str,
        status: EmailStatus,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<u64>;

    /// Append a delivery event.
    async fn append_event(&self, event: email_event::Model) -> AppResult<email_event::Model>;

    /// Delivery history of a message, oldest first.
    async fn events_for_message(&self, message_id: &str) -> AppResult<Vec<email_event::Model>>;
}

/// `PostgreSQL` email store.
#[derive(Clone)]
pub struct SeaOrmEmailStore {
    messages: EmailMessageRepository,
    events: EmailEventRepository,
}

impl SeaOrmEmailStore {
    /// Create a store over the message and event repositories.
    #[must_use]
    pub const fn new(messages: EmailMessageRepository, events: EmailEventRepository) -> Self {
        Self { messages, events }
    }
}

#[async_trait]
impl EmailStore for SeaOrmEmailStore {
    async fn find_message(&self, id: &str) -> AppResult<Option<email_message::Model>> {
        self.messages.find_by_id(id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> AppResult<Option<email_message::Model>> {
        self.messages.find_by_idempotency_key(key).await
    }

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> AppResult<Option<email_message::Model>> {
        self.messages
            .find_by_provider_message_id(provider_message_id)
            .await
    }

    async fn insert_message(&self, message: email_message::Model) -> AppResult<email_message::Model> {
        let active = email_message::ActiveModel::from(message).reset_all();
        self.messages.create(active).await
    }

    async fn increment_attempts(&self, id: &str, now: DateTime<Utc>) -> AppResult<()> {
        self.messages.increment_attempts(id, now).await
    }

    async fn mark_sent(
        &self,
        id: &str,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        self.messages.mark_sent(id, provider_message_id, now).await
    }

    async fn mark_failed(&self, id: &str, error: &str, now: DateTime<Utc>) -> AppResult<()> {
        self.messages.mark_failed(id, error, now).await
    }

    async fn apply_provider_status(
        &self,
        provider_message_id: &str,
        status: EmailStatus,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        self.messages
            .apply_provider_status(provider_message_id, status, occurred_at, now)
            .await
    }

    async fn append_event(&self, event: email_event::Model) -> AppResult<email_event::Model> {
        let active = email_event::ActiveModel::from(event).reset_all();
        self.events.create(active).await
    }

    async fn events_for_message(&self, message_id: &str) -> AppResult<Vec<email_event::Model>> {
        self.events.find_by_message_id(message_id).await
    }
}

#[derive(Default)]
struct MemoryState {
    messages: HashMap<String, email_message::Model>,
    events: Vec<email_event::Model>,
}

/// In-memory email store for tests and database-less development.
#[derive(Clone, Default)]
pub struct MemoryEmailStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryEmailStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    pub async fn message_count(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    /// Every stored event in insertion order.
    pub async fn all_events(&self) -> Vec<email_event::Model> {
        self.state.lock().await.events.clone()
    }
}

#[async_trait]
impl EmailStore for MemoryEmailStore {
    async fn find_message(&self, id: &str) -> AppResult<Option<email_message::Model>> {
        Ok(self.state.lock().await.messages.get(id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> AppResult<Option<email_message::Model>> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .find(|m| m.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> AppResult<Option<email_message::Model>> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .find(|m| m.provider_message_id.as_deref() == Some(provider_message_id))
            .cloned())
    }

    async fn insert_message(&self, message: email_message::Model) -> AppResult<email_message::Model> {
        let mut state = self.state.lock().await;
        if let Some(key) = &message.idempotency_key {
            if state
                .messages
                .values()
                .any(|m| m.idempotency_key.as_ref() == Some(key))
            {
                return Err(AppError::Conflict(format!("Idempotency key already used: {key}")));
            }
        }
        if state.messages.contains_key(&message.id) {
            return Err(AppError::Conflict(format!("Duplicate message id: {}", message.id)));
        }
        state.messages.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn increment_attempts(&self, id: &str, now: DateTime<Utc>) -> AppResult<()> {
        if let Some(m) = self.state.lock().await.messages.get_mut(id) {
            m.attempts += 1;
            m.updated_at = now.fixed_offset();
        }
        Ok(())
    }

    async fn mark_sent(
        &self,
        id: &str,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        if let Some(m) = self.state.lock().await.messages.get_mut(id) {
            m.status = EmailStatus::Sent;
            m.provider_message_id = Some(provider_message_id.to_string());
            m.last_error = None;
            m.sent_at = Some(now.fixed_offset());
            m.updated_at = now.fixed_offset();
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str, now: DateTime<Utc>) -> AppResult<()> {
        if let Some(m) = self.state.lock().await.messages.get_mut(id) {
            m.status = EmailStatus::Failed;
            m.last_error = Some(error.to_string());
            m.updated_at = now.fixed_offset();
        }
        Ok(())
    }

    async fn apply_provider_status(
        &self,
        provider_message_id: &str,
        status: EmailStatus,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for m in state.messages.values_mut() {
            if m.provider_message_id.as_deref() != Some(provider_message_id) {
                continue;
            }
            if m.status_updated_at.is_some_and(|last| last > occurred_at) {
                continue;
            }
            m.status = status;
            m.status_updated_at = Some(occurred_at.fixed_offset());
            m.updated_at = now.fixed_offset();
            changed += 1;
        }
        Ok(changed)
    }

    async fn append_event(&self, event: email_event::Model) -> AppResult<email_event::Model> {
        self.state.lock().await.events.push(event.clone());
        Ok(event)
    }

    async fn events_for_message(&self, message_id: &str) -> AppResult<Vec<email_event::Model>> {
        let state = self.state.lock().await;
        let mut events: Vec<_> = state
            .events
            .iter()
            .filter(|e| e.message_id.as_deref() == Some(message_id))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.occurred_at, e.created_at));
        Ok(events)
    }
}
