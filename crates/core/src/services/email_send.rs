//! Handler for `email.send` tasks.
//!
//! Provider failures are recorded on the message and never fail the task:
//! resending a failed message is an explicit operator action
//! ([`EmailService::retry_email_message`](super::email::EmailService::retry_email_message)).

use std::sync::Arc;

use async_trait::async_trait;
use atelier_common::{AppError, AppResult, IdGenerator, SharedClock};
use atelier_db::entities::{email_event, email_message};
use atelier_queue::{HandlerOutcome, Task, TaskHandler};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::email_provider::{EmailProvider, EmailTag, OutgoingEmail};
use super::email_store::EmailStore;

/// Event type appended after the provider accepted a message.
pub const EVENT_SENT: &str = "email.sent";
/// Event type appended after the provider rejected a message.
pub const EVENT_FAILED: &str = "email.failed";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmailSendPayload {
    message_id: String,
}

/// Sends a persisted message through the configured provider.
#[derive(Clone)]
pub struct EmailSendHandler {
    store: Arc<dyn EmailStore>,
    provider: Arc<dyn EmailProvider>,
    clock: SharedClock,
    id_gen: IdGenerator,
}

impl EmailSendHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(
        store: Arc<dyn EmailStore>,
        provider: Arc<dyn EmailProvider>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            provider,
            clock,
            id_gen: IdGenerator::new(),
        }
    }

    fn outgoing(message: &email_message::Model) -> OutgoingEmail {
        OutgoingEmail {
            to: message.to_email.clone(),
            subject: message.subject.clone(),
            html: message.html.clone(),
            text: message.text.clone(),
            from: message.from_email.clone(),
            reply_to: message.reply_to.clone(),
            idempotency_key: message.idempotency_key.clone(),
            scheduled_at: message.scheduled_at.map(|at| at.with_timezone(&chrono::Utc)),
            tags: vec![
                EmailTag::new("topic", &message.topic),
                EmailTag::new("template", &message.template_key),
            ],
        }
    }

    async fn record_event(
        &self,
        message: &email_message::Model,
        event_type: &str,
        payload: serde_json::Value,
    ) -> AppResult<()> {
        let now = self.clock.utc().fixed_offset();
        self.store
            .append_event(email_event::Model {
                id: self.id_gen.generate(),
                message_id: Some(message.id.clone()),
                event_type: event_type.to_string(),
                provider_event_id: None,
                email: Some(message.to_email.clone()),
                occurred_at: now,
                payload,
                created_at: now,
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for EmailSendHandler {
    async fn handle(&self, task: &Task) -> AppResult<HandlerOutcome> {
        let payload: EmailSendPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| AppError::BadRequest(format!("Invalid email.send payload: {e}")))?;

        let Some(message) = self.store.find_message(&payload.message_id).await? else {
            warn!(task_id = %task.id, message_id = %payload.message_id, "Email message not found");
            return Ok(HandlerOutcome::skipped("not-found"));
        };

        if !message.status.is_sendable() {
            return Ok(HandlerOutcome::skipped("already-processed"));
        }

        self.store
            .increment_attempts(&message.id, self.clock.utc())
            .await?;

        match self.provider.send(&Self::outgoing(&message)).await {
            Ok(receipt) => {
                self.store
                    .mark_sent(&message.id, &receipt.provider_message_id, self.clock.utc())
                    .await?;
                self.record_event(
                    &message,
                    EVENT_SENT,
                    json!({
                        "provider": self.provider.name(),
                        "providerMessageId": receipt.provider_message_id,
                    }),
                )
                .await?;
                info!(
                    message_id = %message.id,
                    provider = self.provider.name(),
                    provider_message_id = %receipt.provider_message_id,
                    "Email sent"
                );
            }
            Err(e) => {
                let reason = e.to_string();
                self.store
                    .mark_failed(&message.id, &reason, self.clock.utc())
                    .await?;
                self.record_event(
                    &message,
                    EVENT_FAILED,
                    json!({ "provider": self.provider.name(), "error": reason }),
                )
                .await?;
                error!(
                    message_id = %message.id,
                    provider = self.provider.name(),
                    attempts = message.attempts + 1,
                    error = %reason,
                    "Email send failed"
                );
            }
        }

        Ok(HandlerOutcome::Processed)
    }
}
