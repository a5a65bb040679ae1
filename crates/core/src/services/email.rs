//! Templated email queuing.
//!
//! Producers render a template, persist an [`email_message`] row and enqueue
//! an `email.send` task for it. Rendering and storage errors reach the
//! caller. A message whose task could not be stored is left `failed`.

use std::sync::Arc;

use atelier_common::config::EmailConfig;
use atelier_common::{AppError, AppResult, IdGenerator, SharedClock};
use atelier_db::entities::email_message::{self, EmailStatus, MessageType};
use atelier_queue::{Task, TaskName, TaskQueue};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use validator::Validate;

use super::email_template::TemplateRenderer;

/// Recipients of a bulk send queued at the same time.
const BULK_CONCURRENCY: usize = 8;

/// Input for [`EmailService::queue_templated_email`].
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct QueueEmailInput {
    /// Recipient.
    #[validate(email)]
    pub to_email: String,
    /// Recipient user, when known.
    pub to_user_id: Option<String>,
    /// Template to render.
    #[validate(length(min = 1, max = 100))]
    pub template_key: String,
    /// Template data.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Topic tag; defaults to the template's.
    #[validate(length(min = 1, max = 100))]
    pub topic: Option<String>,
    /// Message category; defaults to the template's.
    pub message_type: Option<MessageType>,
    /// Caller-defined grouping key.
    pub correlation_key: Option<String>,
    /// At most one message is ever queued per key.
    #[validate(length(min = 1, max = 255))]
    pub idempotency_key: Option<String>,
    /// Delivery time handed to the provider.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Earliest time the send task runs.
    pub run_at: Option<DateTime<Utc>>,
    /// Reply-to override.
    #[validate(email)]
    pub reply_to: Option<String>,
    /// Free-form metadata stored on the message.
    pub metadata: Option<serde_json::Value>,
}

/// One recipient of a bulk send.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRecipient {
    /// Recipient.
    pub to_email: String,
    /// Recipient user, when known.
    pub to_user_id: Option<String>,
    /// Fields merged over the shared payload.
    pub payload: Option<serde_json::Value>,
}

/// Input for [`EmailService::queue_bulk_templated_email`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkQueueEmailInput {
    /// Recipients.
    pub recipients: Vec<BulkRecipient>,
    /// Template to render.
    pub template_key: String,
    /// Payload shared by every recipient.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Topic tag; defaults to the template's.
    pub topic: Option<String>,
    /// Message category; defaults to the template's.
    pub message_type: Option<MessageType>,
    /// Grouping key, also part of each recipient's idempotency key.
    pub correlation_key: Option<String>,
    /// Delivery time handed to the provider.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Earliest time the send tasks run.
    pub run_at: Option<DateTime<Utc>>,
    /// Metadata stored on each message.
    pub metadata: Option<serde_json::Value>,
}

/// Outcome of a bulk send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkQueueReport {
    /// Recipients with a queued (or already existing) message.
    pub queued: usize,
    /// Recipients that could not be queued.
    pub failed: usize,
}

/// Producer API of the email pipeline.
#[derive(Clone)]
pub struct EmailService {
    store: Arc<dyn super::email_store::EmailStore>,
    renderer: Arc<dyn TemplateRenderer>,
    queue: TaskQueue,
    clock: SharedClock,
    id_gen: IdGenerator,
    provider_name: String,
    from: String,
    reply_to: Option<String>,
}

impl EmailService {
    /// Create the service.
    #[must_use]
    pub fn new(
        store: Arc<dyn super::email_store::EmailStore>,
        renderer: Arc<dyn TemplateRenderer>,
        queue: TaskQueue,
        clock: SharedClock,
        provider_name: impl Into<String>,
        config: &EmailConfig,
    ) -> Self {
        Self {
            store,
            renderer,
            queue,
            clock,
            id_gen: IdGenerator::new(),
            provider_name: provider_name.into(),
            from: config.from_header(),
            reply_to: config.reply_to.clone(),
        }
    }

    /// Render, persist and enqueue one message.
    ///
    /// With an idempotency key that is already taken, the existing message is
    /// returned and nothing is enqueued, unless that message was stored but
    /// its send task never was. If enqueueing fails, the message is marked
    /// failed so a later call with the same key (or a retry) sends it.
    pub async fn queue_templated_email(
        &self,
        input: QueueEmailInput,
    ) -> AppResult<email_message::Model> {
        input.validate()?;

        if let Some(key) = &input.idempotency_key {
            if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                if existing.status == EmailStatus::Failed && existing.attempts == 0 {
                    // Stored, but its send task never was.
                    let task = self.enqueue_send(&existing.id, input.run_at).await?;
                    info!(
                        message_id = %existing.id,
                        task_id = %task.id,
                        idempotency_key = %key,
                        "Re-enqueued email that was never handed to the queue"
                    );
                    return Ok(existing);
                }
                info!(
                    message_id = %existing.id,
                    idempotency_key = %key,
                    "Email already queued for idempotency key"
                );
                return Ok(existing);
            }
        }

        let rendered = self.renderer.render(&input.template_key, &input.payload)?;
        let (default_topic, default_type) = self
            .renderer
            .defaults(&input.template_key)
            .unwrap_or(("general", MessageType::Transactional));

        let idempotency_key = input.idempotency_key.clone();
        let run_at = input.run_at;
        let now = self.clock.utc().fixed_offset();
        let message = email_message::Model {
            id: self.id_gen.generate(),
            to_email: input.to_email,
            to_user_id: input.to_user_id,
            provider: self.provider_name.clone(),
            template_key: input.template_key,
            message_type: input.message_type.unwrap_or(default_type),
            topic: input.topic.unwrap_or_else(|| default_topic.to_string()),
            status: EmailStatus::Queued,
            subject: rendered.subject,
            from_email: self.from.clone(),
            reply_to: input.reply_to.or_else(|| self.reply_to.clone()),
            html: rendered.html,
            text: rendered.text,
            correlation_key: input.correlation_key,
            idempotency_key: input.idempotency_key,
            scheduled_at: input.scheduled_at.map(|at| at.fixed_offset()),
            payload: input.payload,
            metadata: input.metadata.unwrap_or_else(|| json!({})),
            attempts: 0,
            provider_message_id: None,
            last_error: None,
            sent_at: None,
            status_updated_at: None,
            created_at: now,
            updated_at: now,
        };

        let message = match (self.store.insert_message(message).await, idempotency_key) {
            (Ok(message), _) => message,
            // A concurrent producer won the race for the same key.
            (Err(AppError::Conflict(_)), Some(key)) => {
                return self
                    .store
                    .find_by_idempotency_key(&key)
                    .await?
                    .ok_or_else(|| AppError::Conflict(format!("Idempotency key in use: {key}")));
            }
            (Err(e), _) => return Err(e),
        };

        let task = match self.enqueue_send(&message.id, run_at).await {
            Ok(task) => task,
            Err(e) => {
                // A queued message with no task would never be sent; leave it retryable.
                let reason = format!("Enqueue failed: {e}");
                if let Err(mark_err) = self
                    .store
                    .mark_failed(&message.id, &reason, self.clock.utc())
                    .await
                {
                    error!(message_id = %message.id, error = %mark_err, "Failed to mark unqueued email as failed");
                }
                warn!(message_id = %message.id, error = %e, "Failed to enqueue email send");
                return Err(e);
            }
        };

        info!(
            message_id = %message.id,
            task_id = %task.id,
            template_key = %message.template_key,
            topic = %message.topic,
            "Queued templated email"
        );
        Ok(message)
    }

    /// Queue one message per recipient.
    ///
    /// Each recipient gets the idempotency key
    /// `topic:templateKey:email:correlationKey` (or its list index when no
    /// correlation key is given). At most `BULK_CONCURRENCY` recipients are
    /// in flight at once. A failing recipient is counted, never aborts the
    /// batch.
    pub async fn queue_bulk_templated_email(&self, input: BulkQueueEmailInput) -> BulkQueueReport {
        let topic = input.topic.clone().unwrap_or_else(|| {
            self.renderer
                .defaults(&input.template_key)
                .map_or("general", |(topic, _)| topic)
                .to_string()
        });

        let sends = input.recipients.into_iter().enumerate().map(|(index, recipient)| {
            let discriminator = input
                .correlation_key
                .clone()
                .unwrap_or_else(|| index.to_string());
            let idempotency_key = format!(
                "{topic}:{}:{}:{discriminator}",
                input.template_key, recipient.to_email
            );
            let to_email = recipient.to_email.clone();

            let single = QueueEmailInput {
                to_email: recipient.to_email,
                to_user_id: recipient.to_user_id,
                template_key: input.template_key.clone(),
                payload: merge_payload(&input.payload, recipient.payload),
                topic: Some(topic.clone()),
                message_type: input.message_type,
                correlation_key: input.correlation_key.clone(),
                idempotency_key: Some(idempotency_key),
                scheduled_at: input.scheduled_at,
                run_at: input.run_at,
                reply_to: None,
                metadata: input.metadata.clone(),
            };

            async move { (to_email, self.queue_templated_email(single).await) }
        });

        let mut report = BulkQueueReport::default();
        let results: Vec<_> = stream::iter(sends)
            .buffer_unordered(BULK_CONCURRENCY)
            .collect()
            .await;
        for (to_email, result) in results {
            match result {
                Ok(_) => report.queued += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(to_email = %to_email, error = %e, "Failed to queue bulk email recipient");
                }
            }
        }

        info!(
            template_key = %input.template_key,
            topic = %topic,
            queued = report.queued,
            failed = report.failed,
            "Queued bulk templated email"
        );
        report
    }

    /// Enqueue another send for a message whose delivery failed.
    pub async fn retry_email_message(&self, id: &str) -> AppResult<Task> {
        let message = self
            .store
            .find_message(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Email message: {id}")))?;

        if message.status != EmailStatus::Failed {
            return Err(AppError::BadRequest(format!(
                "Only failed messages can be retried (message is {})",
                status_name(message.status)
            )));
        }

        let task = self.enqueue_send(&message.id, None).await?;
        info!(message_id = %message.id, task_id = %task.id, "Retrying email message");
        Ok(task)
    }

    async fn enqueue_send(&self, message_id: &str, run_at: Option<DateTime<Utc>>) -> AppResult<Task> {
        self.queue
            .enqueue(TaskName::EmailSend, json!({ "messageId": message_id }), run_at)
            .await
    }
}

fn merge_payload(base: &serde_json::Value, overrides: Option<serde_json::Value>) -> serde_json::Value {
    match (base, overrides) {
        (serde_json::Value::Object(base), Some(serde_json::Value::Object(extra))) => {
            let mut merged = base.clone();
            merged.extend(extra);
            serde_json::Value::Object(merged)
        }
        (_, Some(extra)) => extra,
        (base, None) => base.clone(),
    }
}

fn status_name(status: EmailStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{status:?}"))
}
