//! Provider webhook reconciliation.
//!
//! Inbound delivery events are verified (Svix-style signatures, as sent by
//! Resend), appended to the event log and, for known event types, applied to
//! the matching message's status. Status changes are ordered by the event's
//! own timestamp, so a late `email.delivered` cannot overwrite a newer
//! `email.bounced`.

use std::sync::Arc;

use atelier_common::{AppError, Environment, IdGenerator, SharedClock};
use atelier_db::entities::{email_event, email_message::EmailStatus};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::email_store::EmailStore;

type HmacSha256 = Hmac<Sha256>;

/// Largest accepted webhook body.
pub const MAX_WEBHOOK_BYTES: usize = 256 * 1024;

/// Allowed clock skew between the signature timestamp and now, in seconds.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 5 * 60;

/// Supported event types and the message status each one sets.
const STATUS_BY_EVENT: [(&str, Option<EmailStatus>); 9] = [
    ("email.sent", Some(EmailStatus::Sent)),
    ("email.delivered", Some(EmailStatus::Delivered)),
    ("email.delivery_delayed", None),
    ("email.bounced", Some(EmailStatus::Bounced)),
    ("email.complained", Some(EmailStatus::Complained)),
    ("email.opened", Some(EmailStatus::Opened)),
    ("email.clicked", Some(EmailStatus::Clicked)),
    ("email.failed", Some(EmailStatus::Failed)),
    ("email.suppressed", Some(EmailStatus::Suppressed)),
];

/// Look up a webhook event type. `None` when unsupported.
#[must_use]
pub fn status_for_event(event_type: &str) -> Option<Option<EmailStatus>> {
    STATUS_BY_EVENT
        .iter()
        .find(|(name, _)| *name == event_type)
        .map(|(_, status)| *status)
}

/// Webhook rejection reasons.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Webhook payload of {0} bytes exceeds {MAX_WEBHOOK_BYTES} bytes")]
    PayloadTooLarge(usize),

    #[error("Missing webhook signature headers")]
    MissingHeaders,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Webhook timestamp outside tolerance")]
    StaleTimestamp,

    #[error("Webhook signing secret is required in production")]
    VerificationRequired,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::PayloadTooLarge(_) => Self::PayloadTooLarge(err.to_string()),
            WebhookError::Store(inner) => inner,
            WebhookError::MissingHeaders
            | WebhookError::InvalidSignature
            | WebhookError::StaleTimestamp
            | WebhookError::VerificationRequired
            | WebhookError::InvalidPayload(_) => Self::BadRequest(err.to_string()),
        }
    }
}

/// Signature headers of a webhook request.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    /// `svix-id`.
    pub id: Option<String>,
    /// `svix-timestamp`, Unix seconds.
    pub timestamp: Option<String>,
    /// `svix-signature`, space-separated `v1,<base64>` entries.
    pub signature: Option<String>,
}

/// Parsed webhook envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    /// Event type, e.g. `email.bounced`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the provider created the event.
    pub created_at: Option<DateTime<Utc>>,
    /// Event data.
    #[serde(default)]
    pub data: WebhookData,
}

/// Data section of a webhook envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookData {
    /// Provider message id.
    pub email_id: Option<String>,
    /// Recipients.
    #[serde(default)]
    pub to: Vec<String>,
}

/// What reconciling one webhook did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOutcome {
    /// Event type from the envelope.
    pub event_type: String,
    /// Whether the event type is supported.
    pub supported: bool,
    /// Whether a message status changed.
    pub status_updated: bool,
    /// Local message the event resolved to.
    pub message_id: Option<String>,
}

/// Verifies, records and applies provider webhooks.
#[derive(Clone)]
pub struct WebhookReconciler {
    store: Arc<dyn EmailStore>,
    secret: Option<Vec<u8>>,
    environment: Environment,
    clock: SharedClock,
    id_gen: IdGenerator,
}

impl WebhookReconciler {
    /// Create a reconciler.
    ///
    /// `secret` is the provider signing secret, optionally prefixed with
    /// `whsec_`, base64 encoded.
    pub fn new(
        store: Arc<dyn EmailStore>,
        secret: Option<&str>,
        environment: Environment,
        clock: SharedClock,
    ) -> Result<Self, AppError> {
        let secret = secret
            .filter(|s| !s.is_empty())
            .map(|s| {
                BASE64
                    .decode(s.strip_prefix("whsec_").unwrap_or(s))
                    .map_err(|e| AppError::Config(format!("Invalid webhook secret: {e}")))
            })
            .transpose()?;

        Ok(Self {
            store,
            secret,
            environment,
            clock,
            id_gen: IdGenerator::new(),
        })
    }

    /// Reconcile one webhook request.
    pub async fn handle(
        &self,
        body: &[u8],
        headers: &WebhookHeaders,
    ) -> Result<WebhookOutcome, WebhookError> {
        if body.len() > MAX_WEBHOOK_BYTES {
            return Err(WebhookError::PayloadTooLarge(body.len()));
        }

        let now = self.clock.utc();
        match &self.secret {
            Some(secret) => verify_signature(secret, body, headers, now)?,
            None if self.environment.is_production() => {
                return Err(WebhookError::VerificationRequired);
            }
            None => debug!("No webhook secret configured, skipping signature check"),
        }

        let raw: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
        let envelope: WebhookEnvelope = serde_json::from_value(raw.clone())
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

        let occurred_at = envelope.created_at.unwrap_or(now);
        let target = status_for_event(&envelope.event_type);
        let supported = target.is_some();
        let provider_message_id = envelope.data.email_id.as_deref();

        let message_id = match provider_message_id {
            Some(pmid) => self
                .store
                .find_by_provider_message_id(pmid)
                .await?
                .map(|m| m.id),
            None => None,
        };

        let mut status_updated = false;
        if let (Some(Some(status)), Some(pmid)) = (target, provider_message_id) {
            let changed = self
                .store
                .apply_provider_status(pmid, status, occurred_at, now)
                .await?;
            status_updated = changed > 0;
        }

        self.store
            .append_event(email_event::Model {
                id: self.id_gen.generate(),
                message_id: message_id.clone(),
                event_type: envelope.event_type.clone(),
                provider_event_id: headers.id.clone(),
                email: envelope.data.to.first().cloned(),
                occurred_at: occurred_at.fixed_offset(),
                payload: raw,
                created_at: now.fixed_offset(),
            })
            .await?;

        if supported {
            info!(
                event_type = %envelope.event_type,
                provider_message_id = ?provider_message_id,
                message_id = ?message_id,
                status_updated,
                "Reconciled email webhook"
            );
        } else {
            warn!(event_type = %envelope.event_type, "Unsupported email webhook type recorded");
        }

        Ok(WebhookOutcome {
            event_type: envelope.event_type,
            supported,
            status_updated,
            message_id,
        })
    }
}

/// Check a Svix-style signature over `{id}.{timestamp}.{body}`.
pub fn verify_signature(
    secret: &[u8],
    body: &[u8],
    headers: &WebhookHeaders,
    now: DateTime<Utc>,
) -> Result<(), WebhookError> {
    let (Some(id), Some(timestamp), Some(signature)) =
        (&headers.id, &headers.timestamp, &headers.signature)
    else {
        return Err(WebhookError::MissingHeaders);
    };

    let sent_at: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| WebhookError::InvalidSignature)?;
    if (now.timestamp() - sent_at).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(WebhookError::StaleTimestamp);
    }

    let mut signed = Vec::with_capacity(id.len() + timestamp.len() + body.len() + 2);
    signed.extend_from_slice(id.as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(timestamp.as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(body);

    let matched = signature
        .split_whitespace()
        .filter_map(|entry| entry.strip_prefix("v1,"))
        .filter_map(|encoded| BASE64.decode(encoded).ok())
        .any(|candidate| {
            HmacSha256::new_from_slice(secret).is_ok_and(|mut mac| {
                mac.update(&signed);
                mac.verify_slice(&candidate).is_ok()
            })
        });

    if matched {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

/// Produce a `v1,<base64>` signature for `{id}.{timestamp}.{body}`.
///
/// Used by tests and local tooling that replay provider webhooks.
#[must_use]
pub fn sign_payload(secret: &[u8], id: &str, timestamp: i64, body: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("v1,{}", BASE64.encode(mac.finalize().into_bytes()))
}
