//! Email providers.

use std::time::Duration;

use async_trait::async_trait;
use atelier_common::config::{EmailConfig, EmailProviderKind};
use atelier_common::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A provider tag attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailTag {
    /// Tag name.
    pub name: String,
    /// Tag value.
    pub value: String,
}

impl EmailTag {
    /// Create a tag. Characters outside `[A-Za-z0-9_-]` become `_`.
    #[must_use]
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: sanitize_tag(name),
            value: sanitize_tag(value),
        }
    }
}

fn sanitize_tag(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// A message handed to a provider.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    /// Recipient.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// HTML body.
    pub html: String,
    /// Plain text body.
    pub text: String,
    /// Sender, `Name <address>`.
    pub from: String,
    /// Reply-to address.
    pub reply_to: Option<String>,
    /// Provider-side deduplication key.
    pub idempotency_key: Option<String>,
    /// Provider-side scheduled delivery.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Tags.
    pub tags: Vec<EmailTag>,
}

/// What the provider returned for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Provider-assigned message id.
    pub provider_message_id: String,
}

/// Delivers email.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Name stored on each message.
    fn name(&self) -> &'static str;

    /// Hand a message to the provider.
    async fn send(&self, email: &OutgoingEmail) -> AppResult<SendReceipt>;
}

/// Build the provider selected in `config`.
pub fn provider_from_config(config: &EmailConfig) -> AppResult<Arc<dyn EmailProvider>> {
    match config.provider {
        EmailProviderKind::Log => Ok(Arc::new(LogProvider)),
        EmailProviderKind::Resend => {
            let api_key = config
                .api_key
                .clone()
                .ok_or_else(|| AppError::Config("email.api_key is required for resend".to_string()))?;
            Ok(Arc::new(ResendProvider::new(api_key, config.api_base_url.clone())?))
        }
    }
}

/// Resend HTTP API.
#[derive(Clone)]
pub struct ResendProvider {
    http_client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduled_at: Option<String>,
    #[serde(skip_serializing_if = "<[EmailTag]>::is_empty")]
    tags: &'a [EmailTag],
}

#[derive(Deserialize)]
struct ResendResponse {
    id: String,
}

impl ResendProvider {
    /// Create a provider for `base_url` (normally `https://api.resend.com`).
    pub fn new(api_key: String, base_url: String) -> AppResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EmailProvider for ResendProvider {
    fn name(&self) -> &'static str {
        "resend"
    }

    async fn send(&self, email: &OutgoingEmail) -> AppResult<SendReceipt> {
        let body = ResendRequest {
            from: &email.from,
            to: [&email.to],
            subject: &email.subject,
            html: &email.html,
            text: &email.text,
            reply_to: email.reply_to.as_deref(),
            scheduled_at: email.scheduled_at.map(|at| at.to_rfc3339()),
            tags: &email.tags,
        };

        let mut request = self
            .http_client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);
        if let Some(key) = &email.idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("Resend request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalService(format!(
                "Resend returned {status}: {error_text}"
            )));
        }

        let result: ResendResponse = response
            .json()
            .await
            .map_err(|e| AppError::ExternalService(format!("Invalid Resend response: {e}")))?;

        Ok(SendReceipt {
            provider_message_id: result.id,
        })
    }
}

/// Logs messages instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProvider;

#[async_trait]
impl EmailProvider for LogProvider {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, email: &OutgoingEmail) -> AppResult<SendReceipt> {
        let provider_message_id = format!("log-{}", uuid::Uuid::new_v4());
        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            provider_message_id = %provider_message_id,
            scheduled_at = ?email.scheduled_at,
            "Email not sent (log provider)"
        );
        Ok(SendReceipt {
            provider_message_id,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_sanitizing() {
        let tag = EmailTag::new("topic", "news:weekly digest");
        assert_eq!(tag.value, "news_weekly_digest");
        assert_eq!(tag.name, "topic");
    }

    #[test]
    fn test_request_shape() {
        let tags = vec![EmailTag::new("topic", "auth")];
        let body = ResendRequest {
            from: "Atelier <hello@example.com>",
            to: ["a@b.com"],
            subject: "Hi",
            html: "<p>Hi</p>",
            text: "Hi",
            reply_to: None,
            scheduled_at: None,
            tags: &tags,
        };
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["to"][0], "a@b.com");
        assert_eq!(json["tags"][0]["value"], "auth");
        assert!(json.get("reply_to").is_none());
        assert!(json.get("scheduled_at").is_none());
    }

    #[tokio::test]
    async fn test_log_provider_returns_synthetic_id() {
        let receipt = LogProvider
            .send(&OutgoingEmail {
                to: "a@b.com".to_string(),
                subject: "Hi".to_string(),
                html: String::new(),
                text: String::new(),
                from: "x@example.com".to_string(),
                reply_to: None,
                idempotency_key: None,
                scheduled_at: None,
                tags: Vec::new(),
            })
            .await
            .unwrap();

        assert!(receipt.provider_message_id.starts_with("log-"));
    }

    #[test]
    fn test_resend_requires_api_key() {
        let config = EmailConfig {
            provider: EmailProviderKind::Resend,
            api_key: None,
            api_base_url: "https://api.resend.com".to_string(),
            from_address: "hello@example.com".to_string(),
            from_name: "Atelier".to_string(),
            reply_to: None,
            webhook_secret: None,
            site_name: "Atelier".to_string(),
            site_url: "https://atelier.example".to_string(),
        };
        assert!(matches!(
            provider_from_config(&config),
            Err(AppError::Config(_))
        ));
    }
}
