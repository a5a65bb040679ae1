//! Email pipeline and rate limiting services.

pub mod email;
pub mod email_provider;
pub mod email_send;
pub mod email_store;
pub mod email_template;
pub mod email_webhook;
pub mod rate_limit;

pub use email::{BulkQueueEmailInput, BulkQueueReport, BulkRecipient, EmailService, QueueEmailInput};
pub use email_provider::{
    EmailProvider, EmailTag, LogProvider, OutgoingEmail, ResendProvider, SendReceipt,
    provider_from_config,
};
pub use email_send::EmailSendHandler;
pub use email_store::{EmailStore, MemoryEmailStore, SeaOrmEmailStore};
pub use email_template::{BuiltinTemplates, RenderedEmail, TemplateKey, TemplateRenderer};
pub use email_webhook::{
    WebhookEnvelope, WebhookError, WebhookHeaders, WebhookOutcome, WebhookReconciler,
};
pub use rate_limit::{
    MemoryRateLimitBackend, PostgresRateLimitBackend, RateLimitBackend, RateLimitDecision,
    RateLimitRule, RateLimiter,
};
