//! API middleware.

use std::net::IpAddr;
use std::sync::Arc;

use atelier_core::{EmailService, EmailStore, RateLimitRule, RateLimiter, WebhookReconciler};
use atelier_queue::TaskQueue;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    /// Producer API of the email pipeline.
    pub email_service: EmailService,
    /// Message and event storage, read by the ops endpoints.
    pub email_store: Arc<dyn EmailStore>,
    /// Background task queue.
    pub task_queue: TaskQueue,
    /// Provider webhook reconciliation.
    pub reconciler: WebhookReconciler,
    /// Shared rate limiter.
    pub rate_limiter: RateLimiter,
    /// Limit applied to the webhook route, per client IP.
    pub webhook_rule: RateLimitRule,
    /// Bearer token for the ops routes; `None` disables them.
    pub ops_token: Option<Arc<str>>,
    /// Peers whose forwarding headers name the client.
    pub trusted_proxies: Arc<[IpAddr]>,
}
