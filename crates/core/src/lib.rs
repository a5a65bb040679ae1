//! Core business logic for atelier.
//!
//! Templated email queuing, the `email.send` task handler, provider webhook
//! reconciliation and rate limiting.

pub mod services;

pub use services::*;

use std::sync::Arc;

use atelier_queue::{HandlerRegistry, TaskName};

/// Register every task handler owned by this crate.
///
/// Called once during startup, before any worker drains the queue.
pub async fn register_handlers(registry: &HandlerRegistry, email_send: EmailSendHandler) {
    registry
        .register(TaskName::EmailSend, Arc::new(email_send))
        .await;
}
