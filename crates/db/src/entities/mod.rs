//! Database entities.

#![allow(missing_docs)]

pub mod background_task;
pub mod email_event;
pub mod email_message;
pub mod rate_limit_bucket;

pub use background_task::Entity as BackgroundTask;
pub use email_event::Entity as EmailEvent;
pub use email_message::Entity as EmailMessage;
pub use rate_limit_bucket::Entity as RateLimitBucket;
