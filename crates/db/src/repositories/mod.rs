//! Database repositories.

mod background_task;
mod email_event;
mod email_message;
mod rate_limit_bucket;

pub use background_task::BackgroundTaskRepository;
pub use email_event::EmailEventRepository;
pub use email_message::EmailMessageRepository;
pub use rate_limit_bucket::RateLimitBucketRepository;
