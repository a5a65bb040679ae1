//! HTTP API layer for atelier.
//!
//! - **Email**: provider webhook intake, bounded per client IP
//! - **Ops**: bearer-guarded queue drain and message retry
//! - **Middleware**: shared state and rate limiting
//!
//! Built on Axum 0.8 with Tower middleware stack.

pub mod endpoints;
pub mod extractors;
pub mod middleware;
pub mod rate_limit;
pub mod response;

pub use endpoints::router;
pub use middleware::AppState;
pub use rate_limit::{RateLimitError, webhook_rate_limit};
