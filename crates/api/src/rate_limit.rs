//! Per-client rate limiting middleware.
//!
//! Counts are kept by [`atelier_core::RateLimiter`], so they are shared
//! between instances while the database is reachable.

use std::net::{IpAddr, SocketAddr};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::middleware::AppState;

/// Rate limit error response.
#[derive(Debug)]
pub struct RateLimitError {
    /// Seconds until the window resets.
    pub retry_after: u64,
    /// Requests allowed per window.
    pub limit: u32,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": "RATE_LIMITED",
                "message": "Too many requests",
                "retryAfter": self.retry_after
            }
        });

        (
            StatusCode::TOO_MANY_REQUESTS,
            [
                ("Retry-After", self.retry_after.to_string()),
                ("X-RateLimit-Limit", self.limit.to_string()),
                ("X-RateLimit-Remaining", "0".to_string()),
                ("Content-Type", "application/json".to_string()),
            ],
            body.to_string(),
        )
            .into_response()
    }
}

/// Extract client IP from request.
///
/// Forwarding headers are only read when the connecting peer is one of
/// `trusted`; anyone else could put any address there.
fn extract_client_ip(req: &Request<Body>, trusted: &[IpAddr]) -> Option<IpAddr> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if !peer.is_some_and(|ip| trusted.contains(&ip)) {
        return peer;
    }

    // Nearest hop that is not one of our proxies
    if let Some(ip) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.rsplit(',')
                .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
                .find(|ip| !trusted.contains(ip))
        })
    {
        return Some(ip);
    }

    if let Some(ip) = req
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        return Some(ip);
    }

    peer
}

/// Bound provider webhook requests per client IP.
pub async fn webhook_rate_limit(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, RateLimitError> {
    let client = extract_client_ip(&req, &state.trusted_proxies)
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
    let key = format!("email-webhook:ip:{client}");

    let decision = state.rate_limiter.check(&key, state.webhook_rule).await;
    let reset = decision.retry_after_secs(state.rate_limiter.now());

    if !decision.allowed {
        warn!(key = %key, retry_after = reset, "Webhook rate limit exceeded");
        return Err(RateLimitError {
            retry_after: reset.max(1),
            limit: decision.limit,
        });
    }

    let mut response = next.run(req).await;

    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", decision.limit.into());
    headers.insert("X-RateLimit-Remaining", decision.remaining.into());
    headers.insert("X-RateLimit-Reset", reset.into());

    Ok(response)
}
