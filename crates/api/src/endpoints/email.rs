//! Email provider webhook endpoints.

use atelier_common::{AppError, AppResult};
use atelier_core::{WebhookHeaders, WebhookOutcome};
use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    middleware,
    routing::post,
};

use crate::{middleware::AppState, rate_limit::webhook_rate_limit, response::ApiResponse};

/// Providers whose webhooks are reconciled.
const SUPPORTED_PROVIDERS: &[&str] = &["resend"];

fn header(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Signature headers, accepting both the `svix-*` and `webhook-*` spellings.
fn webhook_headers(headers: &HeaderMap) -> WebhookHeaders {
    WebhookHeaders {
        id: header(headers, &["svix-id", "webhook-id"]),
        timestamp: header(headers, &["svix-timestamp", "webhook-timestamp"]),
        signature: header(headers, &["svix-signature", "webhook-signature"]),
    }
}

/// Receive a provider delivery event.
///
/// The raw body is kept so the signature can be checked over the exact bytes.
async fn provider_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<ApiResponse<WebhookOutcome>> {
    if !SUPPORTED_PROVIDERS.contains(&provider.as_str()) {
        return Err(AppError::NotFound(format!("Email provider: {provider}")));
    }

    let outcome = state
        .reconciler
        .handle(&body, &webhook_headers(&headers))
        .await
        .inspect_err(|e| tracing::warn!(provider = %provider, error = %e, "Rejected email webhook"))?;

    Ok(ApiResponse::accepted(outcome))
}

pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/webhooks/{provider}", post(provider_webhook))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            webhook_rate_limit,
        ))
}
