//! Request extractors.

use atelier_common::AppError;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::middleware::AppState;

/// Operator authorized by the configured ops token.
#[derive(Debug, Clone, Copy)]
pub struct OpsAuth;

impl FromRequestParts<AppState> for OpsAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.ops_token.as_deref() else {
            return Err(AppError::Forbidden("Ops endpoints are disabled".to_string()));
        };

        let provided = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        match provided {
            Some(token) if tokens_match(token.as_bytes(), expected.as_bytes()) => Ok(Self),
            _ => Err(AppError::Forbidden("Invalid ops token".to_string())),
        }
    }
}

/// Length-then-content comparison that does not short-circuit on content.
fn tokens_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
