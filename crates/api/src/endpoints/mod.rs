//! API endpoints.

mod email;
mod ops;

use axum::Router;

use crate::middleware::AppState;

/// Create the API router.
///
/// `state` is needed up front for the route-scoped rate limit layer.
pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .nest("/email", email::router(state))
        .nest("/ops", ops::router())
}
