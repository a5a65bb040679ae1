//! Operator endpoints.
//!
//! Guarded by [`OpsAuth`]; every route answers 403 while no ops token is
//! configured.

use atelier_common::{AppError, AppResult};
use atelier_db::entities::{email_event, email_message};
use atelier_queue::DrainReport;
use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{extractors::OpsAuth, middleware::AppState, response::ApiResponse};

const DEFAULT_DRAIN_LIMIT: usize = 50;

/// Drain request; an empty body drains the default batch.
///
/// The batch is bounded so a drain fits inside the request timeout.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DrainRequest {
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<usize>,
}

/// Retry response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub message_id: String,
    pub task_id: String,
}

/// A message with its delivery history.
#[derive(Debug, Serialize)]
pub struct MessageDetail {
    pub message: email_message::Model,
    pub events: Vec<email_event::Model>,
}

/// Process due background tasks now.
async fn drain_tasks(
    _auth: OpsAuth,
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<ApiResponse<DrainReport>> {
    let req: DrainRequest = if body.iter().all(u8::is_ascii_whitespace) {
        DrainRequest::default()
    } else {
        serde_json::from_slice(&body)?
    };
    req.validate()?;

    let report = state
        .task_queue
        .drain(req.limit.unwrap_or(DEFAULT_DRAIN_LIMIT))
        .await?;
    Ok(ApiResponse::ok(report))
}

/// Enqueue another send for a failed message.
async fn retry_message(
    _auth: OpsAuth,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<ApiResponse<RetryResponse>> {
    let task = state.email_service.retry_email_message(&id).await?;
    Ok(ApiResponse::accepted(RetryResponse {
        message_id: id,
        task_id: task.id,
    }))
}

/// Show a message and its events.
async fn show_message(
    _auth: OpsAuth,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<ApiResponse<MessageDetail>> {
    let message = state
        .email_store
        .find_message(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Email message: {id}")))?;
    let events = state.email_store.events_for_message(&id).await?;
    Ok(ApiResponse::ok(MessageDetail { message, events }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks/drain", post(drain_tasks))
        .route("/email/messages/{id}", get(show_message))
        .route("/email/messages/{id}/retry", post(retry_message))
}
