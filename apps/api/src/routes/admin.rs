//! Administrative surface: queue inspection and dead-letter management.
//! Operator authentication is handled upstream by the request layer.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::errors::AppError;
use crate::queue::{DeadLetter, QueueDepths};
use crate::state::AppState;

pub async fn handle_queue_depths(
    State(state): State<AppState>,
) -> Result<Json<QueueDepths>, AppError> {
    Ok(Json(state.queue.depths().await?))
}

#[derive(Debug, Deserialize)]
pub struct DlqListParams {
    #[serde(default = "default_dlq_limit")]
    pub limit: i64,
}

fn default_dlq_limit() -> i64 {
    50
}

pub async fn handle_list_dead_letters(
    State(state): State<AppState>,
    Query(params): Query<DlqListParams>,
) -> Result<Json<Vec<DeadLetter>>, AppError> {
    let letters = state.queue.dead_letters(params.limit.clamp(1, 200)).await?;
    Ok(Json(letters))
}

/// Sends a dead letter back through the pipeline with a fresh retry budget.
pub async fn handle_requeue_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if state.queue.requeue_dead_letter(id).await? {
        info!(dead_letter_id = id, "dead letter requeued for processing");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Dead letter {id} not found")))
    }
}

/// Permanently discards a dead letter. This is the only way a message leaves
/// the pipeline without being processed.
pub async fn handle_discard_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if state.queue.discard_dead_letter(id).await? {
        info!(dead_letter_id = id, "dead letter discarded");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Dead letter {id} not found")))
    }
}
