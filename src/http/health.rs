//! `GET /health` and `GET /queue`

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use super::{ApiError, AppState};
use crate::model::QueueCounts;

pub async fn health_check(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.queue.health_check_async().await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn queue_counts(State(state): State<AppState>) -> Result<Json<QueueCounts>, ApiError> {
    Ok(Json(state.queue.counts_async().await?))
}
