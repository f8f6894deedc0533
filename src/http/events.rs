//! `POST /event`

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use serde::Serialize;

use super::{ApiError, AppState};
use crate::model::RawEvent;

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub status: &'static str,
}

/// Validate and enqueue one event.
///
/// Malformed JSON and wrongly typed fields are rejected like any other
/// validation failure, with a 400.
pub async fn ingest_event(
    State(state): State<AppState>,
    body: Result<Json<RawEvent>, JsonRejection>,
) -> Result<Json<Accepted>, ApiError> {
    let Json(raw) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    state.ingest.ingest(raw).await?;
    Ok(Json(Accepted { status: "ok" }))
}
