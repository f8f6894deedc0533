//! `GET /stats`

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;

use super::{ApiError, AppState};
use crate::store::SiteStats;

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub site_id: Option<String>,
    pub date: Option<String>,
}

pub async fn site_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Result<Json<SiteStats>, ApiError> {
    let site_id = params
        .site_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("site_id required".to_string()))?;

    let stats = state
        .reporting
        .site_stats(&site_id, params.date.as_deref())
        .await?;
    Ok(Json(stats))
}
