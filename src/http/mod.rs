//! HTTP surface: ingestion, reporting, health.
//!
//! # Routes
//!
//! - `POST /event` - validate and enqueue one event
//! - `GET /stats?site_id=..&date=YYYY-MM-DD` - aggregate stats for a site
//! - `GET /health` - queue reachable
//! - `GET /queue` - work item counts per state

mod error;
mod events;
mod health;
mod stats;

pub use self::error::ApiError;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::ingest::IngestService;
use crate::queue::DurableQueue;
use crate::reporting::ReportingService;

/// Shared state available to every handler.
#[derive(Clone)]
pub struct AppState {
    pub ingest: IngestService,
    pub reporting: ReportingService,
    pub queue: DurableQueue,
}

/// Build the complete router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/event", post(events::ingest_event))
        .route("/stats", get(stats::site_stats))
        .route("/health", get(health::health_check))
        .route("/queue", get(health::queue_counts))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
