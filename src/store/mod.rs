//! Storage port: where delivered events end up, and the read side that
//! reporting aggregates over.
//!
//! Inserts are not idempotent. An event redelivered after a crash is stored
//! twice; callers accept that trade-off in exchange for never losing one.

mod memory;

pub use memory::MemoryEventStore;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Event;

/// Maximum number of entries in [`SiteStats::top_paths`].
pub const TOP_PATHS_LIMIT: usize = 10;

/// Why an insert or query did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Connection loss, timeout, pool exhaustion. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),

    /// The store rejected the data itself. Retrying cannot succeed.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Filter for a reporting query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsQuery {
    pub site_id: String,
    /// Restrict to events whose UTC calendar date matches.
    pub date: Option<NaiveDate>,
}

/// Views per path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathViews {
    pub path: String,
    pub views: i64,
}

/// Aggregate statistics for one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteStats {
    pub site_id: String,
    pub date: Option<NaiveDate>,
    pub total_views: i64,
    /// Distinct non-null user ids.
    pub unique_users: i64,
    /// Most viewed paths, views descending then path ascending.
    pub top_paths: Vec<PathViews>,
}

/// The persistence boundary used by workers and reporting.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event. Not deduplicated.
    async fn insert(&self, event: &Event) -> Result<(), StoreError>;

    /// Aggregate the persisted events matching `query`.
    async fn site_stats(&self, query: &StatsQuery) -> Result<SiteStats, StoreError>;
}
