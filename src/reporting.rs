//! Reporting service: read-only aggregates over persisted events.

use std::sync::Arc;

use crate::error::Result;
use crate::store::{EventStore, SiteStats, StatsQuery};
use crate::validate::{ValidationError, parse_date};

#[derive(Clone)]
pub struct ReportingService {
    store: Arc<dyn EventStore>,
}

impl ReportingService {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Stats for `site_id`, optionally restricted to one UTC `date`
    /// (`YYYY-MM-DD`).
    pub async fn site_stats(&self, site_id: &str, date: Option<&str>) -> Result<SiteStats> {
        if site_id.is_empty() {
            return Err(ValidationError::Missing("site_id").into());
        }
        let date = date.filter(|d| !d.is_empty()).map(parse_date).transpose()?;

        let stats = self
            .store
            .site_stats(&StatsQuery {
                site_id: site_id.to_string(),
                date,
            })
            .await?;
        Ok(stats)
    }
}
