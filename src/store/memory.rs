//! In-process event store. Holds everything in a vector; used by tests and
//! by local runs without Postgres.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{EventStore, PathViews, SiteStats, StatsQuery, StoreError, TOP_PATHS_LIMIT};
use crate::model::Event;

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored row, in insert order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, event: &Event) -> Result<(), StoreError> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn site_stats(&self, query: &StatsQuery) -> Result<SiteStats, StoreError> {
        let events = self.events.lock();
        let matching = events.iter().filter(|e| {
            e.site_id == query.site_id
                && query
                    .date
                    .is_none_or(|date| e.timestamp.date_naive() == date)
        });

        let mut total_views = 0i64;
        let mut users = HashSet::new();
        let mut per_path: HashMap<&str, i64> = HashMap::new();
        for event in matching {
            total_views += 1;
            if let Some(user) = event.user_id.as_deref() {
                users.insert(user);
            }
            *per_path.entry(event.path.as_str()).or_default() += 1;
        }

        let mut top_paths: Vec<PathViews> = per_path
            .into_iter()
            .map(|(path, views)| PathViews {
                path: path.to_string(),
                views,
            })
            .collect();
        top_paths.sort_by(|a, b| b.views.cmp(&a.views).then_with(|| a.path.cmp(&b.path)));
        top_paths.truncate(TOP_PATHS_LIMIT);

        Ok(SiteStats {
            site_id: query.site_id.clone(),
            date: query.date,
            total_views,
            unique_users: users.len() as i64,
            top_paths,
        })
    }
}
