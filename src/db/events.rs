//! `EventStore` on Postgres: append-only `events` table and the reporting
//! aggregates over it.

use async_trait::async_trait;

use super::Db;
use crate::model::Event;
use crate::store::{EventStore, PathViews, SiteStats, StatsQuery, StoreError, TOP_PATHS_LIMIT};

// `$2::date IS NULL` lets one statement serve both the all-time and the
// per-day query.
const TOTAL_VIEWS_SQL: &str = "SELECT COUNT(*) FROM events
     WHERE site_id = $1 AND ($2::date IS NULL OR (timestamp AT TIME ZONE 'UTC')::date = $2)";

const UNIQUE_USERS_SQL: &str = "SELECT COUNT(DISTINCT user_id) FROM events
     WHERE site_id = $1 AND ($2::date IS NULL OR (timestamp AT TIME ZONE 'UTC')::date = $2)";

const TOP_PATHS_SQL: &str = "SELECT path, COUNT(*) AS views FROM events
     WHERE site_id = $1 AND ($2::date IS NULL OR (timestamp AT TIME ZONE 'UTC')::date = $2)
     GROUP BY path ORDER BY views DESC, path ASC LIMIT $3";

#[async_trait]
impl EventStore for Db {
    async fn insert(&self, event: &Event) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO events (site_id, event_type, path, user_id, timestamp)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&event.site_id)
        .bind(&event.event_type)
        .bind(&event.path)
        .bind(&event.user_id)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn site_stats(&self, query: &StatsQuery) -> Result<SiteStats, StoreError> {
        let total = sqlx::query_as::<_, (i64,)>(TOTAL_VIEWS_SQL)
            .bind(&query.site_id)
            .bind(query.date)
            .fetch_one(&self.pool);
        let unique = sqlx::query_as::<_, (i64,)>(UNIQUE_USERS_SQL)
            .bind(&query.site_id)
            .bind(query.date)
            .fetch_one(&self.pool);
        let paths = sqlx::query_as::<_, (String, i64)>(TOP_PATHS_SQL)
            .bind(&query.site_id)
            .bind(query.date)
            .bind(TOP_PATHS_LIMIT as i64)
            .fetch_all(&self.pool);

        let ((total_views,), (unique_users,), paths) =
            tokio::try_join!(total, unique, paths).map_err(classify)?;

        Ok(SiteStats {
            site_id: query.site_id.clone(),
            date: query.date,
            total_views,
            unique_users,
            top_paths: paths
                .into_iter()
                .map(|(path, views)| PathViews { path, views })
                .collect(),
        })
    }
}

/// Sort a sqlx error into retry-worthy or not.
///
/// SQLSTATE class 22 (data exception) and 23 (integrity constraint
/// violation) describe the row itself, so they are permanent. So are
/// encode/decode failures. Everything else (I/O, TLS, pool timeouts,
/// server shutdown, serialization failures) is transient.
pub fn classify(err: sqlx::Error) -> StoreError {
    let message = err.to_string();
    match &err {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if code.starts_with("22") || code.starts_with("23") => {
                StoreError::Permanent(message)
            }
            _ => StoreError::Transient(message),
        },
        sqlx::Error::Encode(_)
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. } => StoreError::Permanent(message),
        _ => StoreError::Transient(message),
    }
}
