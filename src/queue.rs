//! Durable work queue on SQLite.
//!
//! Single source of truth for work item state, attempt counts and leases.
//! Every public operation is one transaction behind a shared connection
//! mutex, so transitions are linearizable within the process; `BEGIN
//! IMMEDIATE` keeps them atomic across processes sharing the file.
//!
//! Timestamps are stored as Unix milliseconds so expiry and availability
//! checks are plain integer comparisons.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Event, FailureReason, ItemId, Lease, QueueCounts, State, WorkItem};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Upper bound for the exponential retry backoff.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(300);

const ITEM_COLUMNS: &str = "id, payload, attempt_count, retry_base, state, lease_owner, \
                            lease_expires_at, available_at, last_error, created_at, updated_at";

/// How hard `enqueue` works to make a write survive power loss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// fsync on every commit. An acknowledged enqueue survives a crash.
    #[default]
    Full,
    /// fsync at WAL checkpoints only. Survives process crashes, not power loss.
    Relaxed,
}

/// Queue behaviour knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Attempts allowed before an item is moved to Failed.
    pub retry_limit: u32,
    pub durability: Durability,
    /// Base delay before a retryable failure becomes leasable again.
    /// Doubles per attempt. Zero makes retries immediate.
    pub retry_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            durability: Durability::Full,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// What a lease-expiry sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.requeued + self.failed
    }
}

/// Handle to the durable queue. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct DurableQueue {
    conn: Arc<Mutex<Connection>>,
    config: Arc<QueueConfig>,
}

impl DurableQueue {
    /// Open or create a queue database at the given path.
    pub fn open(path: impl AsRef<Path>, config: QueueConfig) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, config)
    }

    /// Create an in-memory queue (for testing).
    pub fn in_memory(config: QueueConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, config)
    }

    fn init(conn: Connection, config: QueueConfig) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let synchronous = match config.durability {
            Durability::Full => "PRAGMA synchronous=FULL;",
            Durability::Relaxed => "PRAGMA synchronous=NORMAL;",
        };
        conn.execute_batch(synchronous)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS work_items (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                payload           TEXT NOT NULL,
                attempt_count     INTEGER NOT NULL DEFAULT 0,
                retry_base        INTEGER NOT NULL DEFAULT 0,
                state             TEXT NOT NULL DEFAULT 'pending',
                lease_owner       TEXT,
                lease_token       TEXT,
                lease_expires_at  INTEGER,
                available_at      INTEGER NOT NULL,
                last_error        TEXT,
                created_at        INTEGER NOT NULL,
                updated_at        INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pending ON work_items(available_at, id)
                WHERE state = 'pending';
            CREATE INDEX IF NOT EXISTS idx_leased ON work_items(lease_expires_at)
                WHERE state = 'leased';
            CREATE INDEX IF NOT EXISTS idx_state ON work_items(state, updated_at);
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Run `f` inside an immediate write transaction.
    ///
    /// Commits if the closure returns Ok, rolls back on Err.
    fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Append a Pending work item for `event`. Durable when this returns.
    pub fn enqueue(&self, event: &Event) -> Result<ItemId> {
        let payload = serde_json::to_string(event)?;
        let now = Utc::now().timestamp_millis();

        let id = self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO work_items (payload, attempt_count, state, available_at, created_at, updated_at)
                 VALUES (?1, 0, 'pending', ?2, ?2, ?2)",
                params![payload, now],
            )?;
            Ok(ItemId(tx.last_insert_rowid()))
        });

        record_operation("enqueue", id.is_ok());
        let id = id?;
        debug!(id = %id, site_id = %event.site_id, "enqueued");
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Consumer side
    // -----------------------------------------------------------------------

    /// Lease the oldest available Pending item for `lease_duration`.
    ///
    /// Returns `None` when nothing is Pending. Callers should back off
    /// before asking again.
    pub fn lease(&self, worker_id: &str, lease_duration: Duration) -> Result<Option<Lease>> {
        let ttl = to_delta(lease_duration)?;

        let lease = self.with_transaction(|tx| {
            let now = Utc::now();
            let candidate: Option<i64> = tx
                .query_row(
                    "SELECT id FROM work_items
                     WHERE state = 'pending' AND available_at <= ?1
                     ORDER BY id ASC LIMIT 1",
                    params![now.timestamp_millis()],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = candidate else {
                return Ok(None);
            };

            let token = Uuid::new_v4();
            let expires_at = add_delta(now, ttl)?;
            tx.execute(
                "UPDATE work_items
                 SET state = 'leased', attempt_count = attempt_count + 1,
                     lease_owner = ?1, lease_token = ?2, lease_expires_at = ?3, updated_at = ?4
                 WHERE id = ?5 AND state = 'pending'",
                params![
                    worker_id,
                    token.to_string(),
                    expires_at.timestamp_millis(),
                    now.timestamp_millis(),
                    id
                ],
            )?;

            let item = get_item_on(tx, ItemId(id))?;
            Ok(Some(Lease { token, item }))
        });

        match &lease {
            Ok(Some(l)) => {
                record_operation("lease", true);
                record_transition(State::Pending, State::Leased);
                debug!(id = %l.id(), worker_id, attempt = l.attempt(), "leased");
            }
            Ok(None) => record_operation("lease_empty", true),
            Err(_) => record_operation("lease", false),
        }
        lease
    }

    /// Mark a leased item Done.
    ///
    /// Fails with [`Error::LeaseExpired`] and changes nothing if the lease is
    /// no longer current; the caller lost the race to the sweeper.
    pub fn acknowledge(&self, lease: &Lease) -> Result<()> {
        let id = lease.id();
        let changed = self.with_transaction(|tx| {
            let now = Utc::now().timestamp_millis();
            Ok(tx.execute(
                "UPDATE work_items
                 SET state = 'done', lease_owner = NULL, lease_token = NULL,
                     lease_expires_at = NULL, updated_at = ?1
                 WHERE id = ?2 AND state = 'leased' AND lease_token = ?3",
                params![now, id.0, lease.token.to_string()],
            )?)
        })?;

        if changed == 0 {
            record_operation("acknowledge_lost", true);
            return Err(Error::LeaseExpired { id });
        }
        record_operation("acknowledge", true);
        record_transition(State::Leased, State::Done);
        Ok(())
    }

    /// Report that a leased item could not be completed.
    ///
    /// The item returns to Pending while it has attempts left and the reason
    /// is retryable, otherwise it moves to Failed. Returns the new state.
    pub fn report_failure(&self, lease: &Lease, reason: &FailureReason) -> Result<State> {
        let id = lease.id();
        let config = Arc::clone(&self.config);
        let token = lease.token.to_string();

        let outcome = self.with_transaction(|tx| {
            let budget: Option<AttemptBudget> = tx
                .query_row(
                    "SELECT attempt_count, retry_base FROM work_items
                     WHERE id = ?1 AND state = 'leased' AND lease_token = ?2",
                    params![id.0, token],
                    AttemptBudget::from_row,
                )
                .optional()?;
            match budget {
                Some(budget) => fail_on(tx, &config, id, budget, reason, Utc::now()).map(Some),
                None => Ok(None),
            }
        })?;

        let Some(state) = outcome else {
            record_operation("fail_lost", true);
            return Err(Error::LeaseExpired { id });
        };
        record_operation("fail", true);
        record_transition(State::Leased, state);
        if state == State::Failed {
            warn!(id = %id, reason = %reason, "work item failed; operator intervention required");
        }
        Ok(state)
    }

    /// Push a held lease's expiry to `by` from now.
    pub fn extend_lease(&self, lease: &mut Lease, by: Duration) -> Result<()> {
        let id = lease.id();
        let expires_at = add_delta(Utc::now(), to_delta(by)?)?;
        let changed = self.with_transaction(|tx| {
            Ok(tx.execute(
                "UPDATE work_items SET lease_expires_at = ?1, updated_at = ?2
                 WHERE id = ?3 AND state = 'leased' AND lease_token = ?4",
                params![
                    expires_at.timestamp_millis(),
                    Utc::now().timestamp_millis(),
                    id.0,
                    lease.token.to_string()
                ],
            )?)
        })?;

        if changed == 0 {
            return Err(Error::LeaseExpired { id });
        }
        lease.item.lease_expires_at = Some(expires_at);
        record_operation("extend", true);
        Ok(())
    }

    /// Reclaim every lease that has expired as of now.
    pub fn sweep_expired_leases(&self) -> Result<SweepReport> {
        self.sweep_expired_leases_at(Utc::now())
    }

    /// Reclaim every lease whose expiry is at or before `now`.
    pub fn sweep_expired_leases_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let config = Arc::clone(&self.config);
        let report = self.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, attempt_count, retry_base FROM work_items
                 WHERE state = 'leased' AND lease_expires_at <= ?1
                 ORDER BY id ASC",
            )?;
            let expired = stmt
                .query_map(params![now.timestamp_millis()], |row| {
                    Ok((row.get::<_, i64>(0)?, AttemptBudget::from_row_at(row, 1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);

            let mut report = SweepReport::default();
            for (id, budget) in expired {
                match fail_on(tx, &config, ItemId(id), budget, &FailureReason::LeaseExpired, now)? {
                    State::Failed => report.failed += 1,
                    _ => report.requeued += 1,
                }
            }
            Ok(report)
        })?;

        if report.total() > 0 {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                "reclaimed expired leases"
            );
            let swept = metrics::leases_swept();
            swept.add(report.requeued as u64, &[KeyValue::new("outcome", "requeued")]);
            swept.add(report.failed as u64, &[KeyValue::new("outcome", "failed")]);
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Operator side
    // -----------------------------------------------------------------------

    /// Get a work item by ID.
    pub fn get(&self, id: ItemId) -> Result<WorkItem> {
        let conn = self.conn.lock();
        get_item_on(&conn, id)
    }

    /// List work items in `state`, oldest first.
    pub fn list(&self, state: State, limit: usize) -> Result<Vec<WorkItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM work_items WHERE state = ?1 ORDER BY id ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![state.as_str(), limit as i64], row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// Number of items in each state.
    pub fn counts(&self) -> Result<QueueCounts> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM work_items GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut counts = QueueCounts::default();
        for (state, n) in rows {
            let n = n as u64;
            match state.parse::<State>()? {
                State::Pending => counts.pending = n,
                State::Leased => counts.leased = n,
                State::Done => counts.done = n,
                State::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    /// Put a Failed item back in the queue with a fresh attempt budget.
    ///
    /// `attempt_count` keeps counting; the budget restarts from its current
    /// value.
    pub fn retry_failed(&self, id: ItemId) -> Result<WorkItem> {
        let item = self.with_transaction(|tx| {
            let current = get_item_on(tx, id)?;
            if current.state != State::Failed {
                return Err(Error::InvalidTransition {
                    id,
                    from: current.state,
                    to: State::Pending,
                });
            }
            let now = Utc::now().timestamp_millis();
            tx.execute(
                "UPDATE work_items
                 SET state = 'pending', retry_base = attempt_count,
                     available_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND state = 'failed'",
                params![now, id.0],
            )?;
            get_item_on(tx, id)
        })?;

        record_transition(State::Failed, State::Pending);
        info!(id = %id, "failed work item requeued by operator");
        Ok(item)
    }

    /// Delete Done items last updated at or before `older_than`.
    pub fn purge_done(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let removed = self.with_transaction(|tx| {
            Ok(tx.execute(
                "DELETE FROM work_items WHERE state = 'done' AND updated_at <= ?1",
                params![older_than.timestamp_millis()],
            )?)
        })?;
        if removed > 0 {
            debug!(removed, "purged done work items");
        }
        record_operation("purge", true);
        Ok(removed)
    }

    /// Check the backing store answers queries.
    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Async wrappers: run on the blocking pool so an fsync or a busy database
// never stalls a runtime thread.
// ---------------------------------------------------------------------------

impl DurableQueue {
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&DurableQueue) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || f(&queue))
            .await
            .map_err(|e| Error::Other(format!("queue task failed: {e}")))?
    }

    /// [`enqueue`](Self::enqueue) on the blocking pool.
    pub async fn enqueue_async(&self, event: Event) -> Result<ItemId> {
        self.blocking(move |q| q.enqueue(&event)).await
    }

    /// [`lease`](Self::lease) on the blocking pool.
    pub async fn lease_async(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<Lease>> {
        let worker_id = worker_id.to_string();
        self.blocking(move |q| q.lease(&worker_id, lease_duration))
            .await
    }

    /// [`acknowledge`](Self::acknowledge) on the blocking pool.
    pub async fn acknowledge_async(&self, lease: &Lease) -> Result<()> {
        let lease = lease.clone();
        self.blocking(move |q| q.acknowledge(&lease)).await
    }

    /// [`report_failure`](Self::report_failure) on the blocking pool.
    pub async fn report_failure_async(&self, lease: &Lease, reason: FailureReason) -> Result<State> {
        let lease = lease.clone();
        self.blocking(move |q| q.report_failure(&lease, &reason))
            .await
    }

    /// [`sweep_expired_leases`](Self::sweep_expired_leases) on the blocking pool.
    pub async fn sweep_expired_leases_async(&self) -> Result<SweepReport> {
        self.blocking(|q| q.sweep_expired_leases()).await
    }

    /// [`purge_done`](Self::purge_done) on the blocking pool.
    pub async fn purge_done_async(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.blocking(move |q| q.purge_done(older_than)).await
    }

    /// [`counts`](Self::counts) on the blocking pool.
    pub async fn counts_async(&self) -> Result<QueueCounts> {
        self.blocking(|q| q.counts()).await
    }

    /// [`health_check`](Self::health_check) on the blocking pool.
    pub async fn health_check_async(&self) -> Result<()> {
        self.blocking(|q| q.health_check()).await
    }
}

// ---------------------------------------------------------------------------
// Inner functions: accept &Connection so they work with both
// Connection and Transaction (deref to Connection).
// ---------------------------------------------------------------------------

/// Apply the failure transition to a leased item that has spent `budget`.
fn fail_on(
    conn: &Connection,
    config: &QueueConfig,
    id: ItemId,
    budget: AttemptBudget,
    reason: &FailureReason,
    now: DateTime<Utc>,
) -> Result<State> {
    let next = if reason.is_retryable() && budget.used() < config.retry_limit {
        State::Pending
    } else {
        State::Failed
    };

    let delay = match reason {
        FailureReason::StorageError(_) if next == State::Pending => {
            retry_delay(config.retry_backoff, budget.used())
        }
        _ => Duration::ZERO,
    };
    let available_at = add_delta(now, to_delta(delay)?)?;

    conn.execute(
        "UPDATE work_items
         SET state = ?1, lease_owner = NULL, lease_token = NULL, lease_expires_at = NULL,
             available_at = ?2, last_error = ?3, updated_at = ?4
         WHERE id = ?5",
        params![
            next.as_str(),
            available_at.timestamp_millis(),
            reason.to_string(),
            now.timestamp_millis(),
            id.0
        ],
    )?;
    Ok(next)
}

/// Attempts made against the current retry budget.
#[derive(Debug, Clone, Copy)]
struct AttemptBudget {
    attempt_count: u32,
    retry_base: u32,
}

impl AttemptBudget {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Self::from_row_at(row, 0)
    }

    fn from_row_at(row: &rusqlite::Row, first: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            attempt_count: row.get(first)?,
            retry_base: row.get(first + 1)?,
        })
    }

    fn used(self) -> u32 {
        self.attempt_count.saturating_sub(self.retry_base)
    }
}

/// `base * 2^(attempts-1)`, capped.
fn retry_delay(base: Duration, attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1 << exp).min(MAX_RETRY_BACKOFF)
}

fn get_item_on(conn: &Connection, id: ItemId) -> Result<WorkItem> {
    conn.query_row(
        &format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = ?1"),
        params![id.0],
        row_to_item,
    )
    .optional()?
    .ok_or(Error::NotFound(id))?
}

/// Raw column values of a `work_items` row.
struct ItemRow {
    id: i64,
    payload: String,
    attempt_count: u32,
    retry_base: u32,
    state: String,
    lease_owner: Option<String>,
    lease_expires_at: Option<i64>,
    available_at: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

/// Row → item. The outer Result carries SQLite errors, the inner one
/// payload and timestamp decoding errors.
fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<Result<WorkItem>> {
    let raw = ItemRow {
        id: row.get(0)?,
        payload: row.get(1)?,
        attempt_count: row.get(2)?,
        retry_base: row.get(3)?,
        state: row.get(4)?,
        lease_owner: row.get(5)?,
        lease_expires_at: row.get(6)?,
        available_at: row.get(7)?,
        last_error: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    };
    Ok(raw.try_into_item())
}

impl ItemRow {
    fn try_into_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: ItemId(self.id),
            payload: serde_json::from_str(&self.payload)?,
            attempt_count: self.attempt_count,
            retry_base: self.retry_base,
            state: self.state.parse()?,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at.map(from_millis).transpose()?,
            available_at: from_millis(self.available_at)?,
            last_error: self.last_error,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| Error::Other(format!("timestamp out of range: {ms}")))
}

fn to_delta(d: Duration) -> Result<TimeDelta> {
    TimeDelta::from_std(d).map_err(|e| Error::Other(format!("duration out of range: {e}")))
}

fn add_delta(at: DateTime<Utc>, delta: TimeDelta) -> Result<DateTime<Utc>> {
    at.checked_add_signed(delta)
        .ok_or_else(|| Error::Other(format!("{at} + {delta} is out of range")))
}

fn record_operation(operation: &'static str, ok: bool) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("result", if ok { "ok" } else { "error" }),
        ],
    );
}

fn record_transition(from: State, to: State) {
    metrics::queue_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}
