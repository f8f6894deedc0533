//! Worker pool: lease an item, persist it, acknowledge or fail the lease.
//!
//! Workers are crash-only. Nothing here cleans up after a worker that dies
//! mid-delivery; its lease expires and the sweeper hands the item to
//! someone else.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use super::sweeper;
use crate::error::{Error, Result};
use crate::model::{FailureReason, ItemId, State};
use crate::queue::DurableQueue;
use crate::store::{EventStore, StoreError};
use crate::telemetry::delivery::{record_state_transition, start_delivery_span};
use crate::telemetry::metrics;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// How long a worker may hold an item before the sweeper reclaims it.
    pub lease_duration: Duration,
    /// Upper bound on one storage insert. Keep below `lease_duration`.
    pub storage_timeout: Duration,
    pub sweep_interval: Duration,
    /// Idle backoff starts here and doubles up to `poll_max`.
    pub poll_min: Duration,
    pub poll_max: Duration,
    /// Done items older than this are purged by the sweeper.
    pub done_retention: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease_duration: Duration::from_secs(30),
            storage_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            poll_min: Duration::from_millis(50),
            poll_max: Duration::from_secs(2),
            done_retention: Some(Duration::from_secs(3600)),
        }
    }
}

/// What one worker iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing was available to lease.
    Idle,
    /// Persisted and acknowledged.
    Persisted(ItemId),
    /// Storage failed; the item is Pending again.
    Retrying(ItemId),
    /// Storage failed for the last time or permanently; the item is Failed.
    Failed(ItemId),
    /// The lease was reclaimed before this worker could settle it.
    LeaseLost(ItemId),
}

/// A pool of workers sharing one queue and one event store.
#[derive(Clone)]
pub struct WorkerPool {
    queue: DurableQueue,
    store: Arc<dyn EventStore>,
    config: WorkerConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl WorkerPool {
    pub fn new(queue: DurableQueue, store: Arc<dyn EventStore>, config: WorkerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            store,
            config,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Stop leasing new work. In-flight deliveries finish; held leases are
    /// left to expire if a worker never gets to settle them.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run all workers and the sweeper until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        let mut tasks = JoinSet::new();

        for n in 0..self.config.workers {
            let pool = self.clone();
            let worker_id = format!("worker-{n}-{}", uuid::Uuid::new_v4().simple());
            tasks.spawn(async move { pool.worker_loop(worker_id).await });
        }

        let queue = self.queue.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.subscribe();
        tasks.spawn(async move { sweeper::run(queue, config, shutdown).await });

        info!(workers = self.config.workers, "worker pool started");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("worker task panicked: {e}");
            }
        }

        info!("worker pool stopped");
        Ok(())
    }

    /// Poll-with-backoff loop for one worker.
    async fn worker_loop(&self, worker_id: String) {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = self.config.poll_min;
        debug!(worker_id = %worker_id, "worker started");

        while !*shutdown.borrow() {
            let wait = match self.process_next(&worker_id).await {
                Ok(Delivery::Idle) => {
                    let wait = backoff;
                    backoff = (backoff * 2).min(self.config.poll_max);
                    Some(wait)
                }
                Ok(_) => {
                    backoff = self.config.poll_min;
                    None
                }
                Err(e) => {
                    error!(worker_id = %worker_id, "delivery error: {e}");
                    let wait = backoff;
                    backoff = (backoff * 2).min(self.config.poll_max);
                    Some(wait)
                }
            };

            if let Some(wait) = wait {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        debug!(worker_id = %worker_id, "worker stopped");
    }

    /// One iteration: lease, persist, settle.
    ///
    /// Returns [`Delivery::Idle`] without waiting when nothing is Pending.
    pub async fn process_next(&self, worker_id: &str) -> Result<Delivery> {
        let Some(lease) = self
            .queue
            .lease_async(worker_id, self.config.lease_duration)
            .await?
        else {
            return Ok(Delivery::Idle);
        };

        let id = lease.id();
        let span = start_delivery_span(worker_id, id, lease.attempt());

        async {
            let started = Instant::now();
            let (inserted, outcome) =
                match tokio::time::timeout(self.config.storage_timeout, self.store.insert(lease.event()))
                    .await
                {
                    Ok(Ok(())) => (Ok(()), "ok"),
                    Ok(Err(e)) if e.is_transient() => (Err(e), "transient"),
                    Ok(Err(e)) => (Err(e), "permanent"),
                    Err(_) => (
                        Err(StoreError::Transient(format!(
                            "insert timed out after {:?}",
                            self.config.storage_timeout
                        ))),
                        "timeout",
                    ),
                };
            metrics::storage_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("result", outcome)],
            );

            match inserted {
                Ok(()) => match self.queue.acknowledge_async(&lease).await {
                    Ok(()) => {
                        record_state_transition(&span, State::Leased, State::Done);
                        Ok(Delivery::Persisted(id))
                    }
                    Err(Error::LeaseExpired { .. }) => {
                        warn!(id = %id, "lease lost before acknowledge; event may be stored twice");
                        Ok(Delivery::LeaseLost(id))
                    }
                    Err(e) => Err(e),
                },
                Err(err) => {
                    let reason = match err {
                        StoreError::Transient(msg) => FailureReason::StorageError(msg),
                        StoreError::Permanent(msg) => FailureReason::Permanent(msg),
                    };
                    match self.queue.report_failure_async(&lease, reason.clone()).await {
                        Ok(State::Failed) => {
                            record_state_transition(&span, State::Leased, State::Failed);
                            error!(
                                id = %id,
                                attempt = lease.attempt(),
                                site_id = %lease.event().site_id,
                                %reason,
                                "event moved to failed"
                            );
                            Ok(Delivery::Failed(id))
                        }
                        Ok(state) => {
                            record_state_transition(&span, State::Leased, state);
                            warn!(id = %id, attempt = lease.attempt(), %reason, "delivery failed, will retry");
                            Ok(Delivery::Retrying(id))
                        }
                        Err(Error::LeaseExpired { .. }) => {
                            warn!(id = %id, "lease lost before failure could be reported");
                            Ok(Delivery::LeaseLost(id))
                        }
                        Err(e) => Err(e),
                    }
                }
            }
        }
        .instrument(span.clone())
        .await
    }
}
