//! Periodic lease-expiry sweep and Done-item garbage collection.

use chrono::{TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{debug, error};

use super::WorkerConfig;
use crate::queue::DurableQueue;

/// Sweep every `config.sweep_interval` until `shutdown` flips to true.
pub async fn run(queue: DurableQueue, config: WorkerConfig, mut shutdown: watch::Receiver<bool>) {
    debug!(interval = ?config.sweep_interval, "sweeper started");

    while !*shutdown.borrow() {
        sweep_once(&queue, &config).await;
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(config.sweep_interval) => {}
        }
    }

    debug!("sweeper stopped");
}

/// One sweep pass. Errors are logged; the next tick tries again.
pub async fn sweep_once(queue: &DurableQueue, config: &WorkerConfig) {
    if let Err(e) = queue.sweep_expired_leases_async().await {
        error!("lease sweep failed: {e}");
    }

    if let Some(retention) = config.done_retention {
        let cutoff = TimeDelta::from_std(retention)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        if let Some(cutoff) = cutoff {
            if let Err(e) = queue.purge_done_async(cutoff).await {
                error!("purging done items failed: {e}");
            }
        }
    }
}
