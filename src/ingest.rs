//! Ingestion service: validate, enqueue, tell the caller what happened.
//!
//! Callers see one of three outcomes: accepted, rejected (their input is
//! wrong, do not resend as is), or unavailable (resend later). Nothing
//! about leases or retries leaks out.

use opentelemetry::KeyValue;
use tracing::{debug, error};

use crate::error::Error;
use crate::model::{ItemId, RawEvent};
use crate::queue::DurableQueue;
use crate::telemetry::metrics;
use crate::validate::{ValidationError, validate};

/// Why an event was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Rejected(#[from] ValidationError),

    /// The queue could not take the event. The caller should retry.
    #[error("event queue unavailable")]
    Unavailable(#[source] Error),
}

#[derive(Clone)]
pub struct IngestService {
    queue: DurableQueue,
}

impl IngestService {
    pub fn new(queue: DurableQueue) -> Self {
        Self { queue }
    }

    /// Validate `raw` and enqueue it. Returns the queue id on acceptance.
    pub async fn ingest(&self, raw: RawEvent) -> Result<ItemId, IngestError> {
        let event = match validate(raw) {
            Ok(event) => event,
            Err(e) => {
                record("rejected");
                debug!(field = e.field(), "event rejected: {e}");
                return Err(e.into());
            }
        };

        let site_id = event.site_id.clone();
        match self.queue.enqueue_async(event).await {
            Ok(id) => {
                record("accepted");
                Ok(id)
            }
            Err(e) => {
                record("unavailable");
                error!(site_id = %site_id, "enqueue failed: {e}");
                Err(IngestError::Unavailable(e))
            }
        }
    }
}

fn record(result: &'static str) {
    metrics::events_ingested().add(1, &[KeyValue::new("result", result)]);
}
