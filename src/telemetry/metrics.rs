//! Metric instrument factories for tally.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op, so recording is
//! always safe.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("tally")
}

/// Counter: ingestion attempts.
/// Labels: `result` ("accepted" | "rejected" | "unavailable").
pub fn events_ingested() -> Counter<u64> {
    meter()
        .u64_counter("tally.events.ingested")
        .with_description("Events received at the ingestion boundary")
        .build()
}

/// Counter: queue operations.
/// Labels: `operation`, `result` ("ok" | "error").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("tally.queue.operations")
        .with_description("Number of durable queue operations")
        .build()
}

/// Counter: work item state transitions.
/// Labels: `from`, `to`.
pub fn queue_transitions() -> Counter<u64> {
    meter()
        .u64_counter("tally.queue.transitions")
        .with_description("Number of work item state transitions")
        .build()
}

/// Counter: leases reclaimed by the expiry sweep.
/// Labels: `outcome` ("requeued" | "failed").
pub fn leases_swept() -> Counter<u64> {
    meter()
        .u64_counter("tally.queue.swept")
        .with_description("Expired leases reclaimed by the sweeper")
        .build()
}

/// Histogram: storage insert latency in milliseconds.
/// Labels: `result` ("ok" | "transient" | "permanent" | "timeout").
pub fn storage_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("tally.storage.duration_ms")
        .with_description("Event store insert duration in milliseconds")
        .with_unit("ms")
        .build()
}
