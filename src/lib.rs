//! # tally
//!
//! Durable analytics event pipeline.
//!
//! Events are validated at the HTTP edge, appended to a SQLite-backed
//! durable queue, and drained by a pool of workers into Postgres. Leases
//! with expiry make delivery at-least-once across worker crashes; bounded
//! retries park poison events in a Failed state for an operator.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod http;
pub mod ingest;
pub mod model;
pub mod queue;
pub mod reporting;
pub mod store;
pub mod telemetry;
pub mod validate;
