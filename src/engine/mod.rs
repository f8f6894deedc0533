//! Delivery engine: worker pool and lease-expiry sweeper.

pub mod pool;
pub mod sweeper;

pub use pool::{Delivery, WorkerConfig, WorkerPool};
