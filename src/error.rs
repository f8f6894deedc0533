//! Error types for tally.

use thiserror::Error;

use crate::model::{ItemId, State};
use crate::store::StoreError;
use crate::validate::ValidationError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(ItemId),

    #[error("invalid state transition for {id}: {from} -> {to}")]
    InvalidTransition { id: ItemId, from: State, to: State },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The queue's backing store could not be read or written.
    /// Producers surface this to their callers as retryable.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(#[from] rusqlite::Error),

    /// The caller's lease is no longer current (expired and swept, or
    /// reassigned). The mutation was not applied.
    #[error("lease on work item {id} is no longer held")]
    LeaseExpired { id: ItemId },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
