//! Core data model.
//!
//! An [`Event`] is a validated analytics hit. The queue wraps each event in a
//! [`WorkItem`] that tracks delivery state until the event has been persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A validated analytics event. Immutable once constructed.
///
/// Events carry no identity beyond their content, so two identical hits are
/// two rows once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub site_id: String,
    pub event_type: String,
    pub path: String,
    /// `None` when the client sent no user, `null`, or an empty string.
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An event exactly as the client sent it, before validation.
///
/// Every field is optional here; [`crate::validate::validate`] decides what
/// is acceptable. Keys outside these five are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEvent {
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// Queue-assigned identifier. Strictly increasing in enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub i64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(ItemId)
    }
}

/// An event in the queue, plus delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub payload: Event,

    /// Number of times this item has been leased. Incremented by the queue
    /// on every lease, never decremented.
    pub attempt_count: u32,

    /// `attempt_count` when an operator last requeued the item. Attempts
    /// counted against the retry limit are `attempt_count - retry_base`.
    pub retry_base: u32,

    pub state: State,

    /// Worker currently holding the lease, if Leased.
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Earliest instant a Pending item may be leased again.
    pub available_at: DateTime<Utc>,

    /// Most recent failure reason, kept after the item leaves Leased.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting for a worker.
    Pending,
    /// Held by a worker until acknowledged, failed, or expired.
    Leased,
    /// Persisted. Eligible for removal.
    Done,
    /// Retries exhausted or failure was permanent. Needs an operator.
    Failed,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Pending, Leased)
                | (Leased, Done)
                | (Leased, Pending)  // retry or lease expiry
                | (Leased, Failed)
                | (Failed, Pending) // operator retry
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Leased => "leased",
            State::Done => "done",
            State::Failed => "failed",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(State::Pending),
            "leased" => Ok(State::Leased),
            "done" => Ok(State::Done),
            "failed" => Ok(State::Failed),
            _ => Err(Error::Other(format!("unknown state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A worker's time-bounded claim on a work item.
///
/// The token fences every later mutation: acknowledge, fail, and extend only
/// apply while the item is still leased under this token.
#[derive(Debug, Clone)]
pub struct Lease {
    pub token: Uuid,
    pub item: WorkItem,
}

impl Lease {
    pub fn id(&self) -> ItemId {
        self.item.id
    }

    pub fn event(&self) -> &Event {
        &self.item.payload
    }

    pub fn attempt(&self) -> u32 {
        self.item.attempt_count
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.item.lease_expires_at
    }
}

// ---------------------------------------------------------------------------
// Failure reason
// ---------------------------------------------------------------------------

/// Why a leased item did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Storage failed in a way that may succeed later.
    StorageError(String),
    /// Storage rejected the event; retrying cannot help.
    Permanent(String),
    /// The lease ran out before an acknowledge arrived.
    LeaseExpired,
}

impl FailureReason {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::Permanent(_))
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::StorageError(msg) => write!(f, "storage error: {msg}"),
            FailureReason::Permanent(msg) => write!(f, "permanent storage error: {msg}"),
            FailureReason::LeaseExpired => f.write_str("lease expired"),
        }
    }
}

// ---------------------------------------------------------------------------
// Counts
// ---------------------------------------------------------------------------

/// Number of work items in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub leased: u64,
    pub done: u64,
    pub failed: u64,
}
