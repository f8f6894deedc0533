//! Delivery span helpers.
//!
//! One span per leased work item, from lease to acknowledge or failure.

use tracing::Span;

use crate::model::{ItemId, State};

/// Start a span for delivering one leased work item.
///
/// `delivery.outcome` is declared empty and filled by
/// [`record_state_transition`].
pub fn start_delivery_span(worker_id: &str, item: ItemId, attempt: u32) -> Span {
    tracing::info_span!(
        "delivery",
        "delivery.worker" = worker_id,
        "delivery.item" = item.0,
        "delivery.attempt" = attempt,
        "delivery.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit it as an event.
pub fn record_state_transition(span: &Span, from: State, to: State) {
    span.record("delivery.outcome", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
}
