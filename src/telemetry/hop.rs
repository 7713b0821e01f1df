//! Hop span helpers.
//!
//! One span per delivery handled by a routing step, carrying the address,
//! the step order being executed, and the eventual outcome.

use crate::channel::Address;
use tracing::Span;

/// Start a span for one routing-step hop.
///
/// `slip.step` and `hop.outcome` are declared empty and filled in via
/// [`record_step`] and [`record_outcome`].
pub fn start_hop_span(address: &Address, delivery_tag: u64, redelivered: bool) -> Span {
    tracing::info_span!(
        "slip.hop",
        "messaging.destination.name" = %address,
        "messaging.delivery_tag" = delivery_tag,
        "messaging.redelivered" = redelivered,
        "slip.step" = tracing::field::Empty,
        "hop.outcome" = tracing::field::Empty,
    )
}

/// Record which step order this hop executes.
pub fn record_step(span: &Span, order: u32) {
    span.record("slip.step", order);
}

/// Record how the hop ended and emit an event scoped to the span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("hop.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome = outcome, "hop finished");
    });
}
