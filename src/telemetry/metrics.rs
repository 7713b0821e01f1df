//! Metric instrument factories for routeslip.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"routeslip"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for routeslip instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("routeslip")
}

/// Counter: channel operations (publish, receive, accept, reject, ...).
/// Labels: `address`, `operation`.
pub fn channel_operations() -> Counter<u64> {
    meter()
        .u64_counter("routeslip.channel.operations")
        .with_description("Number of channel operations")
        .build()
}

/// Counter: pgmq storage operations (create, send, read, archive, ...).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("routeslip.queue.operations")
        .with_description("Number of pgmq queue operations")
        .build()
}

/// Counter: executor hops by outcome.
/// Labels: `address`, `outcome` ("forwarded" | "completed" | "terminal" | "dead_lettered").
pub fn hops() -> Counter<u64> {
    meter()
        .u64_counter("routeslip.hops")
        .with_description("Number of routing-slip hops processed")
        .build()
}

/// Counter: messages rejected into a dead-letter queue.
/// Labels: `address`, `reason` ("poison").
pub fn dead_lettered() -> Counter<u64> {
    meter()
        .u64_counter("routeslip.dead_lettered")
        .with_description("Messages quarantined on the dead-letter path")
        .build()
}

/// Counter: publishes that matched no binding and were dropped.
/// Labels: `address`.
pub fn unroutable() -> Counter<u64> {
    meter()
        .u64_counter("routeslip.unroutable")
        .with_description("Messages published to an address with no bound queue")
        .build()
}

/// Histogram: hop duration in milliseconds.
/// Labels: `address`.
pub fn hop_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("routeslip.hop.duration_ms")
        .with_description("Routing-slip hop duration in milliseconds")
        .with_unit("ms")
        .build()
}
