//! Integration tests for telemetry initialization and span helpers.

use routeslip::channel::Address;
use routeslip::telemetry::{TelemetryConfig, hop, init_telemetry};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process; a second
    // attempt is an error, not a panic.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "routeslip-test".to_string(),
        log_level: "debug".to_string(),
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn hop_span_records_step_and_outcome() {
    let span = hop::start_hop_span(&Address::new("routing.slip.enricher"), 7, false);
    hop::record_step(&span, 1);
    hop::record_outcome(&span, "forwarded");
}

#[test]
fn metric_instruments_are_usable_without_a_provider() {
    use opentelemetry::KeyValue;
    use routeslip::telemetry::metrics;

    metrics::hops().add(1, &[KeyValue::new("outcome", "completed")]);
    metrics::hop_duration_ms().record(1.5, &[]);
    metrics::dead_lettered().add(1, &[KeyValue::new("reason", "poison")]);
}
