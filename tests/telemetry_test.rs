//! Integration tests for telemetry initialization and span helpers.

use taskq::telemetry::{self, TelemetryConfig};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process; another test
    // may have won the race, which is acceptable here.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "taskq-test".to_string(),
        log_level: "debug".to_string(),
    };
    if let Ok(guard) = telemetry::init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn queue_span_can_be_entered() {
    let span = telemetry::spans::start_queue_span("enqueue", "scans");
    let _entered = span.entered();
}

#[test]
fn poll_span_records_tries() {
    let span = telemetry::spans::start_poll_span("status");
    telemetry::spans::record_poll_tries(&span, 3);
}

#[test]
fn instruments_record_without_a_provider() {
    use opentelemetry::KeyValue;

    telemetry::metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", "scans"),
            KeyValue::new("operation", "write"),
        ],
    );
    telemetry::metrics::poll_wait_ms().record(12.5, &[KeyValue::new("channel", "status")]);
}
