//! Metric instrument factories for taskq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"taskq"` meter; without a
//! registered provider they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for taskq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("taskq")
}

/// Counter: queue and schedule operations (write, read, read_empty, remove,
/// flush, schedule_add, schedule_read).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: result store operations (put, peek, get, miss, flush).
/// Labels: `operation`.
pub fn result_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskq.result.operations")
        .with_description("Number of result store operations")
        .build()
}

/// Counter: event bus operations (emit, read, read_timeout).
/// Labels: `channel`, `operation`.
pub fn event_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskq.event.operations")
        .with_description("Number of event bus operations")
        .build()
}

/// Counter: event records purged by cap enforcement.
/// Labels: `channel`.
pub fn events_trimmed() -> Counter<u64> {
    meter()
        .u64_counter("taskq.event.trimmed")
        .with_description("Event records purged when a channel exceeded its cap")
        .build()
}

/// Counter: lifecycle events that could not be published.
/// Labels: `channel`, `status`.
pub fn lifecycle_failures() -> Counter<u64> {
    meter()
        .u64_counter("taskq.lifecycle.failures")
        .with_description("Lifecycle events dropped because the emit failed")
        .build()
}

/// Histogram: time a long-poll spent waiting before it returned.
/// Labels: `channel`.
pub fn poll_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskq.poll.wait_ms")
        .with_description("Long-poll wait in milliseconds")
        .with_unit("ms")
        .build()
}
