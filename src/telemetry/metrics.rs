//! Metric instrument factories for workq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workq"` meter. Without a
//! registered provider they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for workq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: items offered to a work queue.
/// Labels: `queue`, `result` ("queued" | "queue_full" | "closed" | "error").
pub fn items_submitted() -> Counter<u64> {
    meter()
        .u64_counter("workq.items.submitted")
        .with_description("Number of items submitted to a work queue")
        .build()
}

/// Counter: processing attempts by outcome.
/// Labels: `queue`, `result` ("success" | "retry" | "failed" | "discarded").
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("workq.items.processed")
        .with_description("Number of item processing attempts")
        .build()
}

/// Counter: mutating deque operations.
/// Labels: `partition`, `operation`.
pub fn deque_operations() -> Counter<u64> {
    meter()
        .u64_counter("workq.deque.operations")
        .with_description("Number of persistent deque mutations")
        .build()
}

/// Histogram: time spent inside the item processor, in milliseconds.
/// Labels: `queue`.
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.item.processing_duration_ms")
        .with_description("Item processor duration in milliseconds")
        .with_unit("ms")
        .build()
}
