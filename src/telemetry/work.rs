//! Work item span helpers.
//!
//! Provides span creation and outcome recording for items flowing through a
//! work queue processor.

use tracing::Span;
use uuid::Uuid;

/// Start a span for one processing attempt.
///
/// The `work.outcome` field is declared empty and can be filled via
/// [`record_outcome`].
pub fn start_item_span(queue: &str, item_id: &Uuid) -> Span {
    tracing::info_span!(
        "work.process",
        "work.queue" = queue,
        "work.id" = %item_id,
        "work.outcome" = tracing::field::Empty,
    )
}

/// Record the attempt outcome on the span and emit a scoped event.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("work.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome = outcome, "attempt finished");
    });
}
