//! Span helpers for queue operations and event long-polls.

use tracing::Span;

/// Start a span for one engine operation against a named queue.
pub fn start_queue_span(operation: &'static str, queue: &str) -> Span {
    tracing::debug_span!("taskq.queue", "queue.operation" = operation, "queue.name" = queue)
}

/// Start a span for a long-poll on an event channel.
///
/// The `poll.tries` field is declared empty and filled by
/// [`record_poll_tries`] once the poll returns.
pub fn start_poll_span(channel: &str) -> Span {
    tracing::info_span!(
        "taskq.poll",
        "event.channel" = channel,
        "poll.tries" = tracing::field::Empty,
    )
}

/// Record how many empty polls preceded the result.
pub fn record_poll_tries(span: &Span, tries: u32) {
    span.record("poll.tries", tries);
}
