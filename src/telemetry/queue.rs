//! Span helpers for the consumption loop and consumer tasks.

use tracing::Span;

/// Span wrapping the background loop that moves ready payloads into
/// a connection's unacked list.
pub fn start_consume_span(queue: &str, connection: &str) -> Span {
    tracing::info_span!(
        "rmq.consume",
        "rmq.queue" = queue,
        "rmq.connection" = connection,
        "rmq.prefetch_limit" = tracing::field::Empty,
    )
}

/// Span wrapping one consumer task. `batch_size` is empty for
/// single-delivery consumers.
pub fn start_consumer_span(queue: &str, consumer: &str) -> Span {
    tracing::info_span!(
        "rmq.consumer",
        "rmq.queue" = queue,
        "rmq.consumer" = consumer,
        "rmq.batch_size" = tracing::field::Empty,
    )
}

/// Record a delivery leaving the unacked state.
pub fn record_delivery_transition(queue: &str, from: &str, to: &str) {
    tracing::debug!(queue, from, to, "delivery transition");
}
