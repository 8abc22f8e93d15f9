//! Metric instrument factories for rmq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider the instruments are no-ops.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("rmq")
}

/// Counter: payloads written by producers.
/// Labels: `queue`, `kind` ("ready" | "delayed" | "rejected").
pub fn published() -> Counter<u64> {
    meter()
        .u64_counter("rmq.queue.published")
        .with_description("Payloads published to a queue")
        .build()
}

/// Counter: payloads moved from ready into an unacked list.
/// Labels: `queue`.
pub fn consumed() -> Counter<u64> {
    meter()
        .u64_counter("rmq.queue.consumed")
        .with_description("Payloads moved from ready to unacked")
        .build()
}

/// Counter: deliveries leaving the unacked state.
/// Labels: `queue`, `to` ("acked" | "rejected" | "pushed" | "delayed").
pub fn delivery_transitions() -> Counter<u64> {
    meter()
        .u64_counter("rmq.delivery.transitions")
        .with_description("Deliveries leaving the unacked list")
        .build()
}

/// Counter: delayed payloads migrated into ready.
/// Labels: `queue`.
pub fn migrated() -> Counter<u64> {
    meter()
        .u64_counter("rmq.queue.migrated")
        .with_description("Due delayed payloads moved to ready")
        .build()
}

/// Counter: entries removed by purges.
/// Labels: `queue`, `list`.
pub fn purged() -> Counter<u64> {
    meter()
        .u64_counter("rmq.queue.purged")
        .with_description("Entries removed by purge operations")
        .build()
}

/// Counter: batch consumer invocations.
/// Labels: `queue`, `trigger` ("size" | "timeout" | "close").
pub fn batch_flushes() -> Counter<u64> {
    meter()
        .u64_counter("rmq.batch.flushes")
        .with_description("Batch consumer invocations")
        .build()
}

/// Counter: store failures observed by the engine.
/// Labels: `operation`.
pub fn store_errors() -> Counter<u64> {
    meter()
        .u64_counter("rmq.store.errors")
        .with_description("Store failures observed by the queue engine")
        .build()
}

/// Shorthand for the `queue` label every queue instrument carries.
pub(crate) fn queue_label(queue: &str) -> KeyValue {
    KeyValue::new("queue", queue.to_string())
}
