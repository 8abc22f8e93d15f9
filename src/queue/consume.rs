//! The consumption loop: one per consuming queue handle.
//!
//! Each iteration migrates due delayed payloads, then moves at most
//! `min(ready, prefetch_limit - buffered)` payloads from ready into the
//! unacked list one atomic move at a time, handing each to the buffer.
//! The buffer is sized to the prefetch limit and the batch is computed from
//! its free capacity, so sends never wait on a correctly sized buffer.
//! A full buffer yields a batch of zero, which is how slow consumers
//! throttle the loop.

use super::{Consuming, Queue};
use crate::delivery::Delivery;
use crate::error::Result;
use crate::telemetry::metrics;
use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub(super) async fn run(
    queue: Queue,
    consuming: Arc<Consuming>,
    deliveries: mpsc::Sender<Delivery>,
) {
    loop {
        let wants_more = match consume_batch(&queue, &consuming, &deliveries).await {
            Ok(wants_more) => wants_more,
            Err(e) => {
                error!(queue = %queue, error = %e, "consume iteration failed, backing off");
                metrics::store_errors().add(1, &[KeyValue::new("operation", "consume")]);
                false
            }
        };

        if !wants_more && !consuming.is_stopped() {
            tokio::select! {
                _ = tokio::time::sleep(consuming.options.poll_interval) => {}
                _ = consuming.wake.notified() => {}
            }
        }

        if consuming.is_stopped() {
            break;
        }
    }

    // Dropping the sender closes the buffer once consumers drain it.
    drop(deliveries);
    info!(queue = %queue, "stopped consuming");
}

/// Run one iteration. Returns true if a full batch was moved, meaning the
/// loop should go again without sleeping.
async fn consume_batch(
    queue: &Queue,
    consuming: &Consuming,
    deliveries: &mpsc::Sender<Delivery>,
) -> Result<bool> {
    queue.migrate_delayed(Utc::now()).await?;

    let batch_size = batch_size(queue, consuming, deliveries).await?;
    if batch_size == 0 {
        return Ok(false);
    }

    let mut moved = 0;
    let result = move_batch(queue, deliveries, batch_size, &mut moved).await;
    if moved > 0 {
        metrics::consumed().add(moved as u64, &[metrics::queue_label(&queue.name)]);
    }
    result
}

/// Move up to `batch_size` payloads from ready to unacked, buffering a
/// delivery for each. Each move is atomic, the batch is not: a failure
/// part way leaves earlier payloads in unacked and the rest in ready.
async fn move_batch(
    queue: &Queue,
    deliveries: &mpsc::Sender<Delivery>,
    batch_size: usize,
    moved: &mut usize,
) -> Result<bool> {
    let route = queue.delivery_route();
    for _ in 0..batch_size {
        let Some(payload) = queue
            .store
            .rpoplpush(&queue.keys.ready, &queue.keys.unacked)
            .await?
        else {
            return Ok(false);
        };
        *moved += 1;

        let delivery = Delivery::new(payload, Arc::clone(&route), Arc::clone(&queue.store));
        if deliveries.send(delivery).await.is_err() {
            warn!(queue = %queue, "delivery buffer closed, payload left unacked");
            return Ok(false);
        }
    }
    Ok(true)
}

async fn batch_size(
    queue: &Queue,
    consuming: &Consuming,
    deliveries: &mpsc::Sender<Delivery>,
) -> Result<usize> {
    let buffered = deliveries.max_capacity() - deliveries.capacity();
    let free = consuming.options.prefetch_limit.saturating_sub(buffered);
    if free == 0 {
        return Ok(0);
    }
    let ready = queue.store.llen(&queue.keys.ready).await?;
    Ok(ready.min(free))
}
