//! Consumer tasks draining a queue's delivery buffer.
//!
//! Single consumers take one delivery at a time. Batch consumers run a
//! small timer protocol:
//!
//! - idle: batch empty, timer disarmed. The first delivery arms the timer.
//! - armed: 1..size-1 deliveries buffered. More deliveries do not reset it.
//! - reaching `size` flushes immediately and disarms the timer.
//! - the timer firing flushes whatever has accumulated and disarms it.
//!
//! The timer branch is guarded by the armed flag, so a timer that expired
//! while a size flush was running can never fire into the next batch, and
//! a flush never sees an empty batch.

use crate::consumer::{BatchConsumer, Consumer};
use crate::delivery::Delivery;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::BatchOptions;

/// The delivery buffer, shared by every consumer of a queue.
pub(super) type SharedReceiver = Arc<Mutex<mpsc::Receiver<Delivery>>>;

/// What a batch consumer does with a partial batch when the buffer closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartialBatch {
    /// Exit without invoking the consumer. The deliveries stay in the
    /// unacked list until they are returned.
    #[default]
    Drop,
    /// Invoke the consumer once more with the partial batch.
    Flush,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Size,
    Timeout,
    Close,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Size => "size",
            Trigger::Timeout => "timeout",
            Trigger::Close => "close",
        }
    }
}

async fn next_delivery(deliveries: &SharedReceiver) -> Option<Delivery> {
    deliveries.lock().await.recv().await
}

pub(super) async fn consume_each<C: Consumer>(deliveries: SharedReceiver, consumer: C) {
    while let Some(delivery) = next_delivery(&deliveries).await {
        consumer.consume(delivery).await;
    }
    debug!("delivery buffer closed, consumer exiting");
}

pub(super) async fn consume_batches<C: BatchConsumer>(
    queue: String,
    deliveries: SharedReceiver,
    options: BatchOptions,
    consumer: C,
) {
    let mut batch: Vec<Delivery> = Vec::with_capacity(options.size);
    let timer = tokio::time::sleep(options.timeout);
    tokio::pin!(timer);
    let mut armed = false;

    loop {
        tokio::select! {
            () = &mut timer, if armed => {
                armed = false;
                flush(&queue, &consumer, &mut batch, options.size, Trigger::Timeout).await;
            }
            delivery = next_delivery(&deliveries) => {
                let Some(delivery) = delivery else {
                    close(&queue, &consumer, &mut batch, options).await;
                    return;
                };

                batch.push(delivery);
                if batch.len() == 1 {
                    timer.as_mut().reset(Instant::now() + options.timeout);
                    armed = true;
                }
                if batch.len() >= options.size {
                    armed = false;
                    flush(&queue, &consumer, &mut batch, options.size, Trigger::Size).await;
                }
            }
        }
    }
}

async fn close<C: BatchConsumer>(
    queue: &str,
    consumer: &C,
    batch: &mut Vec<Delivery>,
    options: BatchOptions,
) {
    if batch.is_empty() {
        debug!("delivery buffer closed, batch consumer exiting");
        return;
    }
    match options.on_close {
        PartialBatch::Flush => {
            flush(queue, consumer, batch, options.size, Trigger::Close).await;
        }
        PartialBatch::Drop => {
            warn!(
                queue,
                dropped = batch.len(),
                "delivery buffer closed with a partial batch, leaving it unacked"
            );
        }
    }
}

async fn flush<C: BatchConsumer>(
    queue: &str,
    consumer: &C,
    batch: &mut Vec<Delivery>,
    size: usize,
    trigger: Trigger,
) {
    if batch.is_empty() {
        return;
    }
    let deliveries = std::mem::replace(batch, Vec::with_capacity(size));
    debug!(queue, size = deliveries.len(), trigger = trigger.as_str(), "flushing batch");
    metrics::batch_flushes().add(
        1,
        &[
            metrics::queue_label(queue),
            KeyValue::new("trigger", trigger.as_str()),
        ],
    );
    consumer.consume(deliveries).await;
}
