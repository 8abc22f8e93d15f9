//! Queue handle: publish path, consumption control, counts, purge, and
//! recovery operations for one queue as seen from one connection.
//!
//! Each queue owns three shared collections (ready, rejected, delayed) and
//! one per-connection unacked list. Consumption is driven by a single
//! background loop per queue handle (see [`consume`]) feeding a bounded
//! buffer that consumer tasks drain (see [`batch`]).

mod batch;
mod consume;

use crate::consumer::{BatchConsumer, Consumer};
use crate::delivery::DeliveryRoute;
use crate::error::{Error, Result};
use crate::keys::QueueKeys;
use crate::store::{CHUNK_SIZE, Store};
use crate::telemetry::{metrics, queue as spans};
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

pub use self::batch::PartialBatch;

/// Batch timeout used when none is given.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(1);

/// How a queue pulls work once consumption starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum deliveries buffered ahead of the consumers.
    pub prefetch_limit: usize,
    /// Sleep between polls when the last iteration found nothing to move.
    pub poll_interval: Duration,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            prefetch_limit: 10,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Flush policy for a batch consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub size: usize,
    /// Measured from the first delivery of each batch.
    pub timeout: Duration,
    pub on_close: PartialBatch,
}

impl BatchOptions {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            timeout: DEFAULT_BATCH_TIMEOUT,
            on_close: PartialBatch::default(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn on_close(mut self, on_close: PartialBatch) -> Self {
        self.on_close = on_close;
        self
    }
}

/// Another queue's ready list, used as a push target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyList {
    queue: String,
    key: String,
}

impl ReadyList {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// State shared between a queue handle, its consumption loop, and its consumers.
pub(crate) struct Consuming {
    options: ConsumeOptions,
    deliveries: batch::SharedReceiver,
    stopped: AtomicBool,
    wake: Notify,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Held while joining so every waiter returns only after the tasks exit.
    joining: tokio::sync::Mutex<()>,
}

impl Consuming {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A named queue scoped to one connection.
#[derive(Clone)]
pub struct Queue {
    name: String,
    connection: String,
    keys: Arc<QueueKeys>,
    store: Arc<dyn Store>,
    push: Arc<RwLock<Option<ReadyList>>>,
    consuming: Arc<OnceLock<Arc<Consuming>>>,
}

impl Queue {
    pub(crate) fn new(
        name: &str,
        connection: &str,
        keys: QueueKeys,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            name: name.to_string(),
            connection: connection.to_string(),
            keys: Arc::new(keys),
            store,
            push: Arc::new(RwLock::new(None)),
            consuming: Arc::new(OnceLock::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_name(&self) -> &str {
        &self.connection
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    /// Append `payload` to the ready list.
    pub async fn publish(&self, payload: &str) -> Result<()> {
        self.store.lpush(&self.keys.ready, payload).await?;
        debug!(queue = %self, "published");
        self.count_published("ready");
        Ok(())
    }

    /// Publish raw bytes. Payloads travel as strings, so they must be UTF-8.
    pub async fn publish_bytes(&self, payload: &[u8]) -> Result<()> {
        let payload = String::from_utf8(payload.to_vec())?;
        self.publish(&payload).await
    }

    /// Schedule `payload` to become ready at `due` (second precision).
    pub async fn publish_on_delay(&self, payload: &str, due: DateTime<Utc>) -> Result<()> {
        self.store
            .zadd(&self.keys.delayed, due.timestamp(), payload)
            .await?;
        debug!(queue = %self, due = %due, "published delayed");
        self.count_published("delayed");
        Ok(())
    }

    pub async fn publish_bytes_on_delay(&self, payload: &[u8], due: DateTime<Utc>) -> Result<()> {
        let payload = String::from_utf8(payload.to_vec())?;
        self.publish_on_delay(&payload, due).await
    }

    /// Insert `payload` into the rejected list and remove one matching
    /// occurrence from this connection's unacked list, if there is one.
    /// Returns whether an unacked occurrence was removed.
    pub async fn publish_rejected(&self, payload: &str) -> Result<bool> {
        self.store.lpush(&self.keys.rejected, payload).await?;
        self.count_published("rejected");
        let removed = self.store.lrem(&self.keys.unacked, 1, payload).await?;
        Ok(removed > 0)
    }

    fn count_published(&self, kind: &'static str) {
        metrics::published().add(
            1,
            &[metrics::queue_label(&self.name), KeyValue::new("kind", kind)],
        );
    }

    // -----------------------------------------------------------------------
    // Push target
    // -----------------------------------------------------------------------

    /// Handle to this queue's ready list, for wiring it as another queue's
    /// push target.
    pub fn ready_list(&self) -> ReadyList {
        ReadyList {
            queue: self.name.clone(),
            key: self.keys.ready.clone(),
        }
    }

    /// Deliveries consumed after this call are pushed to `target`.
    pub fn set_push_queue(&self, target: &ReadyList) {
        *self.push.write().unwrap_or_else(PoisonError::into_inner) = Some(target.clone());
        info!(queue = %self, target = %target.queue, "push queue set");
    }

    pub fn push_queue(&self) -> Option<ReadyList> {
        self.push
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn delivery_route(&self) -> Arc<DeliveryRoute> {
        Arc::new(DeliveryRoute {
            queue: self.name.clone(),
            unacked: self.keys.unacked.clone(),
            rejected: self.keys.rejected.clone(),
            delayed: self.keys.delayed.clone(),
            push: self.push_queue().map(|target| target.key),
        })
    }

    // -----------------------------------------------------------------------
    // Consumption
    // -----------------------------------------------------------------------

    /// Start the background loop that moves ready payloads into this
    /// connection's unacked list and buffers them for consumers.
    ///
    /// Must be called before consumers are added. Returns `false` if this
    /// handle has already started consuming.
    pub async fn start_consuming(&self, options: ConsumeOptions) -> Result<bool> {
        if self.consuming.get().is_some() {
            return Ok(false);
        }

        let mut options = options;
        if options.prefetch_limit == 0 {
            warn!(queue = %self, "prefetch limit 0 raised to 1");
            options.prefetch_limit = 1;
        }

        self.store
            .sadd(&self.keys.connection_queues, &self.name)
            .await?;

        let (sender, receiver) = mpsc::channel(options.prefetch_limit);
        let consuming = Arc::new(Consuming {
            options,
            deliveries: Arc::new(tokio::sync::Mutex::new(receiver)),
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
            joining: tokio::sync::Mutex::new(()),
        });
        if self.consuming.set(Arc::clone(&consuming)).is_err() {
            return Ok(false);
        }

        let span = spans::start_consume_span(&self.name, &self.connection);
        span.record("rmq.prefetch_limit", options.prefetch_limit);
        let handle = tokio::spawn(
            consume::run(self.clone(), Arc::clone(&consuming), sender).instrument(span),
        );
        consuming.track(handle);

        info!(
            queue = %self,
            prefetch_limit = options.prefetch_limit,
            poll_interval_ms = options.poll_interval.as_millis() as u64,
            "started consuming"
        );
        Ok(true)
    }

    /// Ask the consumption loop to stop after its current iteration.
    ///
    /// Once the loop exits it closes the buffer; consumers finish what is
    /// already buffered and then exit. Returns `false` if this handle is
    /// not consuming or was already stopped.
    pub fn stop_consuming(&self) -> bool {
        let Some(consuming) = self.consuming.get() else {
            return false;
        };
        if consuming.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        consuming.wake.notify_one();
        info!(queue = %self, "stopping consumption");
        true
    }

    /// Wait for the consumption loop and every consumer task to exit.
    ///
    /// Returns immediately if this handle never started consuming. Call
    /// after [`Queue::stop_consuming`]; otherwise this waits until another
    /// handle clone stops the queue. Any number of clones may wait at once.
    pub async fn wait_stopped(&self) -> Result<()> {
        let Some(consuming) = self.consuming.get() else {
            return Ok(());
        };
        let _joining = consuming.joining.lock().await;
        loop {
            let handles = consuming.take_tasks();
            if handles.is_empty() {
                return Ok(());
            }
            for handle in handles {
                handle
                    .await
                    .map_err(|e| Error::Other(format!("queue {} task failed: {e}", self.name)))?;
            }
        }
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming
            .get()
            .is_some_and(|consuming| !consuming.is_stopped())
    }

    /// Attach a consumer invoked once per delivery. Returns the consumer's
    /// generated name.
    pub async fn add_consumer<C: Consumer>(&self, tag: &str, consumer: C) -> Result<String> {
        let consuming = self.consuming_for_new_consumer()?;
        let name = self.register_consumer(tag).await?;

        let span = spans::start_consumer_span(&self.name, &name);
        let handle = tokio::spawn(
            batch::consume_each(Arc::clone(&consuming.deliveries), consumer).instrument(span),
        );
        consuming.track(handle);
        Ok(name)
    }

    /// Attach a batch consumer flushing every `size` deliveries or
    /// [`DEFAULT_BATCH_TIMEOUT`] after the first delivery of a batch.
    pub async fn add_batch_consumer<C: BatchConsumer>(
        &self,
        tag: &str,
        size: usize,
        consumer: C,
    ) -> Result<String> {
        self.add_batch_consumer_with_options(tag, BatchOptions::new(size), consumer)
            .await
    }

    pub async fn add_batch_consumer_with_options<C: BatchConsumer>(
        &self,
        tag: &str,
        options: BatchOptions,
        consumer: C,
    ) -> Result<String> {
        if options.size == 0 {
            return Err(Error::InvalidBatchSize {
                queue: self.name.clone(),
                size: options.size,
            });
        }
        let consuming = self.consuming_for_new_consumer()?;
        let name = self.register_consumer(tag).await?;

        let span = spans::start_consumer_span(&self.name, &name);
        span.record("rmq.batch_size", options.size);
        let handle = tokio::spawn(
            batch::consume_batches(
                self.name.clone(),
                Arc::clone(&consuming.deliveries),
                options,
                consumer,
            )
            .instrument(span),
        );
        consuming.track(handle);
        Ok(name)
    }

    fn consuming_for_new_consumer(&self) -> Result<Arc<Consuming>> {
        let consuming = self.consuming.get().ok_or_else(|| Error::NotConsuming {
            queue: self.name.clone(),
        })?;
        if consuming.is_stopped() {
            return Err(Error::ConsumingStopped {
                queue: self.name.clone(),
            });
        }
        Ok(Arc::clone(consuming))
    }

    async fn register_consumer(&self, tag: &str) -> Result<String> {
        let name = crate::connection::unique_name(tag);
        self.store.sadd(&self.keys.consumers, &name).await?;
        info!(queue = %self, consumer = %name, "added consumer");
        Ok(name)
    }

    /// Names of the consumers registered for this queue on this connection.
    pub async fn consumers(&self) -> Result<Vec<String>> {
        self.store.smembers(&self.keys.consumers).await
    }

    /// Unregister a consumer name. Its task keeps running until the buffer
    /// closes; this only updates the registry read by cleanup processes.
    pub async fn remove_consumer(&self, name: &str) -> Result<bool> {
        self.store.srem(&self.keys.consumers, name).await
    }

    pub async fn remove_all_consumers(&self) -> Result<bool> {
        self.store.del(&self.keys.consumers).await
    }

    /// Move every delayed payload due at or before `now` into ready, as one
    /// atomic store operation. The consumption loop runs this each iteration.
    pub async fn migrate_delayed(&self, now: DateTime<Utc>) -> Result<usize> {
        let moved = self
            .store
            .migrate_due(&self.keys.delayed, &self.keys.ready, now.timestamp())
            .await?;
        if moved > 0 {
            debug!(queue = %self, moved, "migrated delayed deliveries");
            metrics::migrated().add(moved as u64, &[metrics::queue_label(&self.name)]);
        }
        Ok(moved)
    }

    // -----------------------------------------------------------------------
    // Counts
    // -----------------------------------------------------------------------

    pub async fn ready_count(&self) -> usize {
        let result = self.store.llen(&self.keys.ready).await;
        self.count_or_zero("ready_count", result)
    }

    pub async fn unacked_count(&self) -> usize {
        let result = self.store.llen(&self.keys.unacked).await;
        self.count_or_zero("unacked_count", result)
    }

    pub async fn rejected_count(&self) -> usize {
        let result = self.store.llen(&self.keys.rejected).await;
        self.count_or_zero("rejected_count", result)
    }

    pub async fn delayed_count(&self) -> usize {
        let result = self.store.zcard(&self.keys.delayed).await;
        self.count_or_zero("delayed_count", result)
    }

    fn count_or_zero(&self, operation: &'static str, result: Result<usize>) -> usize {
        result.unwrap_or_else(|e| {
            self.store_error(operation, &e);
            0
        })
    }

    pub(crate) fn store_error(&self, operation: &'static str, error: &Error) {
        warn!(queue = %self, operation, error = %error, "store operation failed");
        metrics::store_errors().add(1, &[KeyValue::new("operation", operation)]);
    }

    // -----------------------------------------------------------------------
    // Purge
    // -----------------------------------------------------------------------

    /// Delete every ready payload. Returns the number present when the
    /// purge began.
    pub async fn purge_ready(&self) -> usize {
        self.purge_list(&self.keys.ready, "ready").await
    }

    pub async fn purge_rejected(&self) -> usize {
        self.purge_list(&self.keys.rejected, "rejected").await
    }

    pub async fn purge_delayed(&self) -> usize {
        let total = match self.store.zcard(&self.keys.delayed).await {
            Ok(total) => total,
            Err(e) => {
                self.store_error("purge_delayed", &e);
                return 0;
            }
        };
        let mut todo = total;
        while todo > 0 {
            let chunk = todo.min(CHUNK_SIZE);
            if let Err(e) = self
                .store
                .zremrangebyrank(&self.keys.delayed, 0, chunk as isize - 1)
                .await
            {
                self.store_error("purge_delayed", &e);
                return self.purged("delayed", total - todo);
            }
            todo -= chunk;
        }
        self.purged("delayed", total)
    }

    /// Trim the list from its right end in bounded chunks so a large purge
    /// never blocks the store with one long command. Entries published
    /// concurrently may or may not survive.
    async fn purge_list(&self, key: &str, list: &'static str) -> usize {
        let total = match self.store.llen(key).await {
            Ok(total) => total,
            Err(e) => {
                self.store_error("purge", &e);
                return 0;
            }
        };
        let mut todo = total;
        while todo > 0 {
            let chunk = todo.min(CHUNK_SIZE);
            if let Err(e) = self.store.ltrim(key, 0, -1 - chunk as isize).await {
                self.store_error("purge", &e);
                return self.purged(list, total - todo);
            }
            todo -= chunk;
        }
        self.purged(list, total)
    }

    fn purged(&self, list: &'static str, count: usize) -> usize {
        if count > 0 {
            info!(queue = %self, list, count, "purged");
            metrics::purged().add(
                count as u64,
                &[metrics::queue_label(&self.name), KeyValue::new("list", list)],
            );
        }
        count
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Move up to `count` rejected payloads back to ready, oldest first.
    /// Returns how many were moved.
    pub async fn return_rejected(&self, count: usize) -> Result<usize> {
        let moved = self
            .move_all(&self.keys.rejected, &self.keys.ready, count)
            .await?;
        if moved > 0 {
            info!(queue = %self, moved, "returned rejected deliveries");
        }
        Ok(moved)
    }

    pub async fn return_all_rejected(&self) -> Result<usize> {
        let count = self.store.llen(&self.keys.rejected).await?;
        self.return_rejected(count).await
    }

    /// Move every payload in this connection's unacked list back to ready.
    pub async fn return_all_unacked(&self) -> Result<usize> {
        let count = self.store.llen(&self.keys.unacked).await?;
        let moved = self
            .move_all(&self.keys.unacked, &self.keys.ready, count)
            .await?;
        if moved > 0 {
            info!(queue = %self, moved, "returned unacked deliveries");
        }
        Ok(moved)
    }

    async fn move_all(&self, from: &str, to: &str, count: usize) -> Result<usize> {
        for moved in 0..count {
            if self.store.rpoplpush(from, to).await?.is_none() {
                return Ok(moved);
            }
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Purge ready, rejected, and delayed entries and remove the queue from
    /// the open-queue registry. Unacked lists are per connection and are
    /// left to connection cleanup. Returns whether the queue was registered.
    pub async fn close(&self) -> Result<bool> {
        self.purge_rejected().await;
        self.purge_ready().await;
        self.purge_delayed().await;
        let removed = self.store.srem(&self.keys.queues, &self.name).await?;
        info!(queue = %self, "closed");
        Ok(removed)
    }

    /// Remove this connection's traces of the queue: its unacked list, its
    /// consumer registry, and its entry in the connection's queue set.
    pub async fn close_in_connection(&self) -> Result<()> {
        self.store.del(&self.keys.unacked).await?;
        self.store.del(&self.keys.consumers).await?;
        self.store
            .srem(&self.keys.connection_queues, &self.name)
            .await?;
        debug!(queue = %self, "closed in connection");
        Ok(())
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} conn:{}]", self.name, self.connection)
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("connection", &self.connection)
            .field("consuming", &self.is_consuming())
            .finish()
    }
}
