//! Consumer capabilities.
//!
//! A consumer is invoked once per delivery; a batch consumer is invoked with
//! deliveries grouped by size or timeout. Either way the callback owns the
//! deliveries and is expected to settle each one (ack, reject, push, or
//! requeue). Unsettled deliveries stay in the unacked list until an operator
//! returns them.

use crate::delivery::Delivery;
use async_trait::async_trait;
use std::future::Future;

#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    async fn consume(&self, delivery: Delivery);
}

#[async_trait]
pub trait BatchConsumer: Send + Sync + 'static {
    /// `batch` is never empty and preserves receipt order.
    async fn consume(&self, batch: Vec<Delivery>);
}

/// Adapter turning an async closure into a [`Consumer`].
pub struct ConsumerFn<F>(F);

/// Wrap `f` so it can be passed to `Queue::add_consumer`.
pub fn consumer_fn<F, Fut>(f: F) -> ConsumerFn<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    ConsumerFn(f)
}

#[async_trait]
impl<F, Fut> Consumer for ConsumerFn<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn consume(&self, delivery: Delivery) {
        (self.0)(delivery).await
    }
}

/// Adapter turning an async closure into a [`BatchConsumer`].
pub struct BatchConsumerFn<F>(F);

/// Wrap `f` so it can be passed to `Queue::add_batch_consumer`.
pub fn batch_consumer_fn<F, Fut>(f: F) -> BatchConsumerFn<F>
where
    F: Fn(Vec<Delivery>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    BatchConsumerFn(f)
}

#[async_trait]
impl<F, Fut> BatchConsumer for BatchConsumerFn<F>
where
    F: Fn(Vec<Delivery>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn consume(&self, batch: Vec<Delivery>) {
        (self.0)(batch).await
    }
}
