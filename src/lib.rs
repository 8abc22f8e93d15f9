//! # rmq
//!
//! Durable work queues over a key-value store with list and sorted-set
//! primitives (Redis in production, an in-memory store for tests).
//!
//! Producers publish payloads to a queue's ready list or schedule them on
//! its delayed set. A background loop per consuming queue moves due delayed
//! payloads into ready, then moves ready payloads into the connection's
//! unacked list under a prefetch budget and hands them to consumer tasks as
//! [`Delivery`] values. Consumers ack, reject, push, or requeue each one.
//! Delivery is at-least-once.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod keys;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use connection::Connection;
pub use consumer::{BatchConsumer, Consumer, batch_consumer_fn, consumer_fn};
pub use delivery::{Delivery, DeliveryState};
pub use error::{Error, Result};
pub use queue::{BatchOptions, ConsumeOptions, PartialBatch, Queue, ReadyList};
pub use store::{MemoryStore, RedisStore, Store};
