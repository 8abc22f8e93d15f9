//! A unit of work checked out of a queue.
//!
//! A delivery is created when the consumption loop moves a payload from the
//! ready list into this connection's unacked list. Leaving the unacked state
//! always removes one occurrence of the payload by value, so identical
//! payloads in flight are tracked independently and a repeated removal is
//! a no-op rather than an error.
//!
//! Moves to another list write the destination first and remove from
//! unacked second. A failure in between leaves the payload in both places,
//! which is the at-least-once trade-off: consumers must tolerate redelivery.

use crate::error::Result;
use crate::store::Store;
use crate::telemetry::{metrics, queue as spans};
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Where a delivery came from and where it may go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeliveryRoute {
    pub queue: String,
    pub unacked: String,
    pub rejected: String,
    pub delayed: String,
    /// Ready list of the push target, if one is configured.
    pub push: Option<String>,
}

/// Lifecycle state of a delivery as observed by this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Checked out, waiting for the consumer to settle it.
    Unacked,
    /// Removed for good.
    Acked,
    /// Moved to the rejected list.
    Rejected,
    /// Moved to the push target's ready list.
    Pushed,
    /// Moved back to the delayed set with a new due time.
    Delayed,
}

impl DeliveryState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Acked,
            2 => Self::Rejected,
            3 => Self::Pushed,
            4 => Self::Delayed,
            _ => Self::Unacked,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unacked => 0,
            Self::Acked => 1,
            Self::Rejected => 2,
            Self::Pushed => 3,
            Self::Delayed => 4,
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unacked => "unacked",
            Self::Acked => "acked",
            Self::Rejected => "rejected",
            Self::Pushed => "pushed",
            Self::Delayed => "delayed",
        };
        f.write_str(s)
    }
}

/// A payload checked out by a consumer.
pub struct Delivery {
    payload: String,
    route: Arc<DeliveryRoute>,
    store: Arc<dyn Store>,
    state: AtomicU8,
}

impl Delivery {
    pub(crate) fn new(payload: String, route: Arc<DeliveryRoute>, store: Arc<dyn Store>) -> Self {
        Self {
            payload,
            route,
            store,
            state: AtomicU8::new(DeliveryState::Unacked.as_u8()),
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Name of the queue this delivery was consumed from.
    pub fn queue(&self) -> &str {
        &self.route.queue
    }

    /// Last state this handle moved the delivery into.
    pub fn state(&self) -> DeliveryState {
        DeliveryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Remove the payload from the unacked list.
    ///
    /// Returns `false` when nothing was removed. Once this handle has settled
    /// the delivery, every transition returns `false` without touching the
    /// store.
    pub async fn ack(&self) -> Result<bool> {
        if self.is_settled() {
            return Ok(false);
        }
        let removed = self.remove_unacked().await?;
        self.settle(removed, DeliveryState::Acked);
        Ok(removed)
    }

    /// Move the payload to the queue's rejected list.
    pub async fn reject(&self) -> Result<bool> {
        self.move_to(&self.route.rejected, DeliveryState::Rejected)
            .await
    }

    /// Move the payload to the push target's ready list. Without a push
    /// target this is a reject.
    pub async fn push(&self) -> Result<bool> {
        match &self.route.push {
            Some(push) => self.move_to(push, DeliveryState::Pushed).await,
            None => self.reject().await,
        }
    }

    /// Schedule the payload again for `due` and remove it from unacked.
    pub async fn requeue_at(&self, due: DateTime<Utc>) -> Result<bool> {
        if self.is_settled() {
            return Ok(false);
        }
        self.store
            .zadd(&self.route.delayed, due.timestamp(), &self.payload)
            .await?;
        let removed = self.remove_unacked().await?;
        self.settle(removed, DeliveryState::Delayed);
        Ok(removed)
    }

    /// Schedule the payload again `delay` from now.
    pub async fn requeue_after(&self, delay: std::time::Duration) -> Result<bool> {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let due = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.requeue_at(due).await
    }

    async fn move_to(&self, target: &str, to: DeliveryState) -> Result<bool> {
        if self.is_settled() {
            return Ok(false);
        }
        self.store.lpush(target, &self.payload).await?;
        let removed = self.remove_unacked().await?;
        self.settle(removed, to);
        Ok(removed)
    }

    /// A delivery this handle already moved out of unacked must not be
    /// written anywhere else, or it would be delivered again.
    fn is_settled(&self) -> bool {
        let settled = self.state() != DeliveryState::Unacked;
        if settled {
            tracing::debug!(
                queue = %self.route.queue,
                state = %self.state(),
                "delivery already settled"
            );
        }
        settled
    }

    async fn remove_unacked(&self) -> Result<bool> {
        let removed = self
            .store
            .lrem(&self.route.unacked, 1, &self.payload)
            .await?;
        Ok(removed == 1)
    }

    fn settle(&self, removed: bool, to: DeliveryState) {
        if !removed {
            tracing::debug!(queue = %self.route.queue, %to, "delivery already left unacked");
            return;
        }
        let from = DeliveryState::from_u8(self.state.swap(to.as_u8(), Ordering::AcqRel));
        spans::record_delivery_transition(&self.route.queue, &from.to_string(), &to.to_string());
        metrics::delivery_transitions().add(
            1,
            &[
                metrics::queue_label(&self.route.queue),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload", &self.payload)
            .field("queue", &self.route.queue)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}]", self.payload, self.route.queue)
    }
}
