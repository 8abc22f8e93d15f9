//! Integration tests for the consumption loop, consumers, and delivery
//! transitions, run against the in-memory store.

use chrono::{Duration as ChronoDuration, Utc};
use rmq::keys::Keys;
use rmq::{
    BatchOptions, ConsumeOptions, Connection, Delivery, DeliveryState, Error, MemoryStore, Queue,
    batch_consumer_fn, consumer_fn,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

async fn test_queue(name: &str) -> (Arc<MemoryStore>, Queue) {
    let store = Arc::new(MemoryStore::new());
    let connection = Connection::new("test", store.clone());
    let queue = connection.open_queue(name).await.unwrap();
    (store, queue)
}

fn fast_options(prefetch_limit: usize) -> ConsumeOptions {
    ConsumeOptions {
        prefetch_limit,
        poll_interval: Duration::from_millis(10),
    }
}

/// Poll the unacked count until it reaches `expected` or two seconds pass.
async fn wait_for_unacked(queue: &Queue, expected: usize) -> bool {
    for _ in 0..200 {
        if queue.unacked_count().await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Start consuming and forward every delivery to the returned channel
/// without settling it.
async fn capture_deliveries(queue: &Queue) -> mpsc::UnboundedReceiver<Delivery> {
    let (tx, rx) = mpsc::unbounded_channel();
    queue.start_consuming(fast_options(10)).await.unwrap();
    queue
        .add_consumer(
            "capture",
            consumer_fn(move |delivery| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(delivery);
                }
            }),
        )
        .await
        .unwrap();
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no delivery within 2s")
        .expect("consumer channel closed")
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_consuming_twice_returns_false() {
    let (_store, queue) = test_queue("things").await;

    assert!(queue.start_consuming(fast_options(10)).await.unwrap());
    assert!(!queue.start_consuming(fast_options(10)).await.unwrap());
    assert!(queue.is_consuming());

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn adding_consumer_before_start_is_misuse() {
    let (_store, queue) = test_queue("things").await;

    let err = queue
        .add_consumer("early", consumer_fn(|_delivery| async {}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConsuming { .. }));
    assert!(err.is_misuse());
}

#[tokio::test]
async fn adding_consumer_after_stop_is_misuse() {
    let (_store, queue) = test_queue("things").await;
    queue.start_consuming(fast_options(10)).await.unwrap();
    assert!(queue.stop_consuming());

    let err = queue
        .add_consumer("late", consumer_fn(|_delivery| async {}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConsumingStopped { .. }));
}

#[tokio::test]
async fn stop_consuming_is_idempotent_and_wait_stopped_returns() {
    let (_store, queue) = test_queue("things").await;
    assert!(!queue.stop_consuming());

    queue.start_consuming(fast_options(10)).await.unwrap();
    queue
        .add_consumer("noop", consumer_fn(|_delivery| async {}))
        .await
        .unwrap();

    assert!(queue.stop_consuming());
    assert!(!queue.stop_consuming());
    tokio::time::timeout(Duration::from_secs(2), queue.wait_stopped())
        .await
        .expect("consumers did not stop")
        .unwrap();
    assert!(!queue.is_consuming());
}

#[tokio::test]
async fn zero_prefetch_is_raised_to_one() {
    let (_store, queue) = test_queue("things").await;
    for i in 0..3 {
        queue.publish(&format!("job-{i}")).await.unwrap();
    }

    queue.start_consuming(fast_options(0)).await.unwrap();
    assert!(wait_for_unacked(&queue, 1).await);

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn start_consuming_registers_queue_with_connection() {
    let store = Arc::new(MemoryStore::new());
    let connection = Connection::new("test", store.clone());
    let queue = connection.open_queue("things").await.unwrap();

    queue.start_consuming(fast_options(10)).await.unwrap();
    assert_eq!(connection.consumed_queues().await.unwrap(), vec!["things"]);

    let name = queue
        .add_consumer("worker", consumer_fn(|_delivery| async {}))
        .await
        .unwrap();
    assert!(name.starts_with("worker-"));
    assert_eq!(queue.consumers().await.unwrap(), vec![name.clone()]);
    assert!(queue.remove_consumer(&name).await.unwrap());
    assert!(queue.consumers().await.unwrap().is_empty());

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

// ---------------------------------------------------------------------------
// Consumption
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_published_payload_is_acked_once() {
    let (_store, queue) = test_queue("things").await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    queue.start_consuming(fast_options(5)).await.unwrap();
    queue
        .add_consumer(
            "acker",
            consumer_fn(move |delivery: Delivery| {
                let tx = tx.clone();
                async move {
                    assert!(delivery.ack().await.unwrap());
                    let _ = tx.send(delivery.payload().to_string());
                }
            }),
        )
        .await
        .unwrap();

    for i in 0..20 {
        queue.publish(&format!("job-{i}")).await.unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 20 {
        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("consumer stalled")
            .unwrap();
        seen.push(payload);
    }
    seen.sort();
    let mut expected: Vec<String> = (0..20).map(|i| format!("job-{i}")).collect();
    expected.sort();
    assert_eq!(seen, expected);

    assert!(wait_for_unacked(&queue, 0).await);
    assert_eq!(queue.ready_count().await, 0);

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn prefetch_limit_bounds_unacked_without_consumers() {
    let (_store, queue) = test_queue("things").await;
    for i in 0..10 {
        queue.publish(&format!("job-{i}")).await.unwrap();
    }

    queue.start_consuming(fast_options(3)).await.unwrap();
    assert!(wait_for_unacked(&queue, 3).await);

    // Give the loop several more polls; nobody drains the buffer.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.unacked_count().await, 3);
    assert_eq!(queue.ready_count().await, 7);

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn loop_migrates_due_delayed_payloads() {
    let (_store, queue) = test_queue("things").await;
    let mut rx = capture_deliveries(&queue).await;

    queue
        .publish_on_delay("overdue", Utc::now() - ChronoDuration::seconds(1))
        .await
        .unwrap();
    queue
        .publish_on_delay("future", Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();

    let delivery = next(&mut rx).await;
    assert_eq!(delivery.payload(), "overdue");
    assert_eq!(queue.delayed_count().await, 1);

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn loop_survives_store_outage() {
    let (store, queue) = test_queue("things").await;
    let mut rx = capture_deliveries(&queue).await;

    store.set_unavailable(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.set_unavailable(false);

    queue.publish("after-outage").await.unwrap();
    assert_eq!(next(&mut rx).await.payload(), "after-outage");

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

// ---------------------------------------------------------------------------
// Delivery transitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ack_removes_from_unacked_and_second_ack_is_false() {
    let (_store, queue) = test_queue("things").await;
    let mut rx = capture_deliveries(&queue).await;
    queue.publish("job").await.unwrap();

    let delivery = next(&mut rx).await;
    assert_eq!(delivery.queue(), "things");
    assert_eq!(delivery.state(), DeliveryState::Unacked);
    assert_eq!(queue.unacked_count().await, 1);

    assert!(delivery.ack().await.unwrap());
    assert_eq!(delivery.state(), DeliveryState::Acked);
    assert_eq!(queue.unacked_count().await, 0);
    assert!(!delivery.ack().await.unwrap());

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn reject_moves_to_rejected_list() {
    let (_store, queue) = test_queue("things").await;
    let mut rx = capture_deliveries(&queue).await;
    queue.publish("bad").await.unwrap();

    let delivery = next(&mut rx).await;
    assert!(delivery.reject().await.unwrap());
    assert_eq!(delivery.state(), DeliveryState::Rejected);
    assert_eq!(queue.unacked_count().await, 0);
    assert_eq!(queue.rejected_count().await, 1);

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn push_moves_to_target_ready_list() {
    let store = Arc::new(MemoryStore::new());
    let connection = Connection::new("test", store.clone());
    let source = connection.open_queue("source").await.unwrap();
    let target = connection.open_queue("target").await.unwrap();
    source.set_push_queue(&target.ready_list());
    assert_eq!(source.push_queue(), Some(target.ready_list()));

    let mut rx = capture_deliveries(&source).await;
    source.publish("forward-me").await.unwrap();

    let delivery = next(&mut rx).await;
    assert!(delivery.push().await.unwrap());
    assert_eq!(delivery.state(), DeliveryState::Pushed);
    assert_eq!(source.unacked_count().await, 0);
    assert_eq!(source.rejected_count().await, 0);
    assert_eq!(store.list(&target.keys().ready), vec!["forward-me"]);

    source.stop_consuming();
    source.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn push_without_target_rejects() {
    let (_store, queue) = test_queue("things").await;
    let mut rx = capture_deliveries(&queue).await;
    queue.publish("nowhere").await.unwrap();

    let delivery = next(&mut rx).await;
    assert!(delivery.push().await.unwrap());
    assert_eq!(delivery.state(), DeliveryState::Rejected);
    assert_eq!(queue.rejected_count().await, 1);

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn requeue_moves_back_to_delayed_set() {
    let (store, queue) = test_queue("things").await;
    let mut rx = capture_deliveries(&queue).await;
    queue.publish("retry").await.unwrap();

    let delivery = next(&mut rx).await;
    let due = Utc::now() + ChronoDuration::hours(1);
    assert!(delivery.requeue_at(due).await.unwrap());
    assert_eq!(delivery.state(), DeliveryState::Delayed);
    assert_eq!(queue.unacked_count().await, 0);
    assert_eq!(
        store.sorted(&queue.keys().delayed),
        vec![(due.timestamp(), "retry".to_string())]
    );

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn duplicate_payloads_are_tracked_independently() {
    let (_store, queue) = test_queue("things").await;
    let mut rx = capture_deliveries(&queue).await;
    queue.publish("same").await.unwrap();
    queue.publish("same").await.unwrap();

    let first = next(&mut rx).await;
    let second = next(&mut rx).await;
    assert_eq!(queue.unacked_count().await, 2);

    assert!(first.ack().await.unwrap());
    assert_eq!(queue.unacked_count().await, 1);
    assert!(second.reject().await.unwrap());
    assert_eq!(queue.unacked_count().await, 0);
    assert_eq!(queue.rejected_count().await, 1);

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn settled_delivery_is_not_written_again() {
    let (store, queue) = test_queue("things").await;
    let mut rx = capture_deliveries(&queue).await;
    queue.publish("done").await.unwrap();

    let delivery = next(&mut rx).await;
    assert!(delivery.ack().await.unwrap());

    assert!(!delivery.reject().await.unwrap());
    assert!(!delivery.push().await.unwrap());
    assert!(!delivery.requeue_after(Duration::from_secs(60)).await.unwrap());
    assert!(!delivery.ack().await.unwrap());
    assert_eq!(delivery.state(), DeliveryState::Acked);
    assert_eq!(queue.rejected_count().await, 0);
    assert_eq!(queue.delayed_count().await, 0);
    assert_eq!(store.calls("lpush"), 1);

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn settled_delivery_leaves_identical_unacked_payload_alone() {
    let (_store, queue) = test_queue("things").await;
    let mut rx = capture_deliveries(&queue).await;
    queue.publish("same").await.unwrap();
    queue.publish("same").await.unwrap();

    let first = next(&mut rx).await;
    let _second = next(&mut rx).await;
    assert!(first.reject().await.unwrap());

    // A late ack on the rejected handle must not remove the other copy.
    assert!(!first.ack().await.unwrap());
    assert_eq!(queue.unacked_count().await, 1);

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

// ---------------------------------------------------------------------------
// Competing consumers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn competing_consumers_each_get_distinct_payloads() {
    let (_store, queue) = test_queue("things").await;
    let received: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
    let batch_sizes: Arc<std::sync::Mutex<Vec<usize>>> = Arc::default();

    queue.start_consuming(fast_options(5)).await.unwrap();
    for tag in ["first", "second"] {
        let received = Arc::clone(&received);
        queue
            .add_consumer(
                tag,
                consumer_fn(move |delivery: Delivery| {
                    let received = Arc::clone(&received);
                    async move {
                        delivery.ack().await.unwrap();
                        received.lock().unwrap().push(delivery.payload().to_string());
                    }
                }),
            )
            .await
            .unwrap();
    }
    {
        let received = Arc::clone(&received);
        let batch_sizes = Arc::clone(&batch_sizes);
        queue
            .add_batch_consumer_with_options(
                "batcher",
                BatchOptions::new(4).timeout(Duration::from_millis(50)),
                batch_consumer_fn(move |batch: Vec<Delivery>| {
                    let received = Arc::clone(&received);
                    let batch_sizes = Arc::clone(&batch_sizes);
                    async move {
                        batch_sizes.lock().unwrap().push(batch.len());
                        for delivery in &batch {
                            delivery.ack().await.unwrap();
                            received.lock().unwrap().push(delivery.payload().to_string());
                        }
                    }
                }),
            )
            .await
            .unwrap();
    }

    for i in 0..60 {
        queue.publish(&format!("job-{i:02}")).await.unwrap();
    }

    for _ in 0..200 {
        if received.lock().unwrap().len() >= 60 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Give any duplicate delivery a chance to show up.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut seen = received.lock().unwrap().clone();
    seen.sort();
    let expected: Vec<String> = (0..60).map(|i| format!("job-{i:02}")).collect();
    assert_eq!(seen, expected);
    assert!(
        batch_sizes
            .lock()
            .unwrap()
            .iter()
            .all(|&size| (1..=4).contains(&size))
    );
    assert!(wait_for_unacked(&queue, 0).await);
    assert_eq!(queue.consumers().await.unwrap().len(), 3);

    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
}

// ---------------------------------------------------------------------------
// Shutdown and recovery across connections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_waiter_returns_only_after_consumers_exit() {
    let (_store, queue) = test_queue("things").await;
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let finished = Arc::new(AtomicBool::new(false));

    queue.start_consuming(fast_options(10)).await.unwrap();
    {
        let finished = Arc::clone(&finished);
        queue
            .add_consumer(
                "slow",
                consumer_fn(move |delivery: Delivery| {
                    let started_tx = started_tx.clone();
                    let finished = Arc::clone(&finished);
                    async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        delivery.ack().await.unwrap();
                        finished.store(true, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();
    }
    queue.publish("slow-job").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), started_rx.recv())
        .await
        .expect("consumer never started")
        .unwrap();

    queue.stop_consuming();
    let other = queue.clone();
    let (first, second) = tokio::join!(
        async {
            queue.wait_stopped().await.unwrap();
            finished.load(Ordering::SeqCst)
        },
        async {
            other.wait_stopped().await.unwrap();
            finished.load(Ordering::SeqCst)
        },
    );
    assert!(first);
    assert!(second);
}

#[tokio::test]
async fn stopped_worker_unacked_can_be_returned_by_name() {
    let store = Arc::new(MemoryStore::new());
    let worker = Connection::new("worker", store.clone());
    let queue = worker.open_queue("things").await.unwrap();
    let mut rx = capture_deliveries(&queue).await;
    for i in 0..3 {
        queue.publish(&format!("job-{i}")).await.unwrap();
    }
    for _ in 0..3 {
        next(&mut rx).await;
    }
    queue.stop_consuming();
    queue.wait_stopped().await.unwrap();
    assert_eq!(queue.unacked_count().await, 3);

    // A fresh connection has its own, empty unacked list.
    let fresh = Connection::new("operator", store.clone());
    let unrelated = fresh.open_queue("things").await.unwrap();
    assert_eq!(unrelated.unacked_count().await, 0);

    let operator = Connection::with_name(worker.name(), Keys::default(), store.clone());
    assert_eq!(operator.name(), worker.name());
    let reclaimed = operator.open_queue("things").await.unwrap();
    assert_eq!(reclaimed.unacked_count().await, 3);
    assert_eq!(reclaimed.return_all_unacked().await.unwrap(), 3);
    assert_eq!(queue.unacked_count().await, 0);
    assert_eq!(queue.ready_count().await, 3);
}
