//! Coordinator tests on a real tokio runtime with short timeouts.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use baton_queue::{
    Coordinator, CoordinatorHandle, CoordinatorState, ProcessError, QueueConfig, QueueError,
    QueueItem, QueueSnapshot, processor_fn,
};
use baton_store::{FileStore, MemoryStore};
use serde_json::json;

fn fast_config() -> QueueConfig {
    QueueConfig::default()
        .with_label("test")
        .with_queue_group_time(Duration::from_millis(10))
        .with_backoff_time(Duration::from_millis(50))
        .with_process_timeout(Duration::from_millis(200))
        .with_active_queue_timeout(Duration::from_millis(400))
}

/// Collects every batch it is handed and always succeeds.
#[derive(Clone, Default)]
struct Recorder {
    batches: Arc<Mutex<Vec<Vec<QueueItem>>>>,
}

impl Recorder {
    fn delivered(&self) -> usize {
        self.batches.lock().unwrap().iter().map(Vec::len).sum()
    }

    fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    fn spawn(&self, config: QueueConfig, store: MemoryStore) -> CoordinatorHandle {
        let batches = self.batches.clone();
        Coordinator::spawn(
            config,
            store,
            processor_fn(move |batch| {
                let batches = batches.clone();
                async move {
                    batches.lock().unwrap().push(batch);
                    Ok(())
                }
            }),
        )
        .unwrap()
    }
}

async fn wait_for<F>(handle: &CoordinatorHandle, what: &str, mut done: F) -> QueueSnapshot
where
    F: FnMut(&QueueSnapshot) -> bool,
{
    for _ in 0..300 {
        let snapshot = handle.snapshot().await.unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn enqueued_items_are_delivered_in_one_batch() {
    let recorder = Recorder::default();
    let handle = recorder.spawn(fast_config(), MemoryStore::new());

    let items: Vec<_> = (0..5).map(|n| json!({ "n": n })).collect();
    handle.enqueue_batch(&items).await.unwrap();

    let snapshot = wait_for(&handle, "empty queue", |s| s.queue_len == 0 && !s.processing).await;
    assert_eq!(snapshot.error_count, 0);
    assert_eq!(recorder.batch_count(), 1);
    assert_eq!(recorder.delivered(), 5);

    let batch = recorder.batches.lock().unwrap()[0].clone();
    let order: Vec<_> = batch.iter().map(|item| item.field("n").cloned()).collect();
    assert_eq!(order, (0..5).map(|n| Some(json!(n))).collect::<Vec<_>>());

    handle.destroy().await;
}

#[tokio::test]
async fn enqueue_returns_the_id_of_the_delivered_item() {
    let recorder = Recorder::default();
    let handle = recorder.spawn(fast_config(), MemoryStore::new());

    let id = handle.enqueue(&json!({ "event": "click" })).await.unwrap();
    wait_for(&handle, "delivery", |s| s.queue_len == 0 && !s.processing).await;

    let batch = recorder.batches.lock().unwrap()[0].clone();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, id);
    assert_eq!(batch[0].field("event"), Some(&json!("click")));

    // A rejected payload is an item error, not a closed queue.
    assert!(matches!(
        handle.enqueue(&json!({ "id": 1 })).await,
        Err(QueueError::Item(_))
    ));
    assert!(handle.snapshot().await.is_ok());

    handle.destroy().await;
}

#[tokio::test]
async fn failing_processor_is_retried_until_it_succeeds() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handle = Coordinator::spawn(
        fast_config(),
        MemoryStore::new(),
        processor_fn(move |_batch| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(ProcessError::failed("upstream unavailable"))
                } else {
                    Ok(())
                }
            }
        }),
    )
    .unwrap();

    handle.enqueue(&json!({ "event": "signup" })).await.unwrap();

    let snapshot = wait_for(&handle, "delivery after retries", |s| s.queue_len == 0).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(snapshot.error_count, 0);

    handle.destroy().await;
}

#[tokio::test]
async fn hung_processor_times_out_and_the_batch_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handle = Coordinator::spawn(
        fast_config(),
        MemoryStore::new(),
        processor_fn(move |_batch| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Ok(())
            }
        }),
    )
    .unwrap();

    handle.enqueue(&json!({ "n": 1 })).await.unwrap();

    // The first attempt is still asleep, so delivery means the timeout
    // released the batch for a second attempt.
    let snapshot = wait_for(&handle, "retry to succeed", |s| s.queue_len == 0).await;
    assert_eq!(snapshot.error_count, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    handle.destroy().await;
}

#[tokio::test]
async fn destroyed_handle_rejects_calls() {
    let recorder = Recorder::default();
    let handle = recorder.spawn(fast_config(), MemoryStore::new());

    handle.destroy().await;
    handle.destroy().await;

    assert!(matches!(
        handle.enqueue(&json!({ "n": 1 })).await,
        Err(QueueError::Destroyed)
    ));
    assert!(matches!(handle.flush().await, Err(QueueError::Destroyed)));
    assert!(matches!(handle.snapshot().await, Err(QueueError::Destroyed)));
    assert!(!handle.deactivate().await);
}

#[tokio::test]
async fn invalid_config_is_rejected_at_spawn() {
    let result = Coordinator::spawn(
        fast_config().with_process_timeout(Duration::from_millis(400)),
        MemoryStore::new(),
        processor_fn(|_batch| async { Ok(()) }),
    );
    assert!(matches!(result, Err(QueueError::Config(_))));
}

#[tokio::test]
async fn deactivated_owner_hands_over_immediately() {
    let store = MemoryStore::new();
    let first = Recorder::default();
    let second = Recorder::default();

    let a = first.spawn(fast_config(), store.clone());
    a.flush().await.unwrap();
    wait_for(&a, "a to claim the queue", |s| s.owner.is_ours()).await;

    let b = second.spawn(fast_config(), store.clone());
    let snapshot = b.snapshot().await.unwrap();
    assert!(!snapshot.owner.may_process());

    assert!(a.deactivate().await);
    assert!(a.is_closed() || a.snapshot().await.is_err());

    b.enqueue(&json!({ "from": "b" })).await.unwrap();
    b.flush().await.unwrap();
    wait_for(&b, "b to deliver", |s| s.queue_len == 0).await;

    assert_eq!(first.delivered(), 0);
    assert_eq!(second.delivered(), 1);

    b.destroy().await;
}

#[tokio::test]
async fn snapshot_reflects_a_deferred_instance() {
    let store = MemoryStore::new();
    let owner = Recorder::default();
    let other = Recorder::default();

    let a = owner.spawn(fast_config(), store.clone());
    a.flush().await.unwrap();
    wait_for(&a, "a to claim the queue", |s| s.owner.is_ours()).await;

    let b = other.spawn(fast_config(), store.clone());
    let snapshot = wait_for(&b, "b to defer", |s| s.state == CoordinatorState::Deferred).await;
    assert_eq!(snapshot.label, "test");
    assert!(!snapshot.durable);

    a.destroy().await;
    b.destroy().await;
}

#[tokio::test]
async fn file_store_items_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    let failing = Coordinator::spawn(
        fast_config(),
        FileStore::open(dir.path()).unwrap(),
        processor_fn(|_batch| async { Err(ProcessError::failed("offline")) }),
    )
    .unwrap();
    assert!(failing.store_is_durable());

    failing
        .enqueue_batch(&[json!({ "n": 1 }), json!({ "n": 2 }), json!({ "n": 3 })])
        .await
        .unwrap();
    failing.destroy().await;

    let recorder = Recorder::default();
    let batches = recorder.batches.clone();
    let restarted = Coordinator::spawn(
        fast_config(),
        FileStore::open(dir.path()).unwrap(),
        processor_fn(move |batch| {
            let batches = batches.clone();
            async move {
                batches.lock().unwrap().push(batch);
                Ok(())
            }
        }),
    )
    .unwrap();

    wait_for(&restarted, "restarted instance to deliver", |s| s.queue_len == 0).await;
    assert_eq!(recorder.delivered(), 3);

    restarted.destroy().await;
}
