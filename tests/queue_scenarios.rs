//! End-to-end coalescing scenarios for the operation queue, independent of any network I/O.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_dispatcher::{OpType, OperationQueue, QueueConfig};

fn counts(ops: &[OpType]) -> (usize, usize, usize) {
    let add = ops.iter().filter(|o| **o == OpType::Add).count();
    let update = ops.iter().filter(|o| **o == OpType::Update).count();
    let remove = ops.iter().filter(|o| **o == OpType::Remove).count();
    (add, update, remove)
}

#[tokio::test]
async fn thousand_rapid_mutations_for_one_user_collapse_to_one() {
    let queue: OperationQueue<usize> = OperationQueue::new(
        QueueConfig { flush_interval: Duration::from_millis(20), ..Default::default() },
        fleet_dispatcher::NullSink,
    );
    for i in 0..1000 {
        let op = if i % 3 == 0 {
            OpType::Add
        } else if i % 3 == 1 {
            OpType::Update
        } else {
            OpType::Remove
        };
        queue.enqueue(1, op, i);
    }
    assert_eq!(queue.pending_count(), 1);
    assert_eq!(queue.stats().enqueued, 1000);
    assert_eq!(queue.stats().deduplicated, 999);
}

#[tokio::test]
async fn add_update_remove_sequence_collapses_to_remove_before_flush() {
    let queue: OperationQueue<&'static str> =
        OperationQueue::new(QueueConfig::default(), fleet_dispatcher::NullSink);
    queue.enqueue(42, OpType::Add, "add");
    queue.enqueue(42, OpType::Update, "update");
    queue.enqueue(42, OpType::Remove, "remove");

    let seen: Arc<Mutex<Vec<OpType>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    queue.set_executor(move |batch| {
        let seen = seen2.clone();
        Box::pin(async move {
            seen.lock().unwrap().extend(batch.into_iter().map(|op| op.op_type));
        })
    });
    queue.start().await;
    queue.stop().await;

    let ops = seen.lock().unwrap().clone();
    assert_eq!(ops, vec![OpType::Remove]);
}

#[tokio::test]
async fn ten_thousand_distinct_users_all_flush_exactly_once() {
    let queue: OperationQueue<usize> = OperationQueue::new(
        QueueConfig { max_batch_size: 250, flush_interval: Duration::from_millis(5), ..Default::default() },
        fleet_dispatcher::NullSink,
    );
    const N: usize = 10_000;
    for id in 0..N {
        queue.enqueue(id as i64, OpType::Add, id);
    }

    let total = Arc::new(AtomicUsize::new(0));
    let seen_ids: Arc<Mutex<std::collections::HashSet<usize>>> = Arc::new(Mutex::new(std::collections::HashSet::new()));
    let total2 = total.clone();
    let seen2 = seen_ids.clone();
    queue.set_executor(move |batch| {
        let total = total2.clone();
        let seen = seen2.clone();
        Box::pin(async move {
            total.fetch_add(batch.len(), Ordering::SeqCst);
            let mut guard = seen.lock().unwrap();
            for op in batch {
                guard.insert(op.snapshot);
            }
        })
    });
    queue.start().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    queue.stop().await;

    assert_eq!(total.load(Ordering::SeqCst), N);
    assert_eq!(seen_ids.lock().unwrap().len(), N);
    assert_eq!(queue.pending_count(), 0);
}

#[tokio::test]
async fn mixed_op_batch_preserves_each_users_latest_kind() {
    let queue: OperationQueue<usize> =
        OperationQueue::new(QueueConfig::default(), fleet_dispatcher::NullSink);
    queue.enqueue(1, OpType::Add, 1);
    queue.enqueue(2, OpType::Update, 2);
    queue.enqueue(3, OpType::Remove, 3);
    queue.enqueue(1, OpType::Remove, 1);

    let seen: Arc<Mutex<Vec<OpType>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    queue.set_executor(move |batch| {
        let seen = seen2.clone();
        Box::pin(async move {
            seen.lock().unwrap().extend(batch.into_iter().map(|op| op.op_type));
        })
    });
    queue.start().await;
    queue.stop().await;

    let (add, update, remove) = counts(&seen.lock().unwrap());
    assert_eq!((add, update, remove), (0, 1, 2));
}
