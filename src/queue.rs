//! Deduplicating, coalescing operation queue.
//!
//! Mutations enqueued for the same user id collapse into the latest one; a background task
//! periodically drains pending ops in insertion order and hands them to an executor in batches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::telemetry::{emit_best_effort, FleetEvent, TelemetrySink};

/// Kind of mutation a [`PendingOp`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Add,
    Update,
    Remove,
}

/// A coalesced pending mutation for one user.
#[derive(Debug, Clone)]
pub struct PendingOp<U> {
    pub op_type: OpType,
    pub user_id: i64,
    pub snapshot: U,
    pub enqueued_at: Instant,
}

/// Queue tunables.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub flush_interval: Duration,
    pub max_batch_size: usize,
    pub max_wait_time: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            max_batch_size: 100,
            max_wait_time: Duration::from_secs(1),
        }
    }
}

/// Running counters, exposed for observability and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStats {
    pub enqueued: u64,
    pub deduplicated: u64,
    pub flushed: u64,
    pub batches: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    deduplicated: AtomicU64,
    flushed: AtomicU64,
    batches: AtomicU64,
}

type Executor<U> = Arc<dyn Fn(Vec<PendingOp<U>>) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Dedup-by-user_id coalescing queue, with a periodic background flush.
pub struct OperationQueue<U, S = crate::telemetry::NullSink>
where
    U: Clone + Send + 'static,
{
    config: QueueConfig,
    pending: Arc<Mutex<IndexMap<i64, PendingOp<U>>>>,
    counters: Arc<Counters>,
    executor: Arc<Mutex<Option<Executor<U>>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    worker: Arc<AsyncMutex<Option<JoinHandle<()>>>>,
    sink: S,
}

impl<U, S> OperationQueue<U, S>
where
    U: Clone + Send + Sync + 'static,
    S: TelemetrySink,
{
    pub fn new(config: QueueConfig, sink: S) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            pending: Arc::new(Mutex::new(IndexMap::new())),
            counters: Arc::new(Counters::default()),
            executor: Arc::new(Mutex::new(None)),
            shutdown_tx: Arc::new(shutdown_tx),
            worker: Arc::new(AsyncMutex::new(None)),
            sink,
        }
    }

    /// Install the batch executor. Must be called before [`OperationQueue::start`].
    pub fn set_executor<F>(&self, executor: F)
    where
        F: Fn(Vec<PendingOp<U>>) -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        *self.executor.lock().unwrap() = Some(Arc::new(executor));
    }

    /// Start the background flush loop.
    pub async fn start(&self) {
        let pending = self.pending.clone();
        let counters = self.counters.clone();
        let executor = self.executor.clone();
        let config = self.config.clone();
        let sink = self.sink.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.flush_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        flush_once(&pending, &counters, &executor, &config, sink.clone()).await;
                    }
                }
            }
        });

        *self.worker.lock().await = Some(handle);
    }

    /// Stop the flush loop and perform one final drain so no op is lost.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        flush_once(&self.pending, &self.counters, &self.executor, &self.config, self.sink.clone()).await;
    }

    /// Enqueue a mutation, replacing and counting as deduplicated any existing pending op for
    /// the same user id.
    pub fn enqueue(&self, user_id: i64, op_type: OpType, snapshot: U) {
        let mut guard = self.pending.lock().unwrap();
        if guard.shift_remove(&user_id).is_some() {
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
        }
        guard.insert(
            user_id,
            PendingOp { op_type, user_id, snapshot, enqueued_at: Instant::now() },
        );
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
        }
    }

    /// Number of ops currently pending.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

async fn flush_once<U, S>(
    pending: &Arc<Mutex<IndexMap<i64, PendingOp<U>>>>,
    counters: &Arc<Counters>,
    executor: &Arc<Mutex<Option<Executor<U>>>>,
    config: &QueueConfig,
    sink: S,
) where
    U: Clone + Send + 'static,
    S: TelemetrySink,
{
    let batch: Vec<PendingOp<U>> = {
        let mut guard = pending.lock().unwrap();
        let take = guard.len().min(config.max_batch_size).max(
            guard
                .values()
                .filter(|op| op.enqueued_at.elapsed() >= config.max_wait_time)
                .count(),
        );
        let take = take.min(guard.len());
        let keys: Vec<i64> = guard.keys().take(take).copied().collect();
        keys.into_iter().filter_map(|k| guard.shift_remove(&k)).collect()
    };

    if batch.is_empty() {
        return;
    }

    let batch_size = batch.len();
    counters.flushed.fetch_add(batch_size as u64, Ordering::Relaxed);
    counters.batches.fetch_add(1, Ordering::Relaxed);

    let maybe_exec = executor.lock().unwrap().clone();
    if let Some(exec) = maybe_exec {
        exec(batch).await;
    } else {
        tracing::warn!(batch_size, "queue flushed with no executor installed; batch dropped");
    }

    let pending_after = pending.lock().unwrap().len();
    tracing::debug!(batch_size, pending_after, "queue flush complete");
    emit_best_effort(sink, FleetEvent::QueueFlushed { batch_size, pending_after }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::NullSink;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn enqueue_twice_for_same_user_collapses_to_latest() {
        let queue: OperationQueue<&'static str, NullSink> = OperationQueue::new(QueueConfig::default(), NullSink);
        queue.enqueue(1, OpType::Add, "first");
        queue.enqueue(1, OpType::Update, "second");
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.stats().deduplicated, 1);
        assert_eq!(queue.stats().enqueued, 2);
    }

    #[tokio::test]
    async fn add_then_remove_collapses_to_remove() {
        let queue: OperationQueue<&'static str, NullSink> = OperationQueue::new(QueueConfig::default(), NullSink);
        queue.enqueue(7, OpType::Add, "u7");
        queue.enqueue(7, OpType::Remove, "u7");

        let seen = Arc::new(Mutex::new(Vec::new()));
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
    async fn flush_drains_in_batches_respecting_max_batch_size() {
        let queue: OperationQueue<usize, NullSink> = OperationQueue::new(
            QueueConfig { max_batch_size: 2, flush_interval: Duration::from_millis(10), ..Default::default() },
            NullSink,
        );
        for i in 0..5 {
            queue.enqueue(i, OpType::Add, i as usize);
        }
        let total = Arc::new(AtomicUsize::new(0));
        let total2 = total.clone();
        queue.set_executor(move |batch| {
            let total = total2.clone();
            Box::pin(async move {
                total.fetch_add(batch.len(), Ordering::SeqCst);
            })
        });
        queue.start().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        queue.stop().await;
        assert_eq!(total.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn stop_drains_remaining_pending_ops() {
        let queue: OperationQueue<usize, NullSink> = OperationQueue::new(QueueConfig::default(), NullSink);
        queue.enqueue(1, OpType::Add, 1);
        let total = Arc::new(AtomicUsize::new(0));
        let total2 = total.clone();
        queue.set_executor(move |batch| {
            let total = total2.clone();
            Box::pin(async move {
                total.fetch_add(batch.len(), Ordering::SeqCst);
            })
        });
        queue.start().await;
        queue.stop().await;
        assert_eq!(total.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count(), 0);
    }
}
