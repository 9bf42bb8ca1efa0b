// =============================================================================
// Coordinator — per-key actor pool with strict per-key serialization
// =============================================================================
//
// N partitions, each a dedicated task draining a FIFO channel of boxed jobs.
// A job keyed by string (tradeId or symbol) is routed to partition
// hash(key) % N, so every job for the same key runs on the same partition in
// submission order; jobs for different keys run fully concurrently.
//
// Routing uses SipHash (the std HashMap hasher), which is uniform over the
// partition range and has no signed-abs edge case.
//
// Jobs must never block a partition indefinitely: broker calls submitted
// here carry their own timeouts. A panicking job is caught and logged; the
// partition keeps draining.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// How long `shutdown` waits for each partition to drain before aborting it.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// Default partition count: one per CPU, clamped to [8, 32].
pub fn default_partition_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(8)
        .clamp(8, 32)
}

/// A named pool of serial partitions. Three instances exist in the engine,
/// with disjoint key spaces: trades (tradeId), entry signals (symbol), exit
/// signals (tradeId).
pub struct Coordinator {
    name: &'static str,
    senders: Mutex<Vec<mpsc::UnboundedSender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    partitions: usize,
    submitted: AtomicU64,
    rejected: AtomicU64,
}

impl Coordinator {
    pub fn new(name: &'static str) -> Self {
        Self::with_partitions(name, default_partition_count())
    }

    pub fn with_partitions(name: &'static str, partitions: usize) -> Self {
        assert!(partitions > 0, "coordinator needs at least one partition");

        let mut senders = Vec::with_capacity(partitions);
        let mut handles = Vec::with_capacity(partitions);

        for idx in 0..partitions {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            senders.push(tx);
            handles.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        error!(
                            coordinator = name,
                            partition = idx,
                            "job panicked — partition continues"
                        );
                    }
                }
                debug!(coordinator = name, partition = idx, "partition drained");
            }));
        }

        debug!(coordinator = name, partitions, "coordinator started");

        Self {
            name,
            senders: Mutex::new(senders),
            handles: Mutex::new(handles),
            partitions,
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub(crate) fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as usize
    }

    /// Submit a fire-and-forget job for `key`. All jobs for the same key
    /// execute in submission order.
    pub fn execute<F>(&self, key: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let idx = self.partition_for(key);
        let senders = self.senders.lock();
        match senders.get(idx) {
            Some(tx) if tx.send(Box::pin(fut)).is_ok() => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    coordinator = self.name,
                    key, "job rejected — coordinator is shut down"
                );
            }
        }
    }

    /// Submit a job that produces a value; the receiver resolves when the
    /// job has run. A dropped receiver is fine — the job still executes.
    pub fn execute_with_result<F, T>(&self, key: &str, fut: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(key, async move {
            let _ = tx.send(fut.await);
        });
        rx
    }

    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Stop accepting jobs, wait up to 30 s per partition for its queue to
    /// drain, then abort stragglers.
    pub async fn shutdown(&self) {
        // Dropping the senders closes every queue at its current tail.
        self.senders.lock().clear();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for (idx, mut handle) in handles.into_iter().enumerate() {
            if tokio::time::timeout(SHUTDOWN_DRAIN, &mut handle).await.is_err() {
                warn!(
                    coordinator = self.name,
                    partition = idx,
                    "partition did not drain in time — aborting"
                );
                handle.abort();
            }
        }

        debug!(coordinator = self.name, "coordinator shut down");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("name", &self.name)
            .field("partitions", &self.partitions)
            .field("submitted", &self.submitted.load(Ordering::Relaxed))
            .field("rejected", &self.rejected.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn partition_count_is_clamped() {
        let n = default_partition_count();
        assert!((8..=32).contains(&n));
    }

    #[tokio::test]
    async fn same_key_jobs_run_in_submission_order() {
        let coord = Coordinator::with_partitions("test", 4);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100u32 {
            let seen = seen.clone();
            coord.execute("trade-1", async move {
                seen.lock().push(i);
            });
        }

        // A result-bearing job behind the batch acts as a barrier for the key.
        let done = coord.execute_with_result("trade-1", async { true });
        assert!(done.await.unwrap());

        let order = seen.lock().clone();
        assert_eq!(order, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let coord = Coordinator::with_partitions("test", 8);

        // Find two keys on different partitions.
        let slow_key = "trade-slow".to_string();
        let mut fast_key = None;
        for i in 0..64 {
            let candidate = format!("trade-{i}");
            if coord.partition_for(&candidate) != coord.partition_for(&slow_key) {
                fast_key = Some(candidate);
                break;
            }
        }
        let fast_key = fast_key.expect("some key lands on another partition");

        let (slow_tx, slow_rx) = oneshot::channel::<()>();
        coord.execute(&slow_key, async move {
            // Parked until the fast job proves it ran concurrently.
            let _ = slow_rx.await;
        });

        let fast_done = coord.execute_with_result(&fast_key, async { 42 });
        let value = tokio::time::timeout(Duration::from_secs(1), fast_done)
            .await
            .expect("fast key must not be blocked by the slow key")
            .unwrap();
        assert_eq!(value, 42);

        let _ = slow_tx.send(());
    }

    #[tokio::test]
    async fn execute_with_result_returns_value() {
        let coord = Coordinator::with_partitions("test", 2);
        let rx = coord.execute_with_result("k", async { "done".to_string() });
        assert_eq!(rx.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_partition() {
        let coord = Coordinator::with_partitions("test", 1);
        coord.execute("k", async { panic!("boom") });
        let rx = coord.execute_with_result("k", async { 7 });
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_jobs() {
        let coord = Coordinator::with_partitions("test", 2);
        let seen = Arc::new(Mutex::new(0u32));

        for _ in 0..50 {
            let seen = seen.clone();
            coord.execute("k", async move {
                *seen.lock() += 1;
            });
        }

        coord.shutdown().await;
        assert_eq!(*seen.lock(), 50);

        // Post-shutdown submissions are rejected, not queued.
        coord.execute("k", async {});
        assert_eq!(*seen.lock(), 50);
    }
}
