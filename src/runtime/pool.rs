//! Fixed-size worker pool draining the work queue

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::WorkQueue;
use crate::controller::{Action, ClusterKey, Outcome};
use crate::Error;

/// What a worker runs for each key
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Converge one cluster
    async fn reconcile(&self, key: &ClusterKey) -> Result<Outcome, Error>;

    /// How the queue should treat `key` after `result`
    fn next_action(&self, key: &ClusterKey, result: &Result<Outcome, Error>) -> Action;
}

/// One finished reconcile, as seen by an observer
#[derive(Clone, Debug)]
pub struct ReconcileRecord {
    /// Cluster that was reconciled
    pub key: ClusterKey,
    /// Outcome, or the rendered error
    pub result: Result<Outcome, String>,
    /// What the queue was told to do next
    pub action: Action,
    /// Wall time spent
    pub elapsed: Duration,
}

/// Handles of running workers
pub struct WorkerPool {
    queue: Arc<WorkQueue<ClusterKey>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` tasks pulling from `queue`
    ///
    /// When `observer` is set, every finished reconcile is reported on it.
    pub fn spawn(
        workers: usize,
        queue: Arc<WorkQueue<ClusterKey>>,
        reconciler: Arc<dyn Reconcile>,
        observer: Option<mpsc::UnboundedSender<ReconcileRecord>>,
    ) -> Self {
        let handles = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(work(
                    id,
                    queue.clone(),
                    reconciler.clone(),
                    observer.clone(),
                ))
            })
            .collect();
        info!(workers = workers.max(1), "worker pool started");
        Self { queue, handles }
    }

    /// Stop pulling work and wait up to `timeout` for in-flight reconciles
    ///
    /// Returns false if workers had to be aborted.
    pub async fn drain(self, timeout: Duration) -> bool {
        self.queue.shutdown();
        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(timeout, futures::future::join_all(self.handles)).await {
            Ok(_) => {
                info!("worker pool drained");
                true
            }
            Err(_) => {
                warn!(
                    in_flight = self.queue.in_flight(),
                    timeout_secs = timeout.as_secs(),
                    "drain timed out, abandoning in-flight reconciles"
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

async fn work(
    id: usize,
    queue: Arc<WorkQueue<ClusterKey>>,
    reconciler: Arc<dyn Reconcile>,
    observer: Option<mpsc::UnboundedSender<ReconcileRecord>>,
) {
    while let Some(key) = queue.next().await {
        let started = Instant::now();
        // The call itself sits inside the future so synchronous panics are caught too
        let result = match AssertUnwindSafe(async { reconciler.reconcile(&key).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(worker = id, cluster = %key, panic = %message, "reconcile panicked");
                Err(Error::internal_with_context(
                    "reconcile",
                    format!("panicked: {message}"),
                ))
            }
        };

        let action = reconciler.next_action(&key, &result);
        match action {
            Action::Requeue(delay) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            Action::Backoff => queue.add_rate_limited(key.clone()),
            Action::AwaitChange => queue.forget(&key),
        }

        let elapsed = started.elapsed();
        debug!(
            worker = id,
            cluster = %key,
            ?action,
            elapsed_ms = elapsed.as_millis(),
            "reconcile finished"
        );

        if let Some(observer) = &observer {
            // Observer gone just means nobody is listening anymore
            let _ = observer.send(ReconcileRecord {
                key: key.clone(),
                result: result.as_ref().map(|o| *o).map_err(|e| e.to_string()),
                action,
                elapsed,
            });
        }

        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue() -> Arc<WorkQueue<ClusterKey>> {
        Arc::new(WorkQueue::new(64, RetryConfig::queue_backoff()))
    }

    fn foo() -> ClusterKey {
        ClusterKey::new("default", "foo")
    }

    /// Reconciler that records how many calls overlap
    #[derive(Default)]
    struct Overlap {
        running: AtomicUsize,
        max_running: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reconcile for Overlap {
        async fn reconcile(&self, _key: &ClusterKey) -> Result<Outcome, Error> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Outcome::Converged)
        }

        fn next_action(&self, _key: &ClusterKey, _result: &Result<Outcome, Error>) -> Action {
            Action::await_change()
        }
    }

    // =========================================================================
    // Worker Pool Stories
    // =========================================================================

    /// Story: Many workers, one hot cluster, never two reconciles at once
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn story_one_key_is_never_reconciled_concurrently() {
        let q = queue();
        let reconciler = Arc::new(Overlap::default());
        let pool = WorkerPool::spawn(4, q.clone(), reconciler.clone(), None);

        for _ in 0..20 {
            q.add(foo());
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        // let the trailing deferred run finish
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(reconciler.max_running.load(Ordering::SeqCst), 1);
        let calls = reconciler.calls.load(Ordering::SeqCst);
        assert!(calls >= 2 && calls < 20, "bursts should coalesce, got {calls}");
        assert!(pool.drain(Duration::from_secs(1)).await);
    }

    /// Story: A panicking reconcile does not take the controller down
    #[tokio::test]
    async fn story_panics_are_contained_and_backed_off() {
        let q = queue();
        let mut mock = MockReconcile::new();
        mock.expect_reconcile()
            .times(1)
            .returning(|_| panic!("corrupt cluster state"));
        mock.expect_next_action()
            .withf(|_, result| result.as_ref().is_err_and(|e| e.is_retryable()))
            .returning(|_, _| Action::backoff());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(1, q.clone(), Arc::new(mock), Some(tx));
        q.add(foo());

        let record = rx.recv().await.unwrap();
        assert!(record.result.unwrap_err().contains("corrupt cluster state"));
        assert_eq!(record.action, Action::Backoff);
        assert_eq!(q.failures(&foo()), 1);

        assert!(pool.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn successful_requeue_resets_failures() {
        let q = queue();
        let mut mock = MockReconcile::new();
        mock.expect_reconcile()
            .returning(|_| Ok(Outcome::Progressing));
        mock.expect_next_action()
            .returning(|_, _| Action::requeue(Duration::from_secs(3600)));

        q.add_rate_limited(foo());
        q.add(foo());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(1, q.clone(), Arc::new(mock), Some(tx));

        let record = rx.recv().await.unwrap();
        assert_eq!(record.result, Ok(Outcome::Progressing));
        assert_eq!(q.failures(&foo()), 0);
        assert!(pool.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn drain_abandons_stuck_reconciles() {
        struct Stuck;

        #[async_trait]
        impl Reconcile for Stuck {
            async fn reconcile(&self, _key: &ClusterKey) -> Result<Outcome, Error> {
                futures::future::pending::<()>().await;
                Ok(Outcome::Converged)
            }

            fn next_action(&self, _: &ClusterKey, _: &Result<Outcome, Error>) -> Action {
                Action::await_change()
            }
        }

        let q = queue();
        let pool = WorkerPool::spawn(2, q.clone(), Arc::new(Stuck), None);
        q.add(foo());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.in_flight(), 1);

        assert!(!pool.drain(Duration::from_millis(50)).await);
    }
}
