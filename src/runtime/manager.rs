//! Wires router, resync and worker pool together

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::pool::{Reconcile, ReconcileRecord, WorkerPool};
use super::queue::WorkQueue;
use super::router::{periodic_resync, Notification, WatchRouter};
use crate::accessor::{Accessor, ListScope};
use crate::controller::ClusterKey;
use crate::crd::SearchCluster;
use crate::labels::Selector;
use crate::retry::RetryConfig;

/// Runtime settings for the [`Manager`]
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Number of concurrent reconciles
    pub workers: usize,
    /// Maximum number of keys waiting in the queue
    pub queue_capacity: usize,
    /// Interval between full resyncs
    pub resync_interval: Duration,
    /// How long in-flight reconciles may run after shutdown is requested
    pub shutdown_timeout: Duration,
    /// Per-key backoff after failed reconciles
    pub backoff: RetryConfig,
    /// Namespaces the manager is responsible for
    pub scope: ListScope,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: crate::DEFAULT_WORKERS,
            queue_capacity: crate::DEFAULT_QUEUE_CAPACITY,
            resync_interval: Duration::from_secs(crate::DEFAULT_RESYNC_SECS),
            shutdown_timeout: Duration::from_secs(crate::DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            backoff: RetryConfig::queue_backoff(),
            scope: ListScope::All,
        }
    }
}

/// Runs the controller until shutdown
pub struct Manager {
    config: ManagerConfig,
    queue: Arc<WorkQueue<ClusterKey>>,
    reconciler: Arc<dyn Reconcile>,
    clusters: Arc<dyn Accessor<SearchCluster>>,
    observer: Option<mpsc::UnboundedSender<ReconcileRecord>>,
}

impl Manager {
    /// Manager running `reconciler` for the clusters visible through `clusters`
    pub fn new(
        config: ManagerConfig,
        reconciler: Arc<dyn Reconcile>,
        clusters: Arc<dyn Accessor<SearchCluster>>,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(
            config.queue_capacity,
            config.backoff.clone(),
        ));
        Self {
            config,
            queue,
            reconciler,
            clusters,
            observer: None,
        }
    }

    /// Report every finished reconcile on `observer`
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<ReconcileRecord>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The queue, for callers that want to enqueue directly
    pub fn queue(&self) -> Arc<WorkQueue<ClusterKey>> {
        self.queue.clone()
    }

    /// Run until `shutdown` fires, then drain
    ///
    /// Returns whether all in-flight reconciles finished within the
    /// shutdown timeout.
    pub async fn run(
        self,
        notifications: BoxStream<'static, Notification>,
        shutdown: CancellationToken,
    ) -> bool {
        info!(
            workers = self.config.workers,
            resync_secs = self.config.resync_interval.as_secs(),
            scope = ?self.config.scope,
            "starting manager"
        );

        let router = WatchRouter::new(self.queue.clone());
        let router_task = tokio::spawn(router.run(notifications, shutdown.child_token()));

        let clusters = self.clusters.clone();
        let scope = self.config.scope.clone();
        let resync_task = tokio::spawn(periodic_resync(
            self.queue.clone(),
            self.config.resync_interval,
            shutdown.child_token(),
            move || {
                let clusters = clusters.clone();
                let scope = scope.clone();
                async move {
                    let listed = clusters.list(&scope, &Selector::everything()).await?;
                    Ok::<_, crate::Error>(listed.iter().map(ClusterKey::from).collect())
                }
            },
        ));

        let pool = WorkerPool::spawn(
            self.config.workers,
            self.queue.clone(),
            self.reconciler.clone(),
            self.observer.clone(),
        );

        shutdown.cancelled().await;
        info!("shutdown requested, draining workers");

        let drained = pool.drain(self.config.shutdown_timeout).await;
        // Both exit on the cancelled token
        let _ = router_task.await;
        let _ = resync_task.await;

        info!(drained, "manager stopped");
        drained
    }
}
