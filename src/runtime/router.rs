//! Watch routing: store changes become reconcile requests
//!
//! Every change notification resolves to at most one cluster identity. The
//! cluster resource maps to itself; everything shoal creates maps to the
//! cluster named by its controller owner reference. The queue coalesces
//! the resulting adds, so a burst of pod events costs one reconcile.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, Stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::queue::{AddOutcome, WorkQueue};
use crate::controller::ClusterKey;
use crate::crd::SearchCluster;
use crate::labels::Selector;

/// Watch timeout; must stay below the API server's request timeout
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// A create, update or delete observed on the store
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    /// Kind of the changed object
    pub kind: String,
    /// Namespace of the changed object
    pub namespace: Option<String>,
    /// Name of the changed object
    pub name: String,
    /// Owner references of the changed object
    pub owner_references: Vec<OwnerReference>,
}

impl Notification {
    /// Notification describing `obj`
    pub fn of<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self {
            kind: K::kind(&()).to_string(),
            namespace: obj.namespace(),
            name: obj.name_any(),
            owner_references: obj.owner_references().to_vec(),
        }
    }
}

/// Turns notifications into queue adds
pub struct WatchRouter {
    queue: Arc<WorkQueue<ClusterKey>>,
}

impl WatchRouter {
    /// Router feeding `queue`
    pub fn new(queue: Arc<WorkQueue<ClusterKey>>) -> Self {
        Self { queue }
    }

    /// Cluster identity a notification belongs to, if any
    pub fn resolve(notification: &Notification) -> Option<ClusterKey> {
        let namespace = notification.namespace.clone()?;
        let cluster_kind = SearchCluster::kind(&());
        let cluster_api_version = SearchCluster::api_version(&());

        if notification.kind == cluster_kind {
            return Some(ClusterKey::new(namespace, &notification.name));
        }

        notification
            .owner_references
            .iter()
            .find(|o| {
                o.controller == Some(true)
                    && o.kind == cluster_kind
                    && o.api_version == cluster_api_version
            })
            .map(|owner| ClusterKey::new(namespace, &owner.name))
    }

    /// Route one notification; returns the key it resolved to
    pub fn route(&self, notification: &Notification) -> Option<(ClusterKey, AddOutcome)> {
        let Some(key) = Self::resolve(notification) else {
            trace!(
                kind = %notification.kind,
                name = %notification.name,
                "notification has no owning cluster"
            );
            return None;
        };
        let outcome = self.queue.add(key.clone());
        debug!(
            cluster = %key,
            kind = %notification.kind,
            name = %notification.name,
            ?outcome,
            "routed notification"
        );
        Some((key, outcome))
    }

    /// Route notifications until the stream ends or `shutdown` fires
    pub async fn run<S>(self, notifications: S, shutdown: CancellationToken)
    where
        S: Stream<Item = Notification> + Send,
    {
        tokio::pin!(notifications);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = notifications.next() => match next {
                    Some(n) => {
                        self.route(&n);
                    }
                    None => {
                        warn!("notification stream ended");
                        break;
                    }
                },
            }
        }
        info!("watch router stopped");
    }
}

/// Notifications for kind `K` from a kube watcher
///
/// `selector` narrows the watch to shoal's own objects for owned kinds.
/// Watch errors are logged and retried with the watcher's default backoff.
pub fn kube_notifications<K>(
    api: Api<K>,
    selector: Option<&Selector>,
) -> BoxStream<'static, Notification>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    let mut config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
    if let Some(selector) = selector {
        config = config.labels(&selector.to_string());
    }

    watcher(api, config)
        .default_backoff()
        .touched_objects()
        .filter_map(|event| async move {
            match event {
                Ok(obj) => Some(Notification::of(&obj)),
                Err(e) => {
                    warn!(kind = %K::kind(&()), error = %e, "watch error");
                    None
                }
            }
        })
        .boxed()
}

/// Enqueue every cluster in scope at a fixed interval
///
/// Picks up anything a dropped watch event or a full queue lost.
pub async fn periodic_resync<F, Fut>(
    queue: Arc<WorkQueue<ClusterKey>>,
    interval: Duration,
    shutdown: CancellationToken,
    mut list_clusters: F,
) where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = Result<Vec<ClusterKey>, crate::Error>> + Send,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match list_clusters().await {
                    Ok(keys) => {
                        debug!(clusters = keys.len(), "periodic resync");
                        for key in keys {
                            queue.add(key);
                        }
                    }
                    Err(e) => warn!(error = %e, "resync listing failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;

    fn owner(kind: &str, api_version: &str, name: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("{name}-uid"),
            controller: Some(controller),
            ..Default::default()
        }
    }

    fn notification(kind: &str, name: &str, owners: Vec<OwnerReference>) -> Notification {
        Notification {
            kind: kind.to_string(),
            namespace: Some("default".to_string()),
            name: name.to_string(),
            owner_references: owners,
        }
    }

    // =========================================================================
    // Routing Stories
    // =========================================================================

    /// Story: Editing the cluster itself reconciles that cluster
    #[test]
    fn story_cluster_changes_route_to_themselves() {
        let key = WatchRouter::resolve(&notification("SearchCluster", "foo", vec![])).unwrap();
        assert_eq!(key, ClusterKey::new("default", "foo"));
    }

    /// Story: Deleting a worker pod reconciles its owning cluster
    #[test]
    fn story_owned_objects_route_to_their_owner() {
        let n = notification(
            "Pod",
            "foo-es-0-1",
            vec![owner("SearchCluster", "shoal.dev/v1alpha1", "foo", true)],
        );
        assert_eq!(
            WatchRouter::resolve(&n),
            Some(ClusterKey::new("default", "foo"))
        );
    }

    #[test]
    fn foreign_owners_are_ignored() {
        let replicaset = notification(
            "Pod",
            "web-abc",
            vec![owner("ReplicaSet", "apps/v1", "web", true)],
        );
        assert_eq!(WatchRouter::resolve(&replicaset), None);

        let non_controller = notification(
            "Pod",
            "foo-es-0-1",
            vec![owner("SearchCluster", "shoal.dev/v1alpha1", "foo", false)],
        );
        assert_eq!(WatchRouter::resolve(&non_controller), None);

        let other_group = notification(
            "Pod",
            "foo-es-0-1",
            vec![owner("SearchCluster", "other.io/v1", "foo", true)],
        );
        assert_eq!(WatchRouter::resolve(&other_group), None);
    }

    #[test]
    fn cluster_scoped_notifications_are_ignored() {
        let mut n = notification("SearchCluster", "foo", vec![]);
        n.namespace = None;
        assert_eq!(WatchRouter::resolve(&n), None);
    }

    #[tokio::test]
    async fn router_issues_one_add_per_notification() {
        let queue = Arc::new(WorkQueue::new(16, RetryConfig::queue_backoff()));
        let router = WatchRouter::new(queue.clone());
        let owners = vec![owner("SearchCluster", "shoal.dev/v1alpha1", "foo", true)];

        let events = futures::stream::iter(vec![
            notification("Pod", "foo-es-0-1", owners.clone()),
            notification("Pod", "foo-es-0-2", owners.clone()),
            notification("Service", "foo-es-public", owners),
            notification("SearchCluster", "bar", vec![]),
        ]);
        router.run(events, CancellationToken::new()).await;

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await, Some(ClusterKey::new("default", "foo")));
        assert_eq!(queue.next().await, Some(ClusterKey::new("default", "bar")));
    }

    #[tokio::test(start_paused = true)]
    async fn resync_enqueues_listed_clusters_until_shutdown() {
        let queue = Arc::new(WorkQueue::new(16, RetryConfig::queue_backoff()));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(periodic_resync(
            queue.clone(),
            Duration::from_secs(60),
            shutdown.clone(),
            || async { Ok::<_, crate::Error>(vec![ClusterKey::new("default", "foo")]) },
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.len(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
