//! Reconciliation of SearchCluster resources
//!
//! One reconcile pass fetches a cluster, translates it into its desired
//! objects, diffs them against what the store holds and applies the
//! difference. Every pass is idempotent: running it against a converged
//! cluster performs no writes.
//!
//! The [`Context`] carries everything a pass needs (accessors, image
//! resolver, event publisher, settings) so the same [`Reconciler`] runs
//! against the API server or the in-memory store.

mod apply;
mod diff;
mod host_init;
mod reconciler;
mod status;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{Client, ResourceExt};
use tracing::{error, warn};

use crate::accessor::{Accessor, KubeAccessor, MemoryStore};
use crate::crd::SearchCluster;
use crate::desired::{ImageResolver, RegistryImageResolver};
use crate::events::{EventPublisher, KubeEventPublisher, LogOnlyPublisher};
use crate::retry::RetryConfig;
use crate::Error;

pub use apply::ApplyReport;
pub use diff::{compute_plan, Change, Manifest, Plan};
pub use host_init::{host_init_job_name, HostTuning, MAX_MAP_COUNT};
pub use reconciler::Reconciler;
pub use status::{summarize, READY_CONDITION};

/// Name reported on Kubernetes Events
pub const CONTROLLER_NAME: &str = "shoal-controller";

/// Identity of one cluster: the unit of reconciliation
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    /// Namespace of the SearchCluster
    pub namespace: String,
    /// Name of the SearchCluster
    pub name: String,
}

impl ClusterKey {
    /// Key for `namespace/name`
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&SearchCluster> for ClusterKey {
    fn from(cluster: &SearchCluster) -> Self {
        Self::new(
            cluster.namespace().unwrap_or_else(|| "default".to_string()),
            cluster.name_any(),
        )
    }
}

/// What a successful reconcile achieved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Actual state matches desired state and every worker is ready
    Converged,
    /// Writes were issued or the cluster is still settling
    Progressing,
    /// The cluster no longer exists or is being deleted
    Dropped,
}

impl Outcome {
    /// Queue action for a successful reconcile
    ///
    /// Converged and dropped clusters wait for the next change; the
    /// periodic resync still revisits them.
    pub fn action(self, config: &ReconcileConfig) -> Action {
        match self {
            Outcome::Progressing => Action::requeue(config.progress_interval),
            Outcome::Converged | Outcome::Dropped => Action::await_change(),
        }
    }
}

/// What the queue does with a key after its reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Run again after a fixed delay
    Requeue(Duration),
    /// Run again after the key's exponential backoff delay
    Backoff,
    /// Run again only when something changes
    AwaitChange,
}

impl Action {
    /// Requeue after `delay`
    pub fn requeue(delay: Duration) -> Self {
        Self::Requeue(delay)
    }

    /// Back off exponentially
    pub fn backoff() -> Self {
        Self::Backoff
    }

    /// Wait for the next change
    pub fn await_change() -> Self {
        Self::AwaitChange
    }
}

/// Settings for one reconcile pass
#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    /// In-pass retry of conflicting writes
    pub conflict_retry: RetryConfig,
    /// Requeue delay while a cluster is still settling
    pub progress_interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            conflict_retry: RetryConfig::conflict(crate::DEFAULT_CONFLICT_RETRIES),
            progress_interval: Duration::from_secs(crate::DEFAULT_PROGRESS_SECS),
        }
    }
}

/// Queue action for a failed reconcile
///
/// Transient failures back off; anything that needs a spec change (or an
/// operator) waits for the next change instead of hammering the store.
pub fn error_policy(key: &ClusterKey, error: &Error) -> Action {
    if error.is_retryable() {
        warn!(cluster = %key, error = %error, "reconcile failed, backing off");
        Action::backoff()
    } else {
        error!(cluster = %key, error = %error, "reconcile failed, waiting for a change");
        Action::await_change()
    }
}

/// Controller context shared by every reconcile
///
/// Use [`ContextBuilder`] to construct instances backed by the API server:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .images(Arc::new(RegistryImageResolver::new("registry.local/search")))
///     .build();
/// ```
pub struct Context {
    /// SearchCluster access
    pub clusters: Arc<dyn Accessor<SearchCluster>>,
    /// Worker pod access
    pub pods: Arc<dyn Accessor<Pod>>,
    /// Service access
    pub services: Arc<dyn Accessor<Service>>,
    /// Host-init job access
    pub jobs: Arc<dyn Accessor<Job>>,
    /// Image resolution for worker containers
    pub images: Arc<dyn ImageResolver>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Pass settings
    pub config: ReconcileConfig,
}

impl Context {
    /// Create a builder for a context backed by `client`
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Context backed by an in-memory store, with events only logged
    pub fn in_memory(store: &MemoryStore) -> Self {
        Self {
            clusters: store.accessor::<SearchCluster>(),
            pods: store.accessor::<Pod>(),
            services: store.accessor::<Service>(),
            jobs: store.accessor::<Job>(),
            images: Arc::new(RegistryImageResolver::default()),
            events: Arc::new(LogOnlyPublisher),
            config: ReconcileConfig::default(),
        }
    }

    /// Replace the pass settings
    pub fn with_config(mut self, config: ReconcileConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the event publisher
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }
}

/// Builder for constructing [`Context`] instances
///
/// Every accessor defaults to a [`KubeAccessor`] on the builder's client.
/// Overrides exist for tests that inject mocks.
pub struct ContextBuilder {
    client: Client,
    clusters: Option<Arc<dyn Accessor<SearchCluster>>>,
    pods: Option<Arc<dyn Accessor<Pod>>>,
    services: Option<Arc<dyn Accessor<Service>>>,
    jobs: Option<Arc<dyn Accessor<Job>>>,
    images: Option<Arc<dyn ImageResolver>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: ReconcileConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            clusters: None,
            pods: None,
            services: None,
            jobs: None,
            images: None,
            events: None,
            config: ReconcileConfig::default(),
        }
    }

    /// Override SearchCluster access
    pub fn clusters(mut self, clusters: Arc<dyn Accessor<SearchCluster>>) -> Self {
        self.clusters = Some(clusters);
        self
    }

    /// Override pod access
    pub fn pods(mut self, pods: Arc<dyn Accessor<Pod>>) -> Self {
        self.pods = Some(pods);
        self
    }

    /// Override service access
    pub fn services(mut self, services: Arc<dyn Accessor<Service>>) -> Self {
        self.services = Some(services);
        self
    }

    /// Override job access
    pub fn jobs(mut self, jobs: Arc<dyn Accessor<Job>>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Override image resolution
    pub fn images(mut self, images: Arc<dyn ImageResolver>) -> Self {
        self.images = Some(images);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set pass settings
    pub fn config(mut self, config: ReconcileConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let client = self.client;
        Context {
            clusters: self
                .clusters
                .unwrap_or_else(|| Arc::new(KubeAccessor::<SearchCluster>::new(client.clone()))),
            pods: self
                .pods
                .unwrap_or_else(|| Arc::new(KubeAccessor::<Pod>::new(client.clone()))),
            services: self
                .services
                .unwrap_or_else(|| Arc::new(KubeAccessor::<Service>::new(client.clone()))),
            jobs: self
                .jobs
                .unwrap_or_else(|| Arc::new(KubeAccessor::<Job>::new(client.clone()))),
            images: self
                .images
                .unwrap_or_else(|| Arc::new(RegistryImageResolver::default())),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME))
            }),
            config: self.config,
        }
    }
}
