//! Kubernetes Events shoal records on SearchClusters.
//!
//! Every event the controller emits is a [`ClusterEvent`] variant, which
//! fixes its reason, action and severity in one place. Publishers only
//! decide where the event goes. They are fire-and-forget: a failed publish
//! is logged and never breaks reconciliation.

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::{debug, warn};

use crate::crd::SearchCluster;
use crate::Error;

/// Something the owner of a SearchCluster should see in `kubectl describe`
#[derive(Clone, Debug, PartialEq)]
pub enum ClusterEvent {
    /// Every desired worker is running and ready
    Ready {
        /// Optional human-readable summary
        summary: Option<String>,
    },
    /// Missing workers or services were created
    Created(Vec<String>),
    /// Drifted workers or services were updated or replaced
    Updated(Vec<String>),
    /// Surplus workers or services were deleted
    Deleted(Vec<String>),
    /// The tuning job for `node` failed and was removed
    HostTuningFailed {
        /// Node whose tuning job failed
        node: String,
    },
    /// The spec cannot be rendered
    InvalidSpec(String),
    /// Rendered objects collide, with each other or with objects shoal does not control
    InvariantViolated(String),
    /// A pass failed in a way retrying will not fix
    ReconcileFailed(String),
}

impl ClusterEvent {
    /// The Warning event for a failed pass
    pub fn failure(error: &Error) -> Self {
        let message = error.to_string();
        match error {
            Error::Validation { .. } => Self::InvalidSpec(message),
            Error::Invariant { .. } => Self::InvariantViolated(message),
            _ => Self::ReconcileFailed(message),
        }
    }

    /// REASON column of `kubectl get events`
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ClusterReady",
            Self::Created(_) => "ResourcesCreated",
            Self::Updated(_) => "ResourcesUpdated",
            Self::Deleted(_) => "ResourcesDeleted",
            Self::HostTuningFailed { .. } => "HostTuningFailed",
            Self::InvalidSpec(_) => "ValidationFailed",
            Self::InvariantViolated(_) => "InvariantViolated",
            Self::ReconcileFailed(_) => "ReconcileFailed",
        }
    }

    /// ACTION column of `kubectl get events`
    pub fn action(&self) -> &'static str {
        match self {
            Self::Created(_) | Self::Updated(_) => "Apply",
            Self::Deleted(_) => "Delete",
            Self::HostTuningFailed { .. } => "TuneHost",
            _ => "Reconcile",
        }
    }

    /// Whether this is a Warning event
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::HostTuningFailed { .. }
                | Self::InvalidSpec(_)
                | Self::InvariantViolated(_)
                | Self::ReconcileFailed(_)
        )
    }

    /// NOTE of the event, if any
    pub fn note(&self) -> Option<String> {
        match self {
            Self::Ready { summary } => summary.clone(),
            Self::Created(names) => Some(format!("Created {}", names.join(", "))),
            Self::Updated(names) => Some(format!("Updated {}", names.join(", "))),
            Self::Deleted(names) => Some(format!("Deleted {}", names.join(", "))),
            Self::HostTuningFailed { node } => Some(format!(
                "Setting vm.max_map_count on node {node} failed; retrying"
            )),
            Self::InvalidSpec(message)
            | Self::InvariantViolated(message)
            | Self::ReconcileFailed(message) => Some(message.clone()),
        }
    }

    fn to_event(&self) -> Event {
        Event {
            type_: if self.is_warning() {
                EventType::Warning
            } else {
                EventType::Normal
            },
            reason: self.reason().to_string(),
            note: self.note(),
            action: self.action().to_string(),
            secondary: None,
        }
    }
}

/// Where cluster events go
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Attach `event` to `cluster`
    async fn publish(&self, cluster: &SearchCluster, event: ClusterEvent);
}

/// Publisher backed by the Events API
///
/// Events are reported by `controller`; the replica is named by the
/// `POD_NAME` environment variable when the downward API provides it.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Publisher reporting as `controller`
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, cluster: &SearchCluster, event: ClusterEvent) {
        let reference = cluster.object_ref(&());
        if let Err(e) = self.recorder.publish(&event.to_event(), &reference).await {
            warn!(reason = event.reason(), error = %e, "failed to publish event");
        }
    }
}

/// Publisher that only logs; the default for in-memory contexts
pub struct LogOnlyPublisher;

#[async_trait]
impl EventPublisher for LogOnlyPublisher {
    async fn publish(&self, cluster: &SearchCluster, event: ClusterEvent) {
        debug!(
            cluster = cluster.metadata.name.as_deref().unwrap_or_default(),
            reason = event.reason(),
            "event"
        );
    }
}
