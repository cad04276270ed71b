//! The reconcile pass

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::apply::{apply_plan, ApplyReport};
use super::diff::compute_plan;
use super::host_init::ensure_host_tuning;
use super::{error_policy, status, Action, ClusterKey, Context, Outcome};
use crate::accessor::ListScope;
use crate::crd::{ClusterPhase, SearchCluster};
use crate::desired::translate;
use crate::events::ClusterEvent;
use crate::labels::{Role, Selector};
use crate::runtime::Reconcile;
use crate::Error;

/// Converges SearchClusters toward their spec
///
/// Each pass moves through fetching, diffing and applying. A pass that
/// finds its cluster gone or terminating ends as [`Outcome::Dropped`];
/// owned objects are left to the platform's garbage collector.
pub struct Reconciler {
    ctx: Arc<Context>,
}

impl Reconciler {
    /// Reconciler using `ctx` for every pass
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Shared context
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Run one pass for `key`
    #[instrument(skip(self), fields(cluster = %key))]
    pub async fn reconcile(&self, key: &ClusterKey) -> Result<Outcome, Error> {
        let cluster = match self.ctx.clusters.get(&key.namespace, &key.name).await {
            Ok(cluster) => cluster,
            Err(e) if e.is_not_found() => {
                debug!("cluster no longer exists");
                return Ok(Outcome::Dropped);
            }
            Err(e) => return Err(e),
        };
        if cluster.meta().deletion_timestamp.is_some() {
            debug!("cluster is being deleted");
            return Ok(Outcome::Dropped);
        }

        match self.converge(key, &cluster).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                self.record_failure(&cluster, &e).await;
                Err(e)
            }
        }
    }

    async fn converge(&self, key: &ClusterKey, cluster: &SearchCluster) -> Result<Outcome, Error> {
        let ctx = self.ctx.as_ref();
        let desired = translate(cluster, ctx.images.as_ref())?;
        let owner_uid = cluster
            .uid()
            .ok_or_else(|| Error::invariant(&key.name, "cluster has no uid"))?;

        let scope = ListScope::namespace(&key.namespace);
        let workers = self.list_workers(&scope, &key.name).await?;
        let services: Vec<Service> = ctx
            .services
            .list(&scope, &Selector::cluster(&key.name))
            .await?;

        let plan = compute_plan(&desired, &workers, &services, &owner_uid);
        debug!(changes = plan.changes.len(), blocked = plan.blocked.len(), "computed plan");
        let report = apply_plan(ctx, &key.namespace, plan).await?;
        self.announce(cluster, &report).await;

        let workers = if report.wrote() {
            self.list_workers(&scope, &key.name).await?
        } else {
            workers
        };

        let image = ctx.images.resolve(&cluster.spec)?;
        let tuning = ensure_host_tuning(ctx, cluster, &image, &workers).await?;

        let settling = report.is_settling() || tuning.is_pending();
        let next = status::summarize(cluster, &desired, &workers, settling);
        let became_ready = next.phase == ClusterPhase::Ready
            && cluster.status.as_ref().map(|s| s.phase) != Some(ClusterPhase::Ready);
        status::publish(ctx, cluster, &next).await?;

        if became_ready {
            info!(nodes = desired.node_count(), "cluster ready");
            let summary = next.message.clone();
            ctx.events.publish(cluster, ClusterEvent::Ready { summary }).await;
        }

        Ok(if next.phase == ClusterPhase::Ready {
            Outcome::Converged
        } else {
            Outcome::Progressing
        })
    }

    async fn list_workers(&self, scope: &ListScope, cluster: &str) -> Result<Vec<Pod>, Error> {
        self.ctx
            .pods
            .list(scope, &Selector::role(cluster, Role::Worker))
            .await
    }

    async fn announce(&self, cluster: &SearchCluster, report: &ApplyReport) {
        let events = [
            (!report.created.is_empty()).then(|| ClusterEvent::Created(report.created.clone())),
            (!report.updated.is_empty()).then(|| ClusterEvent::Updated(report.updated.clone())),
            (!report.deleted.is_empty()).then(|| ClusterEvent::Deleted(report.deleted.clone())),
        ];
        for event in events.into_iter().flatten() {
            self.ctx.events.publish(cluster, event).await;
        }
    }

    /// Record a non-transient failure on the cluster
    ///
    /// Status write failures are logged only; the original error is what
    /// the caller acts on.
    async fn record_failure(&self, cluster: &SearchCluster, error: &Error) {
        let next = status::failed(cluster, error);
        if let Err(e) = status::publish(&self.ctx, cluster, &next).await {
            warn!(error = %e, "failed to record failure on status");
        }

        self.ctx
            .events
            .publish(cluster, ClusterEvent::failure(error))
            .await;
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, key: &ClusterKey) -> Result<Outcome, Error> {
        Reconciler::reconcile(self, key).await
    }

    fn next_action(&self, key: &ClusterKey, result: &Result<Outcome, Error>) -> Action {
        match result {
            Ok(outcome) => outcome.action(&self.ctx.config),
            Err(e) => error_policy(key, e),
        }
    }
}
