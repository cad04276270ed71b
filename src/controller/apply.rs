//! Executes a [`Plan`] against the store
//!
//! Conflicting writes are retried within the pass against a freshly fetched
//! object. Everything else propagates to the caller, which leaves the rest
//! of the plan for the next pass.

use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use super::diff::{Change, Manifest, Plan};
use super::Context;
use crate::accessor::Accessor;
use crate::desired::{is_headless, service_drifted, worker_drifted};
use crate::retry::retry_with_backoff_if;
use crate::Error;

/// What one apply pass did
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplyReport {
    /// Objects created
    pub created: Vec<String>,
    /// Objects updated or replaced
    pub updated: Vec<String>,
    /// Objects deleted
    pub deleted: Vec<String>,
    /// Objects waiting on a terminating predecessor
    pub pending: Vec<String>,
}

impl ApplyReport {
    /// Whether any write happened
    pub fn wrote(&self) -> bool {
        !(self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty())
    }

    /// Whether the store is expected to change further without another write
    pub fn is_settling(&self) -> bool {
        self.wrote() || !self.pending.is_empty()
    }
}

/// Result of one step
enum Step {
    Done,
    Pending,
    Unchanged,
}

fn is_terminating(obj: &impl Resource) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

fn controller_of(obj: &impl Resource) -> Option<&OwnerReference> {
    obj.owner_references()
        .iter()
        .find(|o| o.controller == Some(true))
}

/// Who controls a live object that holds a desired name
#[derive(Debug, PartialEq)]
enum Holder {
    /// The cluster being reconciled
    Ours,
    /// An earlier cluster of the same name, waiting for garbage collection
    Predecessor,
    /// Anything else, including nobody
    Foreign,
}

fn holder(desired: &impl Resource, live: &impl Resource) -> Holder {
    match (controller_of(desired), controller_of(live)) {
        (Some(want), Some(have)) if want.uid == have.uid => Holder::Ours,
        (Some(want), Some(have)) if want.kind == have.kind && want.name == have.name => {
            Holder::Predecessor
        }
        _ => Holder::Foreign,
    }
}

/// Refuse to touch a live object some other party controls
///
/// A predecessor's objects are collected by the platform once it is gone,
/// so the name is waited for. Anyone else's object is never rewritten or
/// removed; the collision is an invariant failure recorded on the cluster.
fn guard_holder(
    desired: &impl Resource,
    live: &impl Resource,
    kind: &str,
) -> Result<Option<Step>, Error> {
    match holder(desired, live) {
        Holder::Ours => Ok(None),
        Holder::Predecessor => {
            debug!(kind, name = %live.name_any(), "name held by a previous cluster");
            Ok(Some(Step::Pending))
        }
        Holder::Foreign => {
            let cluster = controller_of(desired)
                .map(|o| o.name.clone())
                .unwrap_or_default();
            let name = live.name_any();
            Err(Error::invariant(
                cluster,
                format!("{kind} {name} already exists and is not controlled by this cluster"),
            ))
        }
    }
}

/// Apply `plan` in order
pub(super) async fn apply_plan(
    ctx: &Context,
    namespace: &str,
    plan: Plan,
) -> Result<ApplyReport, Error> {
    let mut report = ApplyReport {
        pending: plan.blocked,
        ..Default::default()
    };

    for change in plan.changes {
        let name = change.name();
        match change {
            Change::Create(manifest) => match create(ctx, namespace, &manifest).await? {
                Step::Done => report.created.push(name),
                Step::Pending => report.pending.push(name),
                Step::Unchanged => {}
            },
            Change::Update { desired, actual } => {
                let step = match (desired, actual) {
                    (Manifest::Service(want), Manifest::Service(have)) => {
                        update_service(ctx, namespace, &want, Some(have)).await?
                    }
                    (Manifest::Worker(want), Manifest::Worker(have)) => {
                        replace_worker(ctx, namespace, &want, Some(have)).await?
                    }
                    (desired, _) => {
                        let kind = desired.kind();
                        return Err(Error::internal_with_context(
                            "apply",
                            format!("update of {kind} {name} paired with a different kind"),
                        ));
                    }
                };
                match step {
                    Step::Done => report.updated.push(name),
                    Step::Pending => report.pending.push(name),
                    Step::Unchanged => {}
                }
            }
            Change::Delete(manifest) => {
                let deleted = match &manifest {
                    Manifest::Worker(pod) => delete_owned(ctx, ctx.pods.as_ref(), pod).await?,
                    Manifest::Service(svc) => delete_owned(ctx, ctx.services.as_ref(), svc).await?,
                };
                if deleted {
                    report.deleted.push(name);
                }
            }
        }
    }

    if report.wrote() {
        info!(
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            pending = report.pending.len(),
            "applied plan"
        );
    }
    Ok(report)
}

/// Create a desired object; a name collision falls through to an update of the live object
async fn create(ctx: &Context, namespace: &str, manifest: &Manifest) -> Result<Step, Error> {
    let result = match manifest {
        Manifest::Worker(pod) => ctx.pods.create(pod).await.map(|_| ()),
        Manifest::Service(svc) => ctx.services.create(svc).await.map(|_| ()),
    };
    match result {
        Ok(()) => {
            debug!(kind = manifest.kind(), name = %manifest.name(), "created");
            Ok(Step::Done)
        }
        Err(e) if e.is_conflict() => {
            debug!(
                kind = manifest.kind(),
                name = %manifest.name(),
                "already exists, updating instead"
            );
            match manifest {
                Manifest::Worker(pod) => replace_worker(ctx, namespace, pod, None).await,
                Manifest::Service(svc) => update_service(ctx, namespace, svc, None).await,
            }
        }
        Err(e) => Err(e),
    }
}

/// Bring a live service in line with `desired`
///
/// The live object is the base: allocated cluster IPs, foreign labels and
/// annotations survive. `seed` is the listed object; retries refetch.
async fn update_service(
    ctx: &Context,
    namespace: &str,
    desired: &Service,
    seed: Option<Service>,
) -> Result<Step, Error> {
    let name = desired.name_any();
    let mut seed = seed;

    retry_with_backoff_if(
        &ctx.config.conflict_retry,
        "update service",
        Error::is_conflict,
        || {
            let listed = seed.take();
            let name = name.as_str();
            async move {
                let live = match listed {
                    Some(svc) => svc,
                    None => match ctx.services.get(namespace, name).await {
                        Ok(svc) => svc,
                        // Gone since listing; recreate it
                        Err(e) if e.is_not_found() => {
                            ctx.services.create(desired).await?;
                            return Ok(Step::Done);
                        }
                        Err(e) => return Err(e),
                    },
                };

                if is_terminating(&live) {
                    return Ok(Step::Pending);
                }
                if let Some(step) = guard_holder(desired, &live, "Service")? {
                    return Ok(step);
                }
                if !service_drifted(desired, &live) {
                    return Ok(Step::Unchanged);
                }

                // clusterIP is immutable, so headless-ness can only change by recreation
                if is_headless(desired) != is_headless(&live) {
                    ctx.services
                        .delete(namespace, name, live.resource_version())
                        .await?;
                    ctx.services.create(desired).await?;
                    info!(service = name, "recreated service to change headless mode");
                    return Ok(Step::Done);
                }

                ctx.services.update(&merge_service(desired, live)).await?;
                debug!(service = name, "updated service");
                Ok(Step::Done)
            }
        },
    )
    .await
}

/// Overlay the fields shoal owns onto a live service it already controls
fn merge_service(desired: &Service, mut live: Service) -> Service {
    let mut labels = live.metadata.labels.take().unwrap_or_default();
    labels.extend(desired.labels().clone());
    live.metadata.labels = Some(labels);

    if let (Some(want), Some(have)) = (desired.spec.as_ref(), live.spec.as_mut()) {
        have.type_ = want.type_.clone();
        have.selector = want.selector.clone();
        have.ports = want.ports.clone();
        have.publish_not_ready_addresses = want.publish_not_ready_addresses;
    } else {
        live.spec = desired.spec.clone();
    }
    live
}

/// Replace a drifted worker by deleting and recreating it
///
/// Pod specs are largely immutable. The delete carries the observed
/// resourceVersion so a concurrently changed pod is re-examined instead of
/// removed. A pod that is still terminating reports [`Step::Pending`].
async fn replace_worker(
    ctx: &Context,
    namespace: &str,
    desired: &Pod,
    seed: Option<Pod>,
) -> Result<Step, Error> {
    let name = desired.name_any();
    let mut seed = seed;

    retry_with_backoff_if(
        &ctx.config.conflict_retry,
        "replace worker",
        Error::is_conflict,
        || {
            let listed = seed.take();
            let name = name.as_str();
            async move {
                let live = match listed {
                    Some(pod) => Some(pod),
                    None => match ctx.pods.get(namespace, name).await {
                        Ok(pod) => Some(pod),
                        Err(e) if e.is_not_found() => None,
                        Err(e) => return Err(e),
                    },
                };

                if let Some(live) = live {
                    if is_terminating(&live) {
                        return Ok(Step::Pending);
                    }
                    if let Some(step) = guard_holder(desired, &live, "Pod")? {
                        return Ok(step);
                    }
                    if !worker_drifted(desired, &live) {
                        return Ok(Step::Unchanged);
                    }
                    match ctx.pods.delete(namespace, name, live.resource_version()).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }

                match ctx.pods.create(desired).await {
                    Ok(_) => {
                        info!(worker = name, "replaced worker");
                        Ok(Step::Done)
                    }
                    // Old pod still shutting down; the next pass creates it
                    Err(e) if e.is_conflict() => Ok(Step::Pending),
                    Err(e) => Err(e),
                }
            }
        },
    )
    .await
}

/// Delete a surplus object if it is still the one that was listed, or still ours
///
/// Returns whether this call deleted it.
async fn delete_owned<K>(
    ctx: &Context,
    accessor: &dyn Accessor<K>,
    listed: &K,
) -> Result<bool, Error>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let name = listed.name_any();
    let namespace = listed.namespace().unwrap_or_else(|| "default".to_string());
    let owner_uid = controller_of(listed).map(|o| o.uid.clone());
    let mut seed = Some(listed.clone());

    retry_with_backoff_if(
        &ctx.config.conflict_retry,
        "delete surplus",
        Error::is_conflict,
        || {
            let listed = seed.take();
            let (name, namespace) = (name.as_str(), namespace.as_str());
            let owner_uid = owner_uid.as_deref();
            async move {
                let live = match listed {
                    Some(obj) => obj,
                    None => match accessor.get(namespace, name).await {
                        Ok(obj) => obj,
                        Err(e) if e.is_not_found() => return Ok(false),
                        Err(e) => return Err(e),
                    },
                };
                let still_ours = owner_uid.is_some()
                    && controller_of(&live).map(|o| o.uid.as_str()) == owner_uid;
                if !still_ours || is_terminating(&live) {
                    return Ok(false);
                }

                match accessor.delete(namespace, name, live.resource_version()).await {
                    Ok(()) => {
                        debug!(name, "deleted surplus object");
                        Ok(true)
                    }
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{FaultError, MemoryStore, Verb};
    use crate::controller::diff::compute_plan;
    use crate::desired::{translate, DesiredSet, RegistryImageResolver};
    use crate::fixtures::sample_cluster;
    use std::collections::BTreeMap;

    fn desired(counts: &[i32]) -> DesiredSet {
        translate(&sample_cluster("foo", counts), &RegistryImageResolver::default()).unwrap()
    }

    async fn seed(ctx: &Context, set: &DesiredSet) {
        ctx.services.create(&set.discovery).await.unwrap();
        ctx.services.create(&set.public).await.unwrap();
        for pod in set.workers.values() {
            ctx.pods.create(pod).await.unwrap();
        }
    }

    async fn live(ctx: &Context) -> (Vec<Pod>, Vec<Service>) {
        let scope = crate::accessor::ListScope::All;
        let all = crate::labels::Selector::cluster("foo");
        (
            ctx.pods.list(&scope, &all).await.unwrap(),
            ctx.services.list(&scope, &all).await.unwrap(),
        )
    }

    // =========================================================================
    // Apply Stories
    // =========================================================================

    /// Story: A fresh plan creates everything it lists
    #[tokio::test]
    async fn story_creates_land_in_the_store() {
        let store = MemoryStore::new();
        let ctx = Context::in_memory(&store);
        let set = desired(&[3]);

        let report = apply_plan(&ctx, "default", compute_plan(&set, &[], &[], "foo-uid"))
            .await
            .unwrap();
        assert_eq!(report.created.len(), 5);
        assert_eq!(store.count("Pod"), 3);
        assert_eq!(store.count("Service"), 2);
    }

    /// Story: Someone else edited the service between list and update
    ///
    /// The first update conflicts, the retry refetches and succeeds.
    #[tokio::test]
    async fn story_conflicting_service_update_is_retried_in_pass() {
        let store = MemoryStore::new();
        let ctx = Context::in_memory(&store);
        let set = desired(&[1]);
        seed(&ctx, &set).await;

        let (_, services) = live(&ctx).await;
        let mut broken = services
            .iter()
            .find(|s| s.name_any() == "foo-es-public")
            .cloned()
            .unwrap();
        broken.spec.as_mut().unwrap().selector = Some(BTreeMap::from([("app".into(), "x".into())]));
        let broken = ctx.services.update(&broken).await.unwrap();

        store.inject_fault("Service", Verb::Update, FaultError::Conflict);
        let step = update_service(&ctx, "default", &set.public, Some(broken)).await.unwrap();
        assert!(matches!(step, Step::Done));

        let fixed = ctx.services.get("default", "foo-es-public").await.unwrap();
        assert!(!service_drifted(&set.public, &fixed));
    }

    #[tokio::test]
    async fn service_updates_keep_allocated_ip_and_foreign_labels() {
        let store = MemoryStore::new();
        let ctx = Context::in_memory(&store);
        let set = desired(&[1]);

        let mut existing = set.public.clone();
        existing.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.7".into());
        existing.spec.as_mut().unwrap().ports = None;
        existing
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("team".into(), "search".into());
        ctx.services.create(&existing).await.unwrap();

        let step = update_service(&ctx, "default", &set.public, None).await.unwrap();
        assert!(matches!(step, Step::Done));

        let updated = ctx.services.get("default", "foo-es-public").await.unwrap();
        assert_eq!(updated.spec.as_ref().unwrap().cluster_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(updated.labels().get("team").map(String::as_str), Some("search"));
        assert!(!service_drifted(&set.public, &updated));
    }

    #[tokio::test]
    async fn drifted_worker_is_replaced() {
        let store = MemoryStore::new();
        let ctx = Context::in_memory(&store);
        seed(&ctx, &desired(&[1])).await;

        let mut cluster = sample_cluster("foo", &[1]);
        cluster.spec.version = "7.1.0".into();
        let upgraded = translate(&cluster, &RegistryImageResolver::default()).unwrap();
        let (pods, services) = live(&ctx).await;

        let plan = compute_plan(&upgraded, &pods, &services, "foo-uid");
        let report = apply_plan(&ctx, "default", plan).await.unwrap();
        assert_eq!(report.updated, vec!["foo-es-0-1".to_string()]);

        let pod = ctx.pods.get("default", "foo-es-0-1").await.unwrap();
        assert_eq!(
            crate::desired::container_image(&pod),
            Some("docker.elastic.co/elasticsearch/elasticsearch:7.1.0")
        );
    }

    #[tokio::test]
    async fn vanished_surplus_counts_as_deleted_by_someone_else() {
        let store = MemoryStore::new();
        let ctx = Context::in_memory(&store);
        seed(&ctx, &desired(&[2])).await;
        let (pods, services) = live(&ctx).await;

        // Somebody removes the surplus pod after we listed
        ctx.pods.delete("default", "foo-es-0-2", None).await.unwrap();

        let plan = compute_plan(&desired(&[1]), &pods, &services, "foo-uid");
        let report = apply_plan(&ctx, "default", plan).await.unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(store.count("Pod"), 1);
    }

    /// Story: A user already runs a pod under a name the cluster wants
    ///
    /// The pod carries neither shoal's labels nor an owner. Its name
    /// collides on create, and the pass fails instead of replacing it.
    #[tokio::test]
    async fn story_foreign_pod_with_a_worker_name_is_left_alone() {
        let store = MemoryStore::new();
        let ctx = Context::in_memory(&store);
        let set = desired(&[1]);

        let mut squatter = set.workers.values().next().cloned().unwrap();
        squatter.metadata.labels = None;
        squatter.metadata.owner_references = None;
        let squatter = ctx.pods.create(&squatter).await.unwrap();

        let err = apply_plan(&ctx, "default", compute_plan(&set, &[], &[], "foo-uid"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invariant { .. }), "{err}");
        assert!(err.to_string().contains("foo-es-0-1"));

        let after = ctx.pods.get("default", "foo-es-0-1").await.unwrap();
        assert_eq!(after.uid(), squatter.uid());
        assert!(after.owner_references().is_empty());
        assert_eq!(store.count("Pod"), 1);
    }

    #[tokio::test]
    async fn foreign_service_is_not_adopted() {
        let store = MemoryStore::new();
        let ctx = Context::in_memory(&store);
        let set = desired(&[1]);

        let mut theirs = set.public.clone();
        theirs.metadata.owner_references = None;
        let selector = BTreeMap::from([("app".to_string(), "web".to_string())]);
        theirs.spec.as_mut().unwrap().selector = Some(selector);
        let theirs = ctx.services.create(&theirs).await.unwrap();
        let writes = store.mutation_count();

        let err = update_service(&ctx, "default", &set.public, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Invariant { .. }), "{err}");
        assert_eq!(store.mutation_count(), writes);

        let after = ctx.services.get("default", "foo-es-public").await.unwrap();
        assert_eq!(after.uid(), theirs.uid());
        assert!(after.owner_references().is_empty());
        assert_eq!(after.spec.unwrap().selector, theirs.spec.unwrap().selector);
    }

    #[tokio::test]
    async fn worker_of_a_previous_cluster_waits_for_collection() {
        let store = MemoryStore::new();
        let ctx = Context::in_memory(&store);
        let set = desired(&[1]);

        let mut stale = set.workers.values().next().cloned().unwrap();
        stale.metadata.owner_references.as_mut().unwrap()[0].uid = "earlier-foo-uid".into();
        let stale = ctx.pods.create(&stale).await.unwrap();

        let (pods, services) = live(&ctx).await;
        let report = apply_plan(&ctx, "default", compute_plan(&set, &pods, &services, "foo-uid"))
            .await
            .unwrap();
        assert_eq!(report.pending, vec!["foo-es-0-1".to_string()]);
        assert!(report.updated.is_empty());

        let after = ctx.pods.get("default", "foo-es-0-1").await.unwrap();
        assert_eq!(after.uid(), stale.uid());
    }

    #[test]
    fn holders_are_told_apart_by_controller() {
        let set = desired(&[1]);
        let ours = set.public.clone();

        let mut earlier = ours.clone();
        earlier.metadata.owner_references.as_mut().unwrap()[0].uid = "earlier-foo-uid".into();
        let mut other_kind = earlier.clone();
        other_kind.metadata.owner_references.as_mut().unwrap()[0].kind = "Deployment".into();
        let mut unowned = ours.clone();
        unowned.metadata.owner_references = None;

        assert_eq!(holder(&set.public, &ours), Holder::Ours);
        assert_eq!(holder(&set.public, &earlier), Holder::Predecessor);
        assert_eq!(holder(&set.public, &other_kind), Holder::Foreign);
        assert_eq!(holder(&set.public, &unowned), Holder::Foreign);
    }

    #[tokio::test]
    async fn outages_propagate() {
        let store = MemoryStore::new();
        let ctx = Context::in_memory(&store);
        store.inject_fault("Service", Verb::Create, FaultError::Unavailable);

        let err = apply_plan(&ctx, "default", compute_plan(&desired(&[1]), &[], &[], "foo-uid"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.count("Service"), 0);
    }
}
