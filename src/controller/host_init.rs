//! Host kernel tuning for worker nodes
//!
//! The search engine refuses to start in production mode unless
//! `vm.max_map_count` is at least 262144. When a cluster asks for it, every
//! node running one of its workers gets a privileged one-shot Job that sets
//! the value. Once the Job succeeds the workers on that node receive the
//! `shoal.dev/host-tuned` condition, which their readiness gate waits for.
//!
//! A failed Job is deleted and recreated by the next pass; the Job itself
//! retries up to its backoff limit. None of this takes part in the
//! desired/actual diff.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, Pod, PodCondition, PodSpec, PodTemplateSpec, SecurityContext, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use super::Context;
use crate::accessor::{ListScope, StatusPatch};
use crate::crd::SearchCluster;
use crate::desired::{has_pod_condition, HOST_TUNED_CONDITION};
use crate::events::ClusterEvent;
use crate::labels::{self, Role, Selector};
use crate::Error;

/// Value written to `vm.max_map_count`
pub const MAX_MAP_COUNT: u64 = 262_144;

/// Attempts the platform makes inside one Job
const JOB_BACKOFF_LIMIT: i32 = 3;

/// Name of the tuning Job for `node`
///
/// Node names can be long, so they are hashed to keep the Job name a
/// valid DNS label.
pub fn host_init_job_name(cluster: &str, node: &str) -> String {
    format!("{cluster}-es-sysctl-{}", labels::deterministic_hash(node))
}

/// Host tuning progress for one cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostTuning {
    /// The cluster does not ask for tuning
    Disabled,
    /// Every scheduled worker runs on a tuned node
    Settled,
    /// This many nodes are still being tuned
    Pending(usize),
}

impl HostTuning {
    /// Whether the pass should come back soon
    pub fn is_pending(&self) -> bool {
        matches!(self, HostTuning::Pending(_))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum JobState {
    Running,
    Succeeded,
    Failed,
}

fn job_state(job: &Job) -> JobState {
    let Some(status) = job.status.as_ref() else {
        return JobState::Running;
    };
    if status.succeeded.unwrap_or(0) > 0 {
        return JobState::Succeeded;
    }
    let failed_condition = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Failed" && c.status == "True");
    if failed_condition || status.failed.unwrap_or(0) > JOB_BACKOFF_LIMIT {
        JobState::Failed
    } else {
        JobState::Running
    }
}

fn render_job(
    cluster: &str,
    namespace: &str,
    node: &str,
    image: &str,
    owner: &OwnerReference,
) -> Job {
    let labels = labels::role_labels(cluster, Role::HostInit);
    Job {
        metadata: ObjectMeta {
            name: Some(host_init_job_name(cluster, node)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations: Some(BTreeMap::from([(
                labels::NODE_ANNOTATION.to_string(),
                node.to_string(),
            )])),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(JOB_BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_name: Some(node.to_string()),
                    restart_policy: Some("Never".to_string()),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    containers: vec![Container {
                        name: "sysctl".to_string(),
                        image: Some(image.to_string()),
                        command: Some(vec![
                            "sysctl".to_string(),
                            "-w".to_string(),
                            format!("vm.max_map_count={MAX_MAP_COUNT}"),
                        ]),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            run_as_user: Some(0),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn job_node(job: &Job) -> Option<&str> {
    job.annotations()
        .get(labels::NODE_ANNOTATION)
        .map(String::as_str)
}

/// Drive host tuning one step forward
///
/// `workers` are the cluster's live worker pods; `image` is the image the
/// workers run, which carries `sysctl`.
pub(super) async fn ensure_host_tuning(
    ctx: &Context,
    cluster: &SearchCluster,
    image: &str,
    workers: &[Pod],
) -> Result<HostTuning, Error> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let jobs = ctx
        .jobs
        .list(
            &ListScope::namespace(&namespace),
            &Selector::role(&name, Role::HostInit),
        )
        .await?;

    if !cluster.spec.set_vm_max_map_count {
        for job in jobs.iter().filter(|j| j.meta().deletion_timestamp.is_none()) {
            delete_job(ctx, &namespace, job).await?;
        }
        return Ok(HostTuning::Disabled);
    }

    let owner = cluster
        .controller_owner_ref(&())
        .ok_or_else(|| Error::invariant(&name, "cluster has no uid and cannot own resources"))?;

    let live_workers: Vec<&Pod> = workers
        .iter()
        .filter(|p| p.meta().deletion_timestamp.is_none())
        .collect();
    let occupied: BTreeSet<&str> = live_workers
        .iter()
        .filter_map(|p| p.spec.as_ref()?.node_name.as_deref())
        .collect();

    let mut untuned: BTreeMap<&str, Vec<&Pod>> = BTreeMap::new();
    for &pod in &live_workers {
        if has_pod_condition(pod, HOST_TUNED_CONDITION) {
            continue;
        }
        if let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
            untuned.entry(node).or_default().push(pod);
        }
    }

    let by_name: BTreeMap<String, &Job> = jobs.iter().map(|j| (j.name_any(), j)).collect();
    let mut pending = 0;

    for (node, pods) in &untuned {
        let job_name = host_init_job_name(&name, node);
        let Some(job) = by_name.get(&job_name) else {
            match ctx.jobs.create(&render_job(&name, &namespace, node, image, &owner)).await {
                Ok(_) => info!(node, job = %job_name, "started host tuning"),
                Err(e) if e.is_conflict() => {
                    debug!(node, job = %job_name, "tuning job already exists")
                }
                Err(e) => return Err(e),
            }
            pending += 1;
            continue;
        };

        if job.meta().deletion_timestamp.is_some() {
            pending += 1;
            continue;
        }

        match job_state(job) {
            JobState::Succeeded => {
                for pod in pods {
                    mark_tuned(ctx, &namespace, pod).await?;
                }
                debug!(node, workers = pods.len(), "host tuned");
            }
            JobState::Failed => {
                warn!(node, job = %job_name, "host tuning failed, retrying");
                delete_job(ctx, &namespace, job).await?;
                let node = node.to_string();
                ctx.events
                    .publish(cluster, ClusterEvent::HostTuningFailed { node })
                    .await;
                pending += 1;
            }
            JobState::Running => pending += 1,
        }
    }

    // Jobs for nodes that no longer host a worker
    for job in &jobs {
        let stale = job_node(job).is_some_and(|node| !occupied.contains(node));
        if stale && job.meta().deletion_timestamp.is_none() {
            delete_job(ctx, &namespace, job).await?;
        }
    }

    Ok(if pending == 0 {
        HostTuning::Settled
    } else {
        HostTuning::Pending(pending)
    })
}

async fn delete_job(ctx: &Context, namespace: &str, job: &Job) -> Result<(), Error> {
    match ctx
        .jobs
        .delete(namespace, &job.name_any(), job.resource_version())
        .await
    {
        Ok(()) => Ok(()),
        // Gone or changed since listing; the next pass sees the new state
        Err(e) if e.is_not_found() || e.is_conflict() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Record on the pod that its host is tuned
///
/// Only the HostTuned condition is sent. The strategic merge keys pod
/// conditions by type, so conditions the kubelet writes meanwhile survive.
async fn mark_tuned(ctx: &Context, namespace: &str, pod: &Pod) -> Result<(), Error> {
    let condition = PodCondition {
        type_: HOST_TUNED_CONDITION.to_string(),
        status: "True".to_string(),
        reason: Some("HostTuned".to_string()),
        message: Some(format!("vm.max_map_count set to {MAX_MAP_COUNT}")),
        last_transition_time: Some(Time(chrono::Utc::now())),
        ..Default::default()
    };

    let patch = StatusPatch::Strategic(json!({ "status": { "conditions": [condition] } }));
    match ctx.pods.patch_status(namespace, &pod.name_any(), &patch).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}
