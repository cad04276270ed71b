//! Worker pod rendering and inspection

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, Pod, PodReadinessGate, PodSpec, Probe,
    ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::{worker_name, CONTAINER_NAME, HOST_TUNED_CONDITION, HTTP_PORT, TRANSPORT_PORT};
use crate::crd::{ResourceAmounts, ResourceShape, TopologyGroup};
use crate::labels::{self, Role};
use crate::Error;

const INITIAL_MASTERS_ENV: &str = "cluster.initial_master_nodes";

/// Values shared by every worker of one cluster
pub(super) struct WorkerTemplate<'a> {
    pub cluster: &'a str,
    pub namespace: &'a str,
    pub image: &'a str,
    pub owner: &'a OwnerReference,
    pub seed_hosts: &'a str,
    pub initial_masters: &'a str,
    pub tune_host: bool,
}

impl WorkerTemplate<'_> {
    /// Render replica `replica` of the group keyed `group_key`
    pub fn render(
        &self,
        group_key: &str,
        group: &TopologyGroup,
        replica: u32,
    ) -> Result<Pod, Error> {
        let name = worker_name(self.cluster, group_key, replica);

        let mut labels = labels::role_labels(self.cluster, Role::Worker);
        labels.insert(labels::TOPOLOGY.to_string(), group_key.to_string());
        labels.insert(labels::REPLICA_INDEX.to_string(), replica.to_string());

        let spec = PodSpec {
            hostname: Some(name.clone()),
            subdomain: Some(self.seed_hosts.to_string()),
            restart_policy: Some("Always".to_string()),
            termination_grace_period_seconds: Some(120),
            readiness_gates: self.tune_host.then(|| {
                vec![PodReadinessGate {
                    condition_type: HOST_TUNED_CONDITION.to_string(),
                }]
            }),
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(self.image.to_string()),
                ports: Some(vec![
                    container_port("http", HTTP_PORT),
                    container_port("transport", TRANSPORT_PORT),
                ]),
                env: Some(self.env(&name, group)),
                readiness_probe: Some(readiness_probe()),
                resources: group.resources.as_ref().map(resource_requirements),
                ..Default::default()
            }],
            ..Default::default()
        };

        let fingerprint = fingerprint_of(&labels, &spec)?;

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace.to_string()),
                labels: Some(labels),
                annotations: Some(BTreeMap::from([(
                    labels::FINGERPRINT_ANNOTATION.to_string(),
                    fingerprint,
                )])),
                owner_references: Some(vec![self.owner.clone()]),
                ..Default::default()
            },
            spec: Some(spec),
            status: None,
        })
    }

    fn env(&self, node_name: &str, group: &TopologyGroup) -> Vec<EnvVar> {
        let flag = |b: bool| if b { "true" } else { "false" };
        [
            ("cluster.name", self.cluster),
            ("node.name", node_name),
            ("network.host", "0.0.0.0"),
            ("discovery.seed_hosts", self.seed_hosts),
            (INITIAL_MASTERS_ENV, self.initial_masters),
            ("node.master", flag(group.roles.master)),
            ("node.data", flag(group.roles.data)),
            ("node.ingest", flag(group.roles.ingest)),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        })
        .collect()
    }
}

/// Hash of everything that requires replacing the pod when it changes
///
/// Owner references are compared separately. The initial master list only
/// matters while the cluster bootstraps and changes on every scale, so it
/// is left out.
fn fingerprint_of(labels: &BTreeMap<String, String>, spec: &PodSpec) -> Result<String, Error> {
    let mut hashed = spec.clone();
    for container in &mut hashed.containers {
        if let Some(env) = container.env.as_mut() {
            env.retain(|e| e.name != INITIAL_MASTERS_ENV);
        }
    }
    Ok(labels::deterministic_hash(&serde_json::to_string(&(labels, &hashed))?))
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn readiness_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/_cluster/health?local=true".to_string()),
            port: IntOrString::Int(HTTP_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn resource_requirements(shape: &ResourceShape) -> ResourceRequirements {
    let quantities = |amounts: &Option<ResourceAmounts>| {
        amounts.as_ref().map(|a| {
            a.to_map()
                .into_iter()
                .map(|(k, v)| (k, Quantity(v)))
                .collect::<BTreeMap<_, _>>()
        })
    };
    ResourceRequirements {
        requests: quantities(&shape.requests),
        limits: quantities(&shape.limits),
        ..Default::default()
    }
}

/// Replica index carried by a worker's labels
pub fn replica_index(pod: &Pod) -> Option<u32> {
    pod.labels().get(labels::REPLICA_INDEX)?.parse().ok()
}

/// Fingerprint annotation of a worker
pub fn fingerprint(pod: &Pod) -> Option<&str> {
    pod.annotations()
        .get(labels::FINGERPRINT_ANNOTATION)
        .map(String::as_str)
}

/// Image of the search container
pub fn container_image(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == CONTAINER_NAME)?
        .image
        .as_deref()
}

/// Whether the pod reports condition `type_` as `True`
pub fn has_pod_condition(pod: &Pod, type_: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == type_ && c.status == "True"))
}

/// Whether the pod passes readiness
pub fn is_pod_ready(pod: &Pod) -> bool {
    has_pod_condition(pod, "Ready")
}

/// Whether an existing worker differs from its desired rendering
///
/// Pod specs are mostly immutable, so any difference means the worker has
/// to be replaced rather than patched.
pub fn worker_drifted(desired: &Pod, actual: &Pod) -> bool {
    fingerprint(desired) != fingerprint(actual)
        || container_image(desired) != container_image(actual)
        || !labels_subset(desired, actual)
        || !owned_by_same_controller(desired, actual)
}

fn labels_subset(desired: &Pod, actual: &Pod) -> bool {
    desired
        .labels()
        .iter()
        .all(|(k, v)| actual.labels().get(k) == Some(v))
}

pub(super) fn owned_by_same_controller(
    desired: &impl kube::Resource,
    actual: &impl kube::Resource,
) -> bool {
    let controller_uid = |r: &[OwnerReference]| {
        r.iter()
            .find(|o| o.controller == Some(true))
            .map(|o| o.uid.clone())
    };
    controller_uid(desired.owner_references()) == controller_uid(actual.owner_references())
}
