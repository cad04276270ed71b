//! Desired-state translation
//!
//! [`translate`] turns a SearchCluster into the exact set of objects that
//! should exist for it: one worker pod per (group, replica) pair plus the
//! discovery and public services. It performs no I/O and is deterministic,
//! so the same cluster always renders byte-identical manifests and the
//! reconciler can diff them against what the store holds.

mod service;
mod worker;

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;

use crate::crd::{SearchCluster, SearchClusterSpec};
use crate::Error;

pub use service::{is_headless, service_drifted};
pub use worker::{
    container_image, fingerprint, has_pod_condition, is_pod_ready, replica_index, worker_drifted,
};

/// Port clients use
pub const HTTP_PORT: i32 = 9200;
/// Port nodes use to talk to each other
pub const TRANSPORT_PORT: i32 = 9300;
/// Name of the search container inside each worker
pub const CONTAINER_NAME: &str = "search";
/// Pod condition (and readiness gate) set once the host kernel is tuned
pub const HOST_TUNED_CONDITION: &str = "shoal.dev/host-tuned";
/// Registry used when no override is configured
pub const DEFAULT_REGISTRY: &str = "docker.elastic.co/elasticsearch/elasticsearch";

/// Name of the headless discovery service
pub fn discovery_service_name(cluster: &str) -> String {
    format!("{cluster}-es-discovery")
}

/// Name of the client-facing service
pub fn public_service_name(cluster: &str) -> String {
    format!("{cluster}-es-public")
}

/// Name of the worker for `replica` (1-based) of the group keyed `group`
pub fn worker_name(cluster: &str, group: &str, replica: u32) -> String {
    format!("{cluster}-es-{group}-{replica}")
}

/// Resolves the container image for a cluster spec
#[cfg_attr(test, automock)]
pub trait ImageResolver: Send + Sync {
    /// Image reference to run for `spec`
    fn resolve(&self, spec: &SearchClusterSpec) -> Result<String, Error>;
}

/// Resolves `{registry}:{version}` unless the spec pins an image
#[derive(Clone, Debug)]
pub struct RegistryImageResolver {
    registry: String,
}

impl RegistryImageResolver {
    /// Resolver pulling from `registry`
    pub fn new(registry: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
        }
    }
}

impl Default for RegistryImageResolver {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY)
    }
}

impl ImageResolver for RegistryImageResolver {
    fn resolve(&self, spec: &SearchClusterSpec) -> Result<String, Error> {
        Ok(match &spec.image {
            Some(image) => image.clone(),
            None => format!("{}:{}", self.registry, spec.version),
        })
    }
}

/// Everything that should exist for one cluster
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredSet {
    /// Worker pods keyed by name
    pub workers: BTreeMap<String, Pod>,
    /// Headless service nodes discover each other through
    pub discovery: Service,
    /// Service clients connect to
    pub public: Service,
}

impl DesiredSet {
    /// Both services, discovery first
    pub fn services(&self) -> [&Service; 2] {
        [&self.discovery, &self.public]
    }

    /// Number of desired workers
    pub fn node_count(&self) -> usize {
        self.workers.len()
    }
}

/// Translate a cluster into its desired objects
///
/// Fails with `Validation` for malformed specs and `Invariant` when two
/// groups would produce the same key or worker name. Nothing partial is
/// ever returned.
pub fn translate(cluster: &SearchCluster, images: &dyn ImageResolver) -> Result<DesiredSet, Error> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());

    cluster.spec.validate(&name)?;

    let owner = cluster
        .controller_owner_ref(&())
        .ok_or_else(|| Error::invariant(&name, "cluster has no uid and cannot own resources"))?;
    let image = images.resolve(&cluster.spec)?;

    let mut keys = BTreeSet::new();
    let mut groups = Vec::with_capacity(cluster.spec.topologies.len());
    for (index, group) in cluster.spec.topologies.iter().enumerate() {
        let key = group.key(index);
        if !keys.insert(key.clone()) {
            return Err(Error::invariant(
                &name,
                format!("topology group key '{key}' is used more than once"),
            ));
        }
        groups.push((key, group));
    }

    let initial_masters = groups
        .iter()
        .filter(|(_, g)| g.roles.master)
        .flat_map(|(key, g)| (1..=g.node_count.max(0) as u32).map(|r| worker_name(&name, key, r)))
        .collect::<Vec<_>>()
        .join(",");

    let discovery_name = discovery_service_name(&name);
    let template = worker::WorkerTemplate {
        cluster: &name,
        namespace: &namespace,
        image: &image,
        owner: &owner,
        seed_hosts: &discovery_name,
        initial_masters: &initial_masters,
        tune_host: cluster.spec.set_vm_max_map_count,
    };

    let mut workers = BTreeMap::new();
    for (key, group) in &groups {
        for replica in 1..=group.node_count.max(0) as u32 {
            let pod = template.render(key, group, replica)?;
            let pod_name = pod.name_any();
            if workers.insert(pod_name.clone(), pod).is_some() {
                return Err(Error::invariant(
                    &name,
                    format!("worker name '{pod_name}' is derived more than once"),
                ));
            }
        }
    }

    Ok(DesiredSet {
        workers,
        discovery: service::discovery(&name, &namespace, &owner),
        public: service::public(&name, &namespace, &owner),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::TopologyGroup;
    use crate::fixtures::sample_cluster;
    use crate::labels;

    fn resolve(cluster: &SearchCluster) -> Result<DesiredSet, Error> {
        translate(cluster, &RegistryImageResolver::default())
    }

    // =========================================================================
    // Translation Stories
    // =========================================================================

    /// Story: The canonical three node cluster
    ///
    /// foo on 7.0.0 with one unnamed group of three renders three workers
    /// and the two well-known services.
    #[test]
    fn story_three_node_cluster_renders_workers_and_services() {
        let desired = resolve(&sample_cluster("foo", &[3])).unwrap();

        let names: Vec<_> = desired.workers.keys().cloned().collect();
        assert_eq!(names, vec!["foo-es-0-1", "foo-es-0-2", "foo-es-0-3"]);
        assert_eq!(desired.discovery.name_any(), "foo-es-discovery");
        assert_eq!(desired.public.name_any(), "foo-es-public");
        assert!(is_headless(&desired.discovery));
        assert!(!is_headless(&desired.public));

        for pod in desired.workers.values() {
            assert_eq!(pod.namespace().as_deref(), Some("default"));
            assert_eq!(
                container_image(pod),
                Some("docker.elastic.co/elasticsearch/elasticsearch:7.0.0")
            );
            assert!(fingerprint(pod).is_some());
            let owner = &pod.owner_references()[0];
            assert_eq!(owner.kind, "SearchCluster");
            assert_eq!(owner.controller, Some(true));
        }
    }

    /// Story: Rendering twice yields identical manifests
    #[test]
    fn story_translation_is_deterministic() {
        let cluster = sample_cluster("foo", &[2, 3]);
        let a = serde_json::to_string(&resolve(&cluster).unwrap().workers).unwrap();
        let b = serde_json::to_string(&resolve(&cluster).unwrap().workers).unwrap();
        assert_eq!(a, b);
    }

    /// Story: Services select exactly the workers of their cluster
    #[test]
    fn story_services_target_workers() {
        let desired = resolve(&sample_cluster("foo", &[1])).unwrap();
        let worker = desired.workers.values().next().unwrap();
        for svc in desired.services() {
            let selector = svc.spec.as_ref().unwrap().selector.clone().unwrap();
            assert!(selector.iter().all(|(k, v)| worker.labels().get(k) == Some(v)));
        }
    }

    #[test]
    fn negative_count_is_a_validation_error() {
        let err = resolve(&sample_cluster("foo", &[3, -2])).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn overlapping_group_keys_are_rejected() {
        let mut cluster = sample_cluster("foo", &[1, 1]);
        // group 1 named "0" collides with the unnamed group at index 0
        cluster.spec.topologies[1].name = Some("0".into());
        let err = resolve(&cluster).unwrap_err();
        assert!(matches!(err, Error::Invariant { .. }), "{err}");
    }

    #[test]
    fn cluster_without_uid_cannot_own_resources() {
        let mut cluster = sample_cluster("foo", &[1]);
        cluster.metadata.uid = None;
        assert!(matches!(
            resolve(&cluster).unwrap_err(),
            Error::Invariant { .. }
        ));
    }

    #[test]
    fn named_groups_label_their_workers() {
        let mut cluster = sample_cluster("foo", &[0]);
        cluster.spec.topologies = vec![
            TopologyGroup {
                name: Some("master".into()),
                node_count: 1,
                ..Default::default()
            },
            TopologyGroup {
                name: Some("data".into()),
                node_count: 2,
                ..Default::default()
            },
        ];
        let desired = resolve(&cluster).unwrap();
        let pod = &desired.workers["foo-es-data-2"];
        assert_eq!(pod.labels()[labels::TOPOLOGY], "data");
        assert_eq!(replica_index(pod), Some(2));
        assert!(desired.workers.contains_key("foo-es-master-1"));
    }

    #[test]
    fn zero_nodes_still_renders_services() {
        let desired = resolve(&sample_cluster("foo", &[])).unwrap();
        assert_eq!(desired.node_count(), 0);
        assert_eq!(desired.public.name_any(), "foo-es-public");
    }

    #[test]
    fn image_override_bypasses_registry() {
        let mut cluster = sample_cluster("foo", &[1]);
        cluster.spec.image = Some("registry.local/search:7.0.0-patched".into());
        let desired = resolve(&cluster).unwrap();
        let pod = desired.workers.values().next().unwrap();
        assert_eq!(container_image(pod), Some("registry.local/search:7.0.0-patched"));
    }

    #[test]
    fn resolver_failures_propagate() {
        let mut images = MockImageResolver::new();
        images
            .expect_resolve()
            .returning(|_| Err(Error::unavailable("registry down")));
        let err = translate(&sample_cluster("foo", &[1]), &images).unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
    }

    #[test]
    fn version_change_changes_fingerprint() {
        let before = resolve(&sample_cluster("foo", &[1])).unwrap();
        let mut cluster = sample_cluster("foo", &[1]);
        cluster.spec.version = "7.1.0".into();
        let after = resolve(&cluster).unwrap();
        assert_ne!(
            fingerprint(&before.workers["foo-es-0-1"]),
            fingerprint(&after.workers["foo-es-0-1"])
        );
    }
}
