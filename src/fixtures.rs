//! Shared fixtures for unit tests

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::{SearchCluster, SearchClusterSpec, TopologyGroup};

/// A SearchCluster in `default` with one unnamed group per entry of `counts`
pub(crate) fn sample_cluster(name: &str, counts: &[i32]) -> SearchCluster {
    SearchCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("{name}-uid")),
            generation: Some(1),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: SearchClusterSpec {
            version: "7.0.0".to_string(),
            set_vm_max_map_count: false,
            image: None,
            topologies: counts
                .iter()
                .map(|&n| TopologyGroup {
                    node_count: n,
                    ..Default::default()
                })
                .collect(),
        },
        status: None,
    }
}
