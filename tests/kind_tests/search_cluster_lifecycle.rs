//! Integration tests for the SearchCluster lifecycle
//!
//! These tests tell the story of a user declaring a search cluster and the
//! controller building, repairing, resizing and tearing down the objects
//! that realize it on a real Kubernetes cluster.

use std::collections::BTreeSet;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;

use shoal::crd::{SearchCluster, SearchClusterSpec, TopologyGroup};
use shoal::labels::{self, Role, Selector};

use super::helpers::{
    cleanup_cluster, ensure_namespace, ensure_test_cluster, start_controller, wait_for,
};

const NAMESPACE: &str = "shoal-kind-test";
const CONVERGE_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Test Fixtures
// =============================================================================

/// A 7.0.0 cluster with a single unnamed group of `nodes` workers
fn sample_cluster(name: &str, nodes: i32) -> SearchCluster {
    SearchCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: SearchClusterSpec {
            version: "7.0.0".to_string(),
            set_vm_max_map_count: false,
            image: None,
            topologies: vec![TopologyGroup {
                node_count: nodes,
                ..Default::default()
            }],
        },
        status: None,
    }
}

async fn worker_names(client: &Client, cluster: &str) -> BTreeSet<String> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), NAMESPACE);
    let selector = Selector::role(cluster, Role::Worker).to_string();
    pods.list(&ListParams::default().labels(&selector))
        .await
        .map(|list| {
            list.items
                .iter()
                .filter(|p| p.metadata.deletion_timestamp.is_none())
                .map(|p| p.name_any())
                .collect()
        })
        .unwrap_or_default()
}

async fn service_exists(client: &Client, name: &str) -> bool {
    let services: Api<Service> = Api::namespaced(client.clone(), NAMESPACE);
    matches!(services.get_opt(name).await, Ok(Some(s)) if s.metadata.deletion_timestamp.is_none())
}

fn names(expected: &[&str]) -> BTreeSet<String> {
    expected.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Lifecycle Stories
// =============================================================================

/// Story: A user declares a three node search cluster named foo
///
/// Expected behavior:
/// - Three worker pods appear, labelled with the cluster name and role
/// - The headless discovery service and the public service appear
/// - Both services select exactly the cluster's workers
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_user_creates_three_node_cluster() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, NAMESPACE)
        .await
        .expect("failed to create namespace");
    let name = "foo";
    cleanup_cluster(&client, NAMESPACE, name).await;
    let controller = start_controller(&client, NAMESPACE);

    // Act: The user creates the SearchCluster
    let api: Api<SearchCluster> = Api::namespaced(client.clone(), NAMESPACE);
    api.create(&PostParams::default(), &sample_cluster(name, 3))
        .await
        .expect("failed to create SearchCluster");

    // Assert: Three workers with the expected names
    let expected = names(&["foo-es-0-1", "foo-es-0-2", "foo-es-0-3"]);
    wait_for("three workers", CONVERGE_TIMEOUT, || {
        let client = client.clone();
        let expected = expected.clone();
        async move { worker_names(&client, name).await == expected }
    })
    .await
    .expect("workers were not created");

    let pods: Api<Pod> = Api::namespaced(client.clone(), NAMESPACE);
    let pod = pods.get("foo-es-0-1").await.expect("worker missing");
    let pod_labels = pod.labels();
    assert_eq!(pod_labels.get(labels::CLUSTER).map(String::as_str), Some(name));
    assert_eq!(pod_labels.get(labels::ROLE).map(String::as_str), Some("worker"));

    // Assert: Both services exist and discovery is headless
    wait_for("services", CONVERGE_TIMEOUT, || {
        let client = client.clone();
        async move {
            service_exists(&client, "foo-es-discovery").await
                && service_exists(&client, "foo-es-public").await
        }
    })
    .await
    .expect("services were not created");

    let services: Api<Service> = Api::namespaced(client.clone(), NAMESPACE);
    let discovery = services.get("foo-es-discovery").await.unwrap();
    let spec = discovery.spec.unwrap();
    assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
    let selector = spec.selector.unwrap_or_default();
    assert_eq!(selector.get(labels::CLUSTER).map(String::as_str), Some(name));

    controller.cancel();
    cleanup_cluster(&client, NAMESPACE, name).await;
}

/// Story: Someone deletes a worker pod and the public service by hand
///
/// The controller notices through its watches and recreates both.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_deleted_pod_and_service_are_recreated() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, NAMESPACE)
        .await
        .expect("failed to create namespace");
    let name = "heal";
    cleanup_cluster(&client, NAMESPACE, name).await;
    let controller = start_controller(&client, NAMESPACE);

    let api: Api<SearchCluster> = Api::namespaced(client.clone(), NAMESPACE);
    api.create(&PostParams::default(), &sample_cluster(name, 3))
        .await
        .expect("failed to create SearchCluster");

    let expected = names(&["heal-es-0-1", "heal-es-0-2", "heal-es-0-3"]);
    wait_for("three workers", CONVERGE_TIMEOUT, || {
        let client = client.clone();
        let expected = expected.clone();
        async move { worker_names(&client, name).await == expected }
    })
    .await
    .expect("workers were not created");

    // Act: Delete a worker and the public service
    let pods: Api<Pod> = Api::namespaced(client.clone(), NAMESPACE);
    let original_uid = pods.get("heal-es-0-2").await.unwrap().uid();
    pods.delete("heal-es-0-2", &DeleteParams::default().grace_period(0))
        .await
        .expect("failed to delete pod");
    let services: Api<Service> = Api::namespaced(client.clone(), NAMESPACE);
    services
        .delete("heal-es-public", &DeleteParams::default())
        .await
        .expect("failed to delete service");

    // Assert: Both come back, the pod as a new object
    wait_for("worker to be recreated", CONVERGE_TIMEOUT, || {
        let pods = pods.clone();
        let original_uid = original_uid.clone();
        async move {
            match pods.get_opt("heal-es-0-2").await {
                Ok(Some(pod)) => {
                    pod.uid() != original_uid && pod.metadata.deletion_timestamp.is_none()
                }
                _ => false,
            }
        }
    })
    .await
    .expect("worker was not recreated");

    wait_for("public service to be recreated", CONVERGE_TIMEOUT, || {
        let client = client.clone();
        async move { service_exists(&client, "heal-es-public").await }
    })
    .await
    .expect("service was not recreated");

    controller.cancel();
    cleanup_cluster(&client, NAMESPACE, name).await;
}

/// Story: A user scales a cluster from five nodes down to three
///
/// Replicas four and five are removed; the first three stay put.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_user_scales_cluster_down() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, NAMESPACE)
        .await
        .expect("failed to create namespace");
    let name = "scale";
    cleanup_cluster(&client, NAMESPACE, name).await;
    let controller = start_controller(&client, NAMESPACE);

    let api: Api<SearchCluster> = Api::namespaced(client.clone(), NAMESPACE);
    api.create(&PostParams::default(), &sample_cluster(name, 5))
        .await
        .expect("failed to create SearchCluster");

    wait_for("five workers", CONVERGE_TIMEOUT, || {
        let client = client.clone();
        async move { worker_names(&client, name).await.len() == 5 }
    })
    .await
    .expect("workers were not created");

    let pods: Api<Pod> = Api::namespaced(client.clone(), NAMESPACE);
    let first_uid = pods.get("scale-es-0-1").await.unwrap().uid();

    // Act: Scale down to three
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({ "spec": { "topologies": [{ "nodeCount": 3 }] } })),
    )
    .await
    .expect("failed to scale SearchCluster");

    // Assert: Only the lowest three replicas remain, untouched
    let expected = names(&["scale-es-0-1", "scale-es-0-2", "scale-es-0-3"]);
    wait_for("scale down to three", CONVERGE_TIMEOUT, || {
        let client = client.clone();
        let expected = expected.clone();
        async move { worker_names(&client, name).await == expected }
    })
    .await
    .expect("cluster did not scale down");
    assert_eq!(pods.get("scale-es-0-1").await.unwrap().uid(), first_uid);

    controller.cancel();
    cleanup_cluster(&client, NAMESPACE, name).await;
}

/// Story: Deleting the SearchCluster removes everything it owned
///
/// Owner references let the platform's garbage collector clean up.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_user_deletes_cluster() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, NAMESPACE)
        .await
        .expect("failed to create namespace");
    let name = "gone";
    cleanup_cluster(&client, NAMESPACE, name).await;
    let controller = start_controller(&client, NAMESPACE);

    let api: Api<SearchCluster> = Api::namespaced(client.clone(), NAMESPACE);
    api.create(&PostParams::default(), &sample_cluster(name, 2))
        .await
        .expect("failed to create SearchCluster");
    wait_for("two workers", CONVERGE_TIMEOUT, || {
        let client = client.clone();
        async move { worker_names(&client, name).await.len() == 2 }
    })
    .await
    .expect("workers were not created");

    // Act
    api.delete(name, &DeleteParams::foreground())
        .await
        .expect("failed to delete SearchCluster");

    // Assert: Workers and services are collected
    wait_for("owned objects to be collected", CONVERGE_TIMEOUT, || {
        let client = client.clone();
        async move {
            worker_names(&client, name).await.is_empty()
                && !service_exists(&client, "gone-es-discovery").await
                && !service_exists(&client, "gone-es-public").await
        }
    })
    .await
    .expect("owned objects were not collected");

    controller.cancel();
}
