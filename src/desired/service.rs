//! Discovery and public service rendering

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::worker::owned_by_same_controller;
use super::{discovery_service_name, public_service_name, HTTP_PORT, TRANSPORT_PORT};
use crate::labels::{self, Role, Selector};

/// Headless service publishing every worker, ready or not, for node discovery
pub(super) fn discovery(cluster: &str, namespace: &str, owner: &OwnerReference) -> Service {
    Service {
        metadata: metadata(
            discovery_service_name(cluster),
            cluster,
            namespace,
            owner,
            Role::Discovery,
        ),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(Selector::role(cluster, Role::Worker).as_labels().clone()),
            ports: Some(vec![port("transport", TRANSPORT_PORT)]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Load-balanced service clients connect to; only ready workers receive traffic
pub(super) fn public(cluster: &str, namespace: &str, owner: &OwnerReference) -> Service {
    Service {
        metadata: metadata(public_service_name(cluster), cluster, namespace, owner, Role::Public),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(Selector::role(cluster, Role::Worker).as_labels().clone()),
            ports: Some(vec![port("http", HTTP_PORT)]),
            ..Default::default()
        }),
        status: None,
    }
}

fn metadata(
    name: String,
    cluster: &str,
    namespace: &str,
    owner: &OwnerReference,
    role: Role,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.to_string()),
        labels: Some(labels::role_labels(cluster, role)),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    }
}

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Whether the service has no cluster IP
pub fn is_headless(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        == Some("None")
}

/// Whether an existing service differs from its desired rendering
///
/// Only fields shoal sets are compared. Allocated IPs, extra labels and
/// annotations added by other controllers are not drift.
pub fn service_drifted(desired: &Service, actual: &Service) -> bool {
    let (Some(want), Some(have)) = (desired.spec.as_ref(), actual.spec.as_ref()) else {
        return true;
    };

    let ports = |s: &ServiceSpec| {
        s.ports
            .iter()
            .flatten()
            .map(|p| (p.name.clone(), p.port, p.target_port.clone(), p.protocol.clone()))
            .collect::<Vec<_>>()
    };

    want.type_ != have.type_
        || want.selector != have.selector
        || ports(want) != ports(have)
        || want.publish_not_ready_addresses.unwrap_or(false)
            != have.publish_not_ready_addresses.unwrap_or(false)
        || is_headless(desired) != is_headless(actual)
        || !desired
            .labels()
            .iter()
            .all(|(k, v)| actual.labels().get(k) == Some(v))
        || !owned_by_same_controller(desired, actual)
}
