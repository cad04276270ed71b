//! Desired vs actual diff
//!
//! Produces an ordered [`Plan`]: creates (services before workers), then
//! updates, then deletes (highest replica first). Planning is pure so every
//! ordering rule is testable without a store.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;

use crate::desired::{replica_index, service_drifted, worker_drifted, DesiredSet};

/// An object the plan touches
#[derive(Clone, Debug, PartialEq)]
pub enum Manifest {
    /// A worker pod
    Worker(Pod),
    /// A discovery or public service
    Service(Service),
}

impl Manifest {
    /// Object name
    pub fn name(&self) -> String {
        match self {
            Manifest::Worker(p) => p.name_any(),
            Manifest::Service(s) => s.name_any(),
        }
    }

    /// Object kind
    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::Worker(_) => "Pod",
            Manifest::Service(_) => "Service",
        }
    }
}

/// One step of a [`Plan`]
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    /// Desired object is missing
    Create(Manifest),
    /// Object exists but differs from its desired rendering
    Update {
        /// What it should look like
        desired: Manifest,
        /// What the store returned
        actual: Manifest,
    },
    /// Owned object is no longer desired
    Delete(Manifest),
}

impl Change {
    /// Name of the object the change touches
    pub fn name(&self) -> String {
        match self {
            Change::Create(m) | Change::Delete(m) => m.name(),
            Change::Update { desired, .. } => desired.name(),
        }
    }
}

/// Ordered changes that bring actual state to desired state
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    /// Changes in apply order
    pub changes: Vec<Change>,
    /// Desired objects waiting for a terminating predecessor to go away
    pub blocked: Vec<String>,
}

impl Plan {
    /// Whether nothing needs writing or waiting
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.blocked.is_empty()
    }
}

fn is_terminating(obj: &impl kube::Resource) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

fn is_owned_by(obj: &impl kube::Resource, owner_uid: &str) -> bool {
    obj.owner_references()
        .iter()
        .any(|o| o.controller == Some(true) && o.uid == owner_uid)
}

/// Diff `desired` against the objects currently labelled for the cluster
///
/// Only objects controlled by `owner_uid` are ever deleted. Terminating
/// objects are left alone; a desired object whose name is still held by a
/// terminating one is reported as blocked.
pub fn compute_plan(
    desired: &DesiredSet,
    workers: &[Pod],
    services: &[Service],
    owner_uid: &str,
) -> Plan {
    let actual_services: BTreeMap<String, &Service> =
        services.iter().map(|s| (s.name_any(), s)).collect();
    let actual_workers: BTreeMap<String, &Pod> =
        workers.iter().map(|p| (p.name_any(), p)).collect();

    let mut creates = Vec::new();
    let mut updates = Vec::new();
    let mut blocked = Vec::new();

    for want in desired.services() {
        let name = want.name_any();
        match actual_services.get(&name) {
            None => creates.push(Change::Create(Manifest::Service(want.clone()))),
            Some(have) if is_terminating(*have) => blocked.push(name),
            Some(have) if service_drifted(want, have) => updates.push(Change::Update {
                desired: Manifest::Service(want.clone()),
                actual: Manifest::Service((*have).clone()),
            }),
            Some(_) => {}
        }
    }

    for (name, want) in &desired.workers {
        match actual_workers.get(name) {
            None => creates.push(Change::Create(Manifest::Worker(want.clone()))),
            Some(have) if is_terminating(*have) => blocked.push(name.clone()),
            Some(have) if worker_drifted(want, have) => updates.push(Change::Update {
                desired: Manifest::Worker(want.clone()),
                actual: Manifest::Worker((*have).clone()),
            }),
            Some(_) => {}
        }
    }

    let mut surplus_workers: Vec<&Pod> = workers
        .iter()
        .filter(|p| !desired.workers.contains_key(&p.name_any()))
        .filter(|p| is_owned_by(*p, owner_uid) && !is_terminating(*p))
        .collect();
    // Highest replica first; ties broken by name for a stable order
    surplus_workers.sort_by(|a, b| {
        replica_index(b)
            .cmp(&replica_index(a))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });

    let desired_service_names: Vec<String> =
        desired.services().iter().map(|s| s.name_any()).collect();
    let surplus_services = services
        .iter()
        .filter(|s| !desired_service_names.contains(&s.name_any()))
        .filter(|s| is_owned_by(*s, owner_uid) && !is_terminating(*s));

    let deletes = surplus_workers
        .into_iter()
        .map(|p| Change::Delete(Manifest::Worker(p.clone())))
        .chain(surplus_services.map(|s| Change::Delete(Manifest::Service(s.clone()))));

    Plan {
        changes: creates.into_iter().chain(updates).chain(deletes).collect(),
        blocked,
    }
}
