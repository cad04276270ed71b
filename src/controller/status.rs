//! Cluster status computation and publishing

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use super::Context;
use crate::accessor::StatusPatch;
use crate::crd::{ClusterPhase, Condition, ConditionStatus, SearchCluster, SearchClusterStatus};
use crate::desired::{is_pod_ready, DesiredSet};
use crate::Error;

/// Condition type summarizing availability
pub const READY_CONDITION: &str = "Ready";

/// Status for a cluster whose spec rendered successfully
///
/// A worker counts as available when it is desired, not terminating and
/// passes readiness. `settling` marks a pass that wrote or is waiting on
/// something, which keeps the phase at Progressing even when all current
/// workers are ready.
pub fn summarize(
    cluster: &SearchCluster,
    desired: &DesiredSet,
    workers: &[Pod],
    settling: bool,
) -> SearchClusterStatus {
    let wanted = desired.node_count() as u32;
    let available = workers
        .iter()
        .filter(|p| desired.workers.contains_key(&p.name_any()))
        .filter(|p| p.metadata.deletion_timestamp.is_none() && is_pod_ready(p))
        .count() as u32;

    let ready = available == wanted && !settling;
    let message = format!("{available}/{wanted} nodes available");
    let condition = if ready {
        Condition::new(READY_CONDITION, ConditionStatus::True, "AllNodesAvailable", &message)
    } else {
        Condition::new(READY_CONDITION, ConditionStatus::False, "Progressing", &message)
    };
    let phase = if ready {
        ClusterPhase::Ready
    } else {
        ClusterPhase::Progressing
    };

    let status = SearchClusterStatus::with_phase(phase)
        .message(message)
        .condition(condition)
        .nodes(wanted, available)
        .observed_generation(cluster.metadata.generation);
    carry_transition_times(cluster.status.as_ref(), status)
}

/// Status for a cluster whose spec cannot be rendered
///
/// Node counts are carried over; nothing was touched.
pub fn failed(cluster: &SearchCluster, error: &Error) -> SearchClusterStatus {
    let reason = match error {
        Error::Validation { .. } => "InvalidSpec",
        Error::Invariant { .. } => "InvariantViolated",
        _ => "ReconcileError",
    };
    let message = error.to_string();
    let mut status = SearchClusterStatus::with_phase(ClusterPhase::Failed)
        .message(&message)
        .condition(Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            reason,
            message,
        ))
        .observed_generation(cluster.metadata.generation);
    if let Some(previous) = cluster.status.as_ref() {
        status.desired_nodes = previous.desired_nodes;
        status.available_nodes = previous.available_nodes;
    }
    carry_transition_times(cluster.status.as_ref(), status)
}

/// Keep a condition's transition time while its status stays the same
fn carry_transition_times(
    previous: Option<&SearchClusterStatus>,
    mut status: SearchClusterStatus,
) -> SearchClusterStatus {
    let Some(previous) = previous else {
        return status;
    };
    for condition in &mut status.conditions {
        if let Some(old) = previous.get_condition(&condition.type_) {
            if old.status == condition.status {
                condition.last_transition_time = old.last_transition_time;
            }
        }
    }
    status
}

/// Write `status` unless it is already current
///
/// Returns whether a write happened.
pub(super) async fn publish(
    ctx: &Context,
    cluster: &SearchCluster,
    status: &SearchClusterStatus,
) -> Result<bool, Error> {
    if cluster.status.as_ref() == Some(status) {
        debug!("status unchanged");
        return Ok(false);
    }
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    ctx.clusters
        .patch_status(
            &namespace,
            &cluster.name_any(),
            &StatusPatch::Merge(json!({ "status": status })),
        )
        .await?;
    debug!(phase = %status.phase, message = ?status.message, "status updated");
    Ok(true)
}
