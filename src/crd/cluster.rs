//! SearchCluster Custom Resource Definition
//!
//! A SearchCluster declares a clustered search deployment: which version to
//! run, how many nodes in which topology groups, and whether the hosts need
//! kernel tuning before nodes may become ready.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ClusterPhase, Condition, TopologyGroup};
use crate::Error;

/// Longest cluster name accepted; keeps every derived object name a DNS label
pub const MAX_CLUSTER_NAME_LEN: usize = 36;
/// Longest topology group name accepted
pub const MAX_GROUP_NAME_LEN: usize = 16;
/// Largest node count accepted for one group
pub const MAX_GROUP_NODES: i32 = 9999;

/// Specification for a SearchCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "shoal.dev",
    version = "v1alpha1",
    kind = "SearchCluster",
    plural = "searchclusters",
    shortname = "sc",
    status = "SearchClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableNodes"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredNodes"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SearchClusterSpec {
    /// Search software version (e.g. `7.0.0`)
    pub version: String,

    /// Raise `vm.max_map_count` on every host running a node before it may become ready
    #[serde(default)]
    pub set_vm_max_map_count: bool,

    /// Explicit container image, bypassing version-based resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Node groups; their node counts add up to the cluster size
    #[serde(default)]
    pub topologies: Vec<TopologyGroup>,
}

impl SearchClusterSpec {
    /// Total number of declared nodes across groups (negative counts ignored)
    pub fn total_nodes(&self) -> u32 {
        self.topologies
            .iter()
            .map(|g| g.node_count.max(0) as u32)
            .sum()
    }

    /// Validate the cluster specification
    pub fn validate(&self, cluster: &str) -> Result<(), Error> {
        if !is_dns_label(cluster) || cluster.len() > MAX_CLUSTER_NAME_LEN {
            return Err(Error::validation_for_field(
                cluster,
                "metadata.name",
                format!(
                    "must be a lowercase DNS label of at most {MAX_CLUSTER_NAME_LEN} characters"
                ),
            ));
        }

        if !is_version(&self.version) {
            return Err(Error::validation_for_field(
                cluster,
                "spec.version",
                format!("'{}' is not a version like 7.0.0", self.version),
            ));
        }

        if let Some(image) = &self.image {
            if image.trim().is_empty() || image.chars().any(char::is_whitespace) {
                return Err(Error::validation_for_field(
                    cluster,
                    "spec.image",
                    "must be a non-empty image reference",
                ));
            }
        }

        for (i, group) in self.topologies.iter().enumerate() {
            let field = format!("spec.topologies[{i}]");
            if group.node_count < 0 {
                return Err(Error::validation_for_field(
                    cluster,
                    format!("{field}.nodeCount"),
                    format!("must be >= 0, got {}", group.node_count),
                ));
            }
            if group.node_count > MAX_GROUP_NODES {
                return Err(Error::validation_for_field(
                    cluster,
                    format!("{field}.nodeCount"),
                    format!("must be <= {MAX_GROUP_NODES}, got {}", group.node_count),
                ));
            }
            if let Some(name) = &group.name {
                if !is_dns_label(name) || name.len() > MAX_GROUP_NAME_LEN {
                    return Err(Error::validation_for_field(
                        cluster,
                        format!("{field}.name"),
                        format!(
                            "'{name}' must be a lowercase DNS label \
                             of at most {MAX_GROUP_NAME_LEN} characters"
                        ),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends
fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// `MAJOR[.MINOR[.PATCH]]` with an optional `-suffix`
fn is_version(s: &str) -> bool {
    let core = s.split_once('-').map_or(s, |(core, _)| core);
    let parts: Vec<&str> = core.split('.').collect();
    (1..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Status for a SearchCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchClusterStatus {
    /// Current phase of the cluster
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Declared node count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_nodes: Option<u32>,

    /// Nodes currently passing readiness
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_nodes: Option<u32>,

    /// Generation of the spec this status describes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl SearchClusterStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ClusterPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        // Remove existing condition of the same type
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Set node counts and return self for chaining
    pub fn nodes(mut self, desired: u32, available: u32) -> Self {
        self.desired_nodes = Some(desired);
        self.available_nodes = Some(available);
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}
