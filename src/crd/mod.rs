//! Custom Resource Definitions for shoal

mod cluster;
mod types;

pub use cluster::{
    SearchCluster, SearchClusterSpec, SearchClusterStatus, MAX_CLUSTER_NAME_LEN,
    MAX_GROUP_NAME_LEN, MAX_GROUP_NODES,
};
pub use types::{
    ClusterPhase, Condition, ConditionStatus, NodeRoles, ResourceAmounts, ResourceShape,
    TopologyGroup,
};
