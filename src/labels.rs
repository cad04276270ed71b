//! Label vocabulary shared by the translator, the reconciler and the router
//!
//! Every object shoal creates carries the managed-by label, the owning
//! cluster's name and a role. Selectors built here are what the reconciler
//! lists with, so a label missing on a manifest makes the object invisible.

use std::collections::BTreeMap;
use std::fmt;

/// Standard managed-by label key
pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY`] on every object shoal owns
pub const MANAGED_BY_VALUE: &str = "shoal";
/// Name of the owning SearchCluster
pub const CLUSTER: &str = "shoal.dev/cluster";
/// Role of the object within its cluster, see [`Role`]
pub const ROLE: &str = "shoal.dev/role";
/// Topology group key of a worker
pub const TOPOLOGY: &str = "shoal.dev/topology";
/// 1-based replica index of a worker inside its group
pub const REPLICA_INDEX: &str = "shoal.dev/replica-index";

/// Annotation holding the hash of a worker's rendered spec
pub const FINGERPRINT_ANNOTATION: &str = "shoal.dev/fingerprint";
/// Annotation holding the node a host-init job targets
pub const NODE_ANNOTATION: &str = "shoal.dev/node";

/// Role of an owned object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// Search worker pod
    Worker,
    /// Headless service used for node discovery
    Discovery,
    /// Client-facing service
    Public,
    /// One-shot kernel tuning job
    HostInit,
}

impl Role {
    /// Label value for this role
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Discovery => "discovery",
            Self::Public => "public",
            Self::HostInit => "host-init",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels every object owned by `cluster` carries
pub fn base_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
        (CLUSTER.to_string(), cluster.to_string()),
    ])
}

/// Base labels plus the role label
pub fn role_labels(cluster: &str, role: Role) -> BTreeMap<String, String> {
    let mut labels = base_labels(cluster);
    labels.insert(ROLE.to_string(), role.as_str().to_string());
    labels
}

/// Equality-based label selector
///
/// Renders as the `k=v,k2=v2` form the API server accepts and matches
/// locally for the in-memory store and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    /// Selector that matches everything
    pub fn everything() -> Self {
        Self::default()
    }

    /// Add a required label
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Objects managed by shoal, regardless of cluster
    pub fn managed() -> Self {
        Self::everything().with(MANAGED_BY, MANAGED_BY_VALUE)
    }

    /// Everything owned by one cluster
    pub fn cluster(name: &str) -> Self {
        Self(base_labels(name))
    }

    /// Objects of one role within a cluster
    pub fn role(name: &str, role: Role) -> Self {
        Self(role_labels(name, role))
    }

    /// Whether `labels` carries every required pair
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// True when the selector places no constraints
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The required pairs as a label map
    pub fn as_labels(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Compute a deterministic hash of `input` as 16 hex characters.
///
/// SHA-256 truncated to 8 bytes. Used for the worker fingerprint annotation
/// and to derive stable per-node job names.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
