//! Error types for the shoal controller
//!
//! Every failure a reconcile can hit lands in one of these variants. The
//! variant decides how the work queue treats the cluster afterwards:
//! transient store failures requeue with backoff, spec problems wait for the
//! user to change the resource.

use thiserror::Error;

/// Main error type for shoal operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that does not map onto a more specific variant
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The declared cluster spec is malformed
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Cluster whose spec failed validation
        cluster: String,
        /// What is wrong with the spec
        message: String,
        /// Offending field path, when known
        field: Option<String>,
    },

    /// Translation produced an internally inconsistent desired set
    #[error("invariant violated for {cluster}: {message}")]
    Invariant {
        /// Cluster being translated
        cluster: String,
        /// Description of the violated invariant
        message: String,
    },

    /// Object does not exist in the store
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Namespaced name
        name: String,
    },

    /// Optimistic concurrency failure or name collision
    #[error("conflict on {kind} {name}: {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Namespaced name
        name: String,
        /// Detail from the store
        message: String,
    },

    /// The store could not be reached or refused the request for now
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Detail from the store or transport
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Unexpected internal failure
    #[error("internal error in {context}: {message}")]
    Internal {
        /// Where the failure happened
        context: String,
        /// Description of the failure
        message: String,
    },
}

/// Context value used when the caller has nothing better to report
pub const UNKNOWN_CONTEXT: &str = "unknown";

impl Error {
    /// Create a validation error for a cluster
    pub fn validation(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error that names the offending field
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an invariant error for a cluster
    pub fn invariant(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Invariant {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable {
            message: msg.into(),
        }
    }

    /// Create an internal error without a specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::internal_with_context(UNKNOWN_CONTEXT, msg)
    }

    /// Create an internal error tagged with where it happened
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Classify a kube client error for the given object
    ///
    /// 404 becomes `NotFound`, 409 (stale resourceVersion, AlreadyExists,
    /// failed precondition) becomes `Conflict`, 429/5xx and transport
    /// failures become `Unavailable`. Everything else stays `Kube`.
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 404 => Self::not_found(kind, name),
            kube::Error::Api(ref resp) if resp.code == 409 => {
                Self::conflict(kind, name, resp.message.clone())
            }
            kube::Error::Api(ref resp) if resp.code == 429 || resp.code >= 500 => {
                Self::unavailable(format!("{} ({})", resp.message, resp.code))
            }
            kube::Error::HyperError(ref e) => Self::unavailable(e.to_string()),
            kube::Error::Service(ref e) => Self::unavailable(e.to_string()),
            other => Self::Kube(other),
        }
    }

    /// Whether this error is worth another attempt later
    ///
    /// Spec problems (`Validation`, `Invariant`) and missing objects wait for
    /// a change to the resource instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::Unavailable { .. } | Self::Internal { .. } => true,
            Self::Kube(kube::Error::Api(resp)) => !(400..500).contains(&resp.code),
            Self::Kube(_) => true,
            Self::Validation { .. }
            | Self::Invariant { .. }
            | Self::NotFound { .. }
            | Self::Serialization(_) => false,
        }
    }

    /// Whether this is a `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is a `Conflict`
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
