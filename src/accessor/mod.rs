//! Typed access to the resource store
//!
//! The reconciler never talks to the API server directly. Every read and
//! write goes through an [`Accessor`], which performs exactly one store call
//! per operation and reports failures as `NotFound`, `Conflict` or
//! `Unavailable`. Retrying is the caller's decision.
//!
//! Two implementations exist:
//! - [`KubeAccessor`] backed by `kube::Api`
//! - [`MemoryAccessor`] backed by a [`MemoryStore`] for harnesses and tests

mod api;
mod memory;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::labels::Selector;
use crate::Error;

pub use api::KubeAccessor;
pub use memory::{FaultError, MemoryAccessor, MemoryStore, Verb};

/// Where a list call looks
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListScope {
    /// Every namespace
    All,
    /// A single namespace
    Namespace(String),
}

impl ListScope {
    /// Scope for one namespace
    pub fn namespace(ns: impl Into<String>) -> Self {
        Self::Namespace(ns.into())
    }

    /// Whether `namespace` falls inside this scope
    pub fn contains(&self, namespace: &str) -> bool {
        match self {
            Self::All => true,
            Self::Namespace(ns) => ns == namespace,
        }
    }
}

/// A change to an object's status subresource
///
/// The body is the whole patch document, `{"status": {...}}`.
#[derive(Clone, Debug, PartialEq)]
pub enum StatusPatch {
    /// JSON merge patch; lists are replaced whole
    Merge(serde_json::Value),
    /// Strategic merge patch; condition lists merge entry by entry on `type`
    ///
    /// Only built-in kinds accept it, custom resources reject it.
    Strategic(serde_json::Value),
}

impl StatusPatch {
    /// The patch document
    pub fn body(&self) -> &serde_json::Value {
        match self {
            Self::Merge(body) | Self::Strategic(body) => body,
        }
    }
}

/// CRUD operations on one kind of namespaced object
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Accessor<K: Clone + Send + Sync + 'static>: Send + Sync {
    /// Fetch one object
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error>;

    /// List objects whose labels match `selector`
    async fn list(&self, scope: &ListScope, selector: &Selector) -> Result<Vec<K>, Error>;

    /// Create an object; `Conflict` if the name is taken
    async fn create(&self, obj: &K) -> Result<K, Error>;

    /// Replace an object; `Conflict` if its resourceVersion is stale
    async fn update(&self, obj: &K) -> Result<K, Error>;

    /// Delete an object, optionally only if it is still at `resource_version`
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<(), Error>;

    /// Patch the status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &StatusPatch,
    ) -> Result<K, Error>;
}
