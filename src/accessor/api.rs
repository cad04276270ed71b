//! Accessor backed by the Kubernetes API

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{
    Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions,
    PropagationPolicy,
};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Accessor, ListScope, StatusPatch};
use crate::labels::Selector;
use crate::Error;

/// [`Accessor`] over `kube::Api<K>`
pub struct KubeAccessor<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeAccessor<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    /// Create an accessor using the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }
}

fn object_name(obj: &impl Resource) -> Result<(String, String), Error> {
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::internal_with_context("accessor", "object has no name"))?;
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    Ok((namespace, name))
}

#[async_trait]
impl<K> Accessor<K> for KubeAccessor<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), &format!("{namespace}/{name}")))
    }

    async fn list(&self, scope: &ListScope, selector: &Selector) -> Result<Vec<K>, Error> {
        let api: Api<K> = match scope {
            ListScope::All => Api::all(self.client.clone()),
            ListScope::Namespace(ns) => self.api(ns),
        };
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }
        let list = api
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), &selector.to_string()))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let (namespace, name) = object_name(obj)?;
        self.api(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), &format!("{namespace}/{name}")))
    }

    async fn update(&self, obj: &K) -> Result<K, Error> {
        let (namespace, name) = object_name(obj)?;
        self.api(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), &format!("{namespace}/{name}")))
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv),
                uid: None,
            }),
            ..Default::default()
        };
        self.api(namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, &Self::kind(), &format!("{namespace}/{name}")))
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &StatusPatch,
    ) -> Result<K, Error> {
        let patch = match patch {
            StatusPatch::Merge(body) => Patch::Merge(body),
            StatusPatch::Strategic(body) => Patch::Strategic(body),
        };
        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), &format!("{namespace}/{name}")))
    }
}
