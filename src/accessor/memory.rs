//! In-process resource store
//!
//! Behaves like the parts of the API server the controller relies on:
//! uids and resourceVersions are assigned on write, stale writes conflict,
//! status is only changed through the status subresource, and every write
//! emits a [`Notification`]. Background garbage collection of owned objects
//! can be switched on to mimic the platform's cascading delete.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::{Accessor, ListScope, StatusPatch};
use crate::labels::Selector;
use crate::runtime::Notification;
use crate::Error;

const NOTIFICATION_BUFFER: usize = 4096;

/// (kind, namespace, name)
type ObjectKey = (String, String, String);

/// Store operation a fault can be attached to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    /// `get`
    Get,
    /// `list`
    List,
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `patch_status`
    PatchStatus,
}

/// Failure injected into the next matching operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// Fail with `Conflict`
    Conflict,
    /// Fail with `Unavailable`
    Unavailable,
}

#[derive(Debug)]
struct Fault {
    kind: String,
    verb: Verb,
    error: FaultError,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Value>,
    revision: u64,
    faults: Vec<Fault>,
}

/// Shared in-memory object store
///
/// Cheap to clone; clones share the same objects.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<Notification>,
    mutations: Arc<AtomicU64>,
    garbage_collection: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store without garbage collection
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
            mutations: Arc::new(AtomicU64::new(0)),
            garbage_collection: false,
        }
    }

    /// Delete dependents whose owner disappears, like the platform's garbage collector
    pub fn with_garbage_collection(mut self) -> Self {
        self.garbage_collection = true;
        self
    }

    /// Typed accessor for kind `K`
    pub fn accessor<K>(&self) -> Arc<MemoryAccessor<K>> {
        Arc::new(MemoryAccessor {
            store: self.clone(),
            _kind: PhantomData,
        })
    }

    /// Stream of change notifications from now on
    pub fn notifications(&self) -> BoxStream<'static, Notification> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|item| async move {
                match item {
                    Ok(n) => Some(n),
                    Err(e) => {
                        warn!(error = %e, "notification subscriber lagged");
                        None
                    }
                }
            })
            .boxed()
    }

    /// Number of successful writes so far
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Number of stored objects of `kind`
    pub fn count(&self, kind: &str) -> usize {
        self.inner
            .lock()
            .objects
            .keys()
            .filter(|(k, _, _)| k == kind)
            .count()
    }

    /// Make the next `verb` on `kind` fail with `error`
    ///
    /// Faults are consumed in the order they were injected.
    pub fn inject_fault(&self, kind: &str, verb: Verb, error: FaultError) {
        self.inner.lock().faults.push(Fault {
            kind: kind.to_string(),
            verb,
            error,
        });
    }

    fn take_fault(inner: &mut Inner, kind: &str, verb: Verb, name: &str) -> Option<Error> {
        let pos = inner
            .faults
            .iter()
            .position(|f| f.kind == kind && f.verb == verb)?;
        let fault = inner.faults.remove(pos);
        debug!(kind, ?verb, name, "injecting fault");
        Some(match fault.error {
            FaultError::Conflict => Error::conflict(kind, name, "injected conflict"),
            FaultError::Unavailable => Error::unavailable(format!("injected outage on {kind}")),
        })
    }

    fn next_revision(inner: &mut Inner) -> String {
        inner.revision += 1;
        inner.revision.to_string()
    }

    fn record(&self, kind: &str, value: &Value) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        // No receivers is fine; nobody is watching yet
        let _ = self.events.send(notification_for(kind, value));
    }

    /// Remove objects owned (transitively) by `uid`
    fn collect_garbage(&self, inner: &mut Inner, uid: &str) {
        let mut pending = vec![uid.to_string()];
        while let Some(owner) = pending.pop() {
            let dependents: Vec<ObjectKey> = inner
                .objects
                .iter()
                .filter(|(_, v)| {
                    let owners = metadata(v).owner_references;
                    owners.iter().flatten().any(|o| o.uid == owner)
                })
                .map(|(k, _)| k.clone())
                .collect();
            for key in dependents {
                if let Some(value) = inner.objects.remove(&key) {
                    debug!(kind = %key.0, namespace = %key.1, name = %key.2, "garbage collected");
                    if let Some(uid) = metadata(&value).uid {
                        pending.push(uid);
                    }
                    self.record(&key.0, &value);
                }
            }
        }
    }
}

fn metadata(value: &Value) -> ObjectMeta {
    value
        .get("metadata")
        .and_then(|m| serde_json::from_value(m.clone()).ok())
        .unwrap_or_default()
}

fn notification_for(kind: &str, value: &Value) -> Notification {
    let meta = metadata(value);
    Notification {
        kind: kind.to_string(),
        namespace: meta.namespace,
        name: meta.name.unwrap_or_default(),
        owner_references: meta.owner_references.unwrap_or_default(),
    }
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Key strategic merge uses to match list entries, as for pod conditions
const MERGE_KEY: &str = "type";

/// Strategic merge patch, to the extent status subresources need it
///
/// A list whose entries all carry [`MERGE_KEY`] merges entry by entry and
/// keeps entries the patch does not name. Everything else follows
/// [`merge_patch`].
fn strategic_merge(target: &mut Value, patch: &Value) {
    if let (Value::Array(entries), Value::Array(updates)) = (&mut *target, patch) {
        if !updates.is_empty() && updates.iter().all(|u| u.get(MERGE_KEY).is_some()) {
            for update in updates {
                let key = update.get(MERGE_KEY);
                match entries.iter().position(|e| e.get(MERGE_KEY) == key) {
                    Some(i) => strategic_merge(&mut entries[i], update),
                    None => entries.push(update.clone()),
                }
            }
            return;
        }
    }
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                strategic_merge(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// [`Accessor`] over a [`MemoryStore`]
pub struct MemoryAccessor<K> {
    store: MemoryStore,
    _kind: PhantomData<fn() -> K>,
}

impl<K> MemoryAccessor<K>
where
    K: Resource<DynamicType = ()>,
{
    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn key(namespace: &str, name: &str) -> ObjectKey {
        (Self::kind(), namespace.to_string(), name.to_string())
    }
}

fn identity(obj: &impl Resource) -> Result<(String, String), Error> {
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::internal_with_context("memory store", "object has no name"))?;
    Ok((obj.namespace().unwrap_or_else(|| "default".to_string()), name))
}

#[async_trait]
impl<K> Accessor<K> for MemoryAccessor<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error> {
        let kind = Self::kind();
        let path = format!("{namespace}/{name}");
        let mut inner = self.store.inner.lock();
        if let Some(err) = MemoryStore::take_fault(&mut inner, &kind, Verb::Get, &path) {
            return Err(err);
        }
        let value = inner
            .objects
            .get(&Self::key(namespace, name))
            .ok_or_else(|| Error::not_found(&kind, &path))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    async fn list(&self, scope: &ListScope, selector: &Selector) -> Result<Vec<K>, Error> {
        let kind = Self::kind();
        let mut inner = self.store.inner.lock();
        if let Some(err) =
            MemoryStore::take_fault(&mut inner, &kind, Verb::List, &selector.to_string())
        {
            return Err(err);
        }
        inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && scope.contains(ns))
            .filter(|(_, v)| selector.matches(&metadata(v).labels.unwrap_or_default()))
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(Error::from))
            .collect()
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let kind = Self::kind();
        let (namespace, name) = identity(obj)?;
        let path = format!("{namespace}/{name}");
        let key = Self::key(&namespace, &name);

        let mut inner = self.store.inner.lock();
        if let Some(err) = MemoryStore::take_fault(&mut inner, &kind, Verb::Create, &path) {
            return Err(err);
        }
        if inner.objects.contains_key(&key) {
            return Err(Error::conflict(&kind, &path, "already exists"));
        }

        let mut created = obj.clone();
        let revision = MemoryStore::next_revision(&mut inner);
        let meta = created.meta_mut();
        meta.namespace = Some(namespace);
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(revision);
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;

        let value = serde_json::to_value(&created)?;
        inner.objects.insert(key, value.clone());
        drop(inner);

        self.store.record(&kind, &value);
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K, Error> {
        let kind = Self::kind();
        let (namespace, name) = identity(obj)?;
        let path = format!("{namespace}/{name}");
        let key = Self::key(&namespace, &name);

        let mut inner = self.store.inner.lock();
        if let Some(err) = MemoryStore::take_fault(&mut inner, &kind, Verb::Update, &path) {
            return Err(err);
        }
        let stored = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(&kind, &path))?;
        let stored_meta = metadata(&stored);
        if let Some(rv) = obj.meta().resource_version.as_deref() {
            if stored_meta.resource_version.as_deref() != Some(rv) {
                return Err(Error::conflict(
                    &kind,
                    &path,
                    "the object has been modified; please apply your changes to the latest version",
                ));
            }
        }

        let mut updated = obj.clone();
        let revision = MemoryStore::next_revision(&mut inner);
        let spec_changed = serde_json::to_value(&updated)?.get("spec") != stored.get("spec");
        let meta = updated.meta_mut();
        meta.namespace = Some(namespace);
        meta.uid = stored_meta.uid;
        meta.creation_timestamp = stored_meta.creation_timestamp;
        meta.deletion_timestamp = stored_meta.deletion_timestamp;
        meta.resource_version = Some(revision);
        meta.generation = stored_meta
            .generation
            .map(|g| if spec_changed { g + 1 } else { g });

        // Status belongs to the status subresource
        let mut value = serde_json::to_value(&updated)?;
        match (value.as_object_mut(), stored.get("status")) {
            (Some(map), Some(status)) => {
                map.insert("status".to_string(), status.clone());
            }
            (Some(map), None) => {
                map.remove("status");
            }
            _ => {}
        }
        inner.objects.insert(key, value.clone());
        drop(inner);

        self.store.record(&kind, &value);
        Ok(serde_json::from_value(value)?)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        let kind = Self::kind();
        let path = format!("{namespace}/{name}");
        let key = Self::key(namespace, name);

        let mut inner = self.store.inner.lock();
        if let Some(err) = MemoryStore::take_fault(&mut inner, &kind, Verb::Delete, &path) {
            return Err(err);
        }
        let stored_rv = metadata(
            inner
                .objects
                .get(&key)
                .ok_or_else(|| Error::not_found(&kind, &path))?,
        )
        .resource_version;
        if let Some(rv) = resource_version {
            if stored_rv.as_deref() != Some(rv.as_str()) {
                return Err(Error::conflict(&kind, &path, "precondition failed"));
            }
        }

        if let Some(value) = inner.objects.remove(&key) {
            self.store.record(&kind, &value);
            if self.store.garbage_collection {
                if let Some(uid) = metadata(&value).uid {
                    self.store.collect_garbage(&mut inner, &uid);
                }
            }
        }
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &StatusPatch,
    ) -> Result<K, Error> {
        let kind = Self::kind();
        let path = format!("{namespace}/{name}");
        let key = Self::key(namespace, name);

        let mut inner = self.store.inner.lock();
        if let Some(err) = MemoryStore::take_fault(&mut inner, &kind, Verb::PatchStatus, &path) {
            return Err(err);
        }
        let revision = MemoryStore::next_revision(&mut inner);
        let value = {
            let stored = inner
                .objects
                .get_mut(&key)
                .ok_or_else(|| Error::not_found(&kind, &path))?;
            if let Some(status) = patch.body().get("status") {
                let target = stored
                    .as_object_mut()
                    .map(|m| m.entry("status").or_insert(Value::Null));
                if let Some(target) = target {
                    match patch {
                        StatusPatch::Merge(_) => merge_patch(target, status),
                        StatusPatch::Strategic(_) => strategic_merge(target, status),
                    }
                }
            }
            stored["metadata"]["resourceVersion"] = Value::String(revision);
            stored.clone()
        };
        drop(inner);

        self.store.record(&kind, &value);
        Ok(serde_json::from_value(value)?)
    }
}
