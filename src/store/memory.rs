//! In-process object store
//!
//! Mirrors the API server semantics the engine depends on: resource versions
//! with conflict detection, status kept apart from metadata/spec writes,
//! finalizer-gated deletion, and a stream of watch events. Every write is
//! recorded so tests can assert on write counts.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::core::ApiResource;
use serde_json::Value;
use tokio::sync::broadcast;

use super::ObjectStore;
use crate::{Error, Result};

const EVENT_BUFFER: usize = 1024;

/// Change notification emitted after every successful write
#[derive(Clone, Debug)]
pub struct StoreEvent {
    /// `apiVersion` of the changed object
    pub api_version: String,
    /// Kind of the changed object
    pub kind: String,
    /// Object after the change (last state for deletions)
    pub object: Value,
    /// True when the object was physically removed
    pub deleted: bool,
}

/// Kind of write performed against the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOp {
    /// Object created
    Create,
    /// Metadata/spec replaced
    Update,
    /// Status replaced
    UpdateStatus,
    /// Object deleted or marked for deletion
    Delete,
}

/// One recorded write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    /// What was done
    pub op: WriteOp,
    /// Kind of the written object
    pub kind: String,
    /// Namespace of the written object
    pub namespace: String,
    /// Name of the written object
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectId {
    api_version: String,
    kind: String,
    namespace: String,
    name: String,
}

impl ObjectId {
    fn new(resource: &ApiResource, namespace: &str, name: &str) -> Self {
        Self {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn of(resource: &ApiResource, object: &DynamicObject) -> Result<Self> {
        let name = object
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::store("object has no name"))?;
        let namespace = object
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::store(format!("{} {name} has no namespace", resource.kind)))?;
        Ok(Self::new(resource, namespace, name))
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjectId, DynamicObject>,
    next_version: u64,
    next_uid: u64,
    writes: Vec<WriteRecord>,
}

impl MemoryState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn record(&mut self, op: WriteOp, id: &ObjectId) {
        self.writes.push(WriteRecord {
            op,
            kind: id.kind.clone(),
            namespace: id.namespace.clone(),
            name: id.name.clone(),
        });
    }
}

/// In-memory [`ObjectStore`]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
        }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// All writes performed so far
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    /// Number of writes performed so far
    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, id: &ObjectId, object: &DynamicObject, deleted: bool) -> Result<()> {
        let event = StoreEvent {
            api_version: id.api_version.clone(),
            kind: id.kind.clone(),
            object: serde_json::to_value(object)?,
            deleted,
        };
        // No subscribers is not an error.
        let _ = self.events.send(event);
        Ok(())
    }
}

fn check_version(id: &ObjectId, stored: &DynamicObject, incoming: &DynamicObject) -> Result<()> {
    let expected = stored.metadata.resource_version.as_deref();
    match incoming.metadata.resource_version.as_deref() {
        Some(rv) if Some(rv) != expected => Err(Error::conflict(format!(
            "{id}: resourceVersion {rv} is stale (current {})",
            expected.unwrap_or("none")
        ))),
        _ => Ok(()),
    }
}

fn set_status(object: &mut DynamicObject, status: Option<&Value>) {
    if let Some(map) = object.data.as_object_mut() {
        match status {
            Some(status) => {
                map.insert("status".to_string(), status.clone());
            }
            None => {
                map.remove("status");
            }
        }
    }
}

fn finalizers_empty(object: &DynamicObject) -> bool {
    object
        .metadata
        .finalizers
        .as_ref()
        .map_or(true, |f| f.is_empty())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        let id = ObjectId::new(resource, namespace, name);
        let object = self.lock().objects.get(&id).cloned();
        object
            .map(|o| serde_json::to_value(o).map_err(Error::from))
            .transpose()
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<Value>> {
        let wanted = selector.map(parse_selector).transpose()?;
        let state = self.lock();
        state
            .objects
            .iter()
            .filter(|(id, _)| id.api_version == resource.api_version && id.kind == resource.kind)
            .filter(|(id, _)| namespace.map_or(true, |ns| id.namespace == ns))
            .filter(|(_, object)| {
                wanted.as_ref().map_or(true, |pairs| {
                    let labels = object.metadata.labels.clone().unwrap_or_default();
                    pairs.iter().all(|(k, v)| labels.get(k) == Some(v))
                })
            })
            .map(|(_, object)| serde_json::to_value(object).map_err(Error::from))
            .collect()
    }

    async fn create(&self, resource: &ApiResource, object: Value) -> Result<Value> {
        let mut object: DynamicObject = serde_json::from_value(object)?;
        let id = ObjectId::of(resource, &object)?;
        let created = {
            let mut state = self.lock();
            if state.objects.contains_key(&id) {
                return Err(Error::store(format!("{id} already exists")));
            }
            state.next_uid += 1;
            object.metadata.uid = Some(format!("uid-{}", state.next_uid));
            object.metadata.resource_version = Some(state.bump_version());
            object.metadata.creation_timestamp = Some(Time(Utc::now()));
            object.metadata.generation = Some(1);
            object.metadata.deletion_timestamp = None;
            state.objects.insert(id.clone(), object.clone());
            state.record(WriteOp::Create, &id);
            object
        };
        self.emit(&id, &created, false)?;
        Ok(serde_json::to_value(created)?)
    }

    async fn update(&self, resource: &ApiResource, object: Value) -> Result<Value> {
        let mut incoming: DynamicObject = serde_json::from_value(object)?;
        let id = ObjectId::of(resource, &incoming)?;
        let (result, removed) = {
            let mut state = self.lock();
            let stored = state
                .objects
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::store(format!("{id} not found")))?;
            check_version(&id, &stored, &incoming)?;

            set_status(&mut incoming, stored.data.get("status"));
            incoming.metadata.uid = stored.metadata.uid.clone();
            incoming.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
            incoming.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
            let generation = stored.metadata.generation.unwrap_or(1);
            incoming.metadata.generation = if incoming.data.get("spec") != stored.data.get("spec")
            {
                Some(generation + 1)
            } else {
                Some(generation)
            };
            incoming.metadata.resource_version = Some(state.bump_version());
            state.record(WriteOp::Update, &id);

            let removed =
                incoming.metadata.deletion_timestamp.is_some() && finalizers_empty(&incoming);
            if removed {
                state.objects.remove(&id);
            } else {
                state.objects.insert(id.clone(), incoming.clone());
            }
            (incoming, removed)
        };
        self.emit(&id, &result, removed)?;
        Ok(serde_json::to_value(result)?)
    }

    async fn update_status(&self, resource: &ApiResource, object: Value) -> Result<Value> {
        let incoming: DynamicObject = serde_json::from_value(object)?;
        let id = ObjectId::of(resource, &incoming)?;
        let updated = {
            let mut state = self.lock();
            let mut stored = state
                .objects
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::store(format!("{id} not found")))?;
            check_version(&id, &stored, &incoming)?;

            set_status(&mut stored, incoming.data.get("status"));
            stored.metadata.resource_version = Some(state.bump_version());
            state.objects.insert(id.clone(), stored.clone());
            state.record(WriteOp::UpdateStatus, &id);
            stored
        };
        self.emit(&id, &updated, false)?;
        Ok(serde_json::to_value(updated)?)
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        let id = ObjectId::new(resource, namespace, name);
        let outcome = {
            let mut state = self.lock();
            let Some(mut object) = state.objects.get(&id).cloned() else {
                return Ok(());
            };
            state.record(WriteOp::Delete, &id);
            if finalizers_empty(&object) {
                state.objects.remove(&id);
                (object, true)
            } else {
                if object.metadata.deletion_timestamp.is_none() {
                    object.metadata.deletion_timestamp = Some(Time(Utc::now()));
                    object.metadata.resource_version = Some(state.bump_version());
                    state.objects.insert(id.clone(), object.clone());
                }
                (object, false)
            }
        };
        self.emit(&id, &outcome.0, outcome.1)
    }
}

fn parse_selector(selector: &str) -> Result<Vec<(String, String)>> {
    selector
        .split(',')
        .filter(|term| !term.trim().is_empty())
        .map(|term| {
            term.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| Error::store(format!("unsupported selector term {term:?}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Device, DeviceSpec, Endpoint};
    use crate::store::Store;
    use kube::ResourceExt;
    use std::sync::Arc;

    fn device(name: &str) -> Device {
        let mut device = Device::new(
            name,
            DeviceSpec {
                endpoint: Endpoint {
                    address: "192.0.2.1".to_string(),
                    port: None,
                },
            },
        );
        device.metadata.namespace = Some("default".to_string());
        device
    }

    fn store() -> (Arc<MemoryStore>, Store) {
        let memory = Arc::new(MemoryStore::new());
        (memory.clone(), Store::new(memory))
    }

    #[tokio::test]
    async fn create_assigns_identity() {
        let (_, store) = store();
        let created = store.create(&device("leaf1")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version.is_some());
        assert!(created.metadata.creation_timestamp.is_some());

        let err = store.create(&device("leaf1")).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn stale_resource_version_is_a_conflict() {
        let (_, store) = store();
        let created = store.create(&device("leaf1")).await.unwrap();

        let mut first = created.clone();
        first.labels_mut().insert("a".into(), "1".into());
        store.update(&first).await.unwrap();

        let mut second = created;
        second.labels_mut().insert("b".into(), "2".into());
        let err = store.update(&second).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn deletion_waits_for_finalizers() {
        let (memory, store) = store();
        let mut d = device("leaf1");
        d.metadata.finalizers = Some(vec!["test/finalizer".to_string()]);
        store.create(&d).await.unwrap();

        store.delete::<Device>("default", "leaf1").await.unwrap();
        let pending: Device = store.get("default", "leaf1").await.unwrap().unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());

        let mut released = pending.clone();
        released.metadata.finalizers = Some(vec![]);
        store.update(&released).await.unwrap();
        assert!(store
            .get::<Device>("default", "leaf1")
            .await
            .unwrap()
            .is_none());
        assert_eq!(memory.writes().last().unwrap().op, WriteOp::Update);
    }

    #[tokio::test]
    async fn list_filters_by_label_selector() {
        let (_, store) = store();
        let mut a = device("a");
        a.labels_mut().insert("role".into(), "leaf".into());
        store.create(&a).await.unwrap();
        store.create(&device("b")).await.unwrap();

        let leaves: Vec<Device> = store
            .list(Some("default"), Some("role=leaf"))
            .await
            .unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].name_any(), "a");

        let all: Vec<Device> = store.list(None, None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn writes_emit_events() {
        let (memory, store) = store();
        let mut events = memory.subscribe();
        store.create(&device("leaf1")).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, "Device");
        assert!(!event.deleted);
        assert_eq!(memory.write_count(), 1);
    }
}
