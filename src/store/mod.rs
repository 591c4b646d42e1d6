//! Object store seam
//!
//! The engine never talks to the API server directly. It goes through
//! [`ObjectStore`], a dyn-compatible trait over JSON objects keyed by
//! [`ApiResource`], and the typed [`Store`] facade on top of it.
//!
//! - [`KubeStore`] - backed by a `kube::Client`
//! - [`MemoryStore`] - in-process store with watch events, for tests and
//!   local simulation

mod kubernetes;
mod memory;

pub use kubernetes::KubeStore;
pub use memory::{MemoryStore, StoreEvent, WriteOp, WriteRecord};

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use kube::core::{ApiResource, NamespaceResourceScope};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::Result;

/// A namespaced, statically typed object the store can hold
pub trait StoredObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoredObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Versioned object storage with optimistic concurrency
///
/// `update` replaces metadata and spec and ignores status; `update_status`
/// replaces status only. Both reject a stale `resourceVersion` with
/// [`crate::Error::Conflict`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str)
        -> Result<Option<Value>>;

    /// List objects in a namespace (or all namespaces), filtered by label selector
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<Value>>;

    /// Create a new object
    async fn create(&self, resource: &ApiResource, object: Value) -> Result<Value>;

    /// Replace metadata and spec
    async fn update(&self, resource: &ApiResource, object: Value) -> Result<Value>;

    /// Replace status
    async fn update_status(&self, resource: &ApiResource, object: Value) -> Result<Value>;

    /// Delete an object; soft-deletes while finalizers remain
    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()>;
}

/// Typed facade over a shared [`ObjectStore`]
#[derive(Clone)]
pub struct Store {
    inner: Arc<dyn ObjectStore>,
}

impl Store {
    /// Wrap a store implementation
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    /// Fetch a typed object
    pub async fn get<K: StoredObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let resource = ApiResource::erase::<K>(&());
        self.inner
            .get(&resource, namespace, name)
            .await?
            .map(decode)
            .transpose()
    }

    /// List typed objects
    pub async fn list<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let resource = ApiResource::erase::<K>(&());
        self.inner
            .list(&resource, namespace, selector)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Create a typed object
    pub async fn create<K: StoredObject>(&self, object: &K) -> Result<K> {
        let resource = ApiResource::erase::<K>(&());
        decode(self.inner.create(&resource, encode(object)?).await?)
    }

    /// Replace metadata and spec of a typed object
    pub async fn update<K: StoredObject>(&self, object: &K) -> Result<K> {
        let resource = ApiResource::erase::<K>(&());
        decode(self.inner.update(&resource, encode(object)?).await?)
    }

    /// Replace status of a typed object
    pub async fn update_status<K: StoredObject>(&self, object: &K) -> Result<K> {
        let resource = ApiResource::erase::<K>(&());
        decode(self.inner.update_status(&resource, encode(object)?).await?)
    }

    /// Delete a typed object
    pub async fn delete<K: StoredObject>(&self, namespace: &str, name: &str) -> Result<()> {
        let resource = ApiResource::erase::<K>(&());
        self.inner.delete(&resource, namespace, name).await
    }
}

fn encode<K: Serialize>(object: &K) -> Result<Value> {
    Ok(serde_json::to_value(object)?)
}

fn decode<K: DeserializeOwned>(value: Value) -> Result<K> {
    Ok(serde_json::from_value(value)?)
}
