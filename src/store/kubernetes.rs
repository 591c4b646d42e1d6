//! Kubernetes-backed object store

use async_trait::async_trait;
use kube::api::{DeleteParams, DynamicObject, ListParams, PostParams};
use kube::core::ApiResource;
use kube::{Api, Client};
use serde_json::Value;
use tracing::debug;

use super::ObjectStore;
use crate::{Error, Result};

/// [`ObjectStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

fn identity(object: &DynamicObject) -> Result<(String, String)> {
    let name = object
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::store("object has no name"))?;
    let namespace = object
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| Error::store(format!("object {name} has no namespace")))?;
    Ok((namespace, name))
}

/// Body of a status replace
///
/// The whole object is sent so a field missing from `status` is cleared on
/// the server, and its resourceVersion makes the write conditional.
fn status_body(object: &DynamicObject) -> Result<Vec<u8>> {
    if object.metadata.resource_version.is_none() {
        let name = object.metadata.name.clone().unwrap_or_default();
        return Err(Error::store(format!("status write for {name} has no resourceVersion")));
    }
    Ok(serde_json::to_vec(object)?)
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        let object = self
            .api(resource, Some(namespace))
            .get_opt(name)
            .await
            .map_err(Error::from_kube)?;
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
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(selector);
        }
        let list = self
            .api(resource, namespace)
            .list(&params)
            .await
            .map_err(Error::from_kube)?;
        list.items
            .into_iter()
            .map(|o| serde_json::to_value(o).map_err(Error::from))
            .collect()
    }

    async fn create(&self, resource: &ApiResource, object: Value) -> Result<Value> {
        let object: DynamicObject = serde_json::from_value(object)?;
        let (namespace, _) = identity(&object)?;
        let created = self
            .api(resource, Some(&namespace))
            .create(&PostParams::default(), &object)
            .await
            .map_err(Error::from_kube)?;
        Ok(serde_json::to_value(created)?)
    }

    async fn update(&self, resource: &ApiResource, object: Value) -> Result<Value> {
        let object: DynamicObject = serde_json::from_value(object)?;
        let (namespace, name) = identity(&object)?;
        debug!(kind = %resource.kind, namespace = %namespace, name = %name, "replacing object");
        let updated = self
            .api(resource, Some(&namespace))
            .replace(&name, &PostParams::default(), &object)
            .await
            .map_err(Error::from_kube)?;
        Ok(serde_json::to_value(updated)?)
    }

    async fn update_status(&self, resource: &ApiResource, object: Value) -> Result<Value> {
        let object: DynamicObject = serde_json::from_value(object)?;
        let (namespace, name) = identity(&object)?;
        debug!(kind = %resource.kind, namespace = %namespace, name = %name, "replacing status");
        let updated = self
            .api(resource, Some(&namespace))
            .replace_status(&name, &PostParams::default(), status_body(&object)?)
            .await
            .map_err(Error::from_kube)?;
        Ok(serde_json::to_value(updated)?)
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(resource, Some(namespace))
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::from_kube(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nve_with_status(status: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "networking.fabric.dev/v1alpha1",
            "kind": "NVE",
            "metadata": { "name": "nve1", "namespace": "default", "resourceVersion": "7" },
            "spec": { "deviceRef": { "name": "leaf1" } },
            "status": status,
        }))
        .unwrap()
    }

    #[test]
    fn status_body_carries_the_full_status() {
        let object = nve_with_status(json!({ "conditions": [] }));
        let body: Value = serde_json::from_slice(&status_body(&object).unwrap()).unwrap();

        assert_eq!(body["metadata"]["resourceVersion"], "7");
        assert_eq!(body["status"], json!({ "conditions": [] }));
        // A field dropped from status is absent, so the replace clears it.
        assert!(body["status"].get("sourceInterfaceName").is_none());
    }

    #[test]
    fn status_body_requires_a_resource_version() {
        let mut object = nve_with_status(json!({}));
        object.metadata.resource_version = None;
        assert!(status_body(&object).is_err());
    }
}
