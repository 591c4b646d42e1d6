//! Device and Interface CRDs
//!
//! Devices and interfaces are inventory objects. They are never driven by the
//! engine; tunnel endpoints depend on them and resolve them by reference.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AdminState, LocalObjectReference};

/// A network device reachable through a provider
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.fabric.dev",
    version = "v1alpha1",
    kind = "Device",
    plural = "devices",
    shortname = "dev",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".spec.endpoint.address"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    /// Management endpoint of the device
    pub endpoint: Endpoint,
}

/// Management endpoint used to open provider connections
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Address (IP or hostname) of the management interface
    pub address: String,

    /// Port of the management API, provider default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Interface kinds known to the fabric
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InterfaceType {
    /// Front-panel port
    #[default]
    Physical,
    /// Loopback interface
    Loopback,
    /// Port channel / LAG
    Aggregate,
    /// Routed VLAN interface (SVI)
    #[serde(rename = "RoutedVLAN")]
    RoutedVlan,
}

impl std::fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Physical => write!(f, "Physical"),
            Self::Loopback => write!(f, "Loopback"),
            Self::Aggregate => write!(f, "Aggregate"),
            Self::RoutedVlan => write!(f, "RoutedVLAN"),
        }
    }
}

/// An interface on a device
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.fabric.dev",
    version = "v1alpha1",
    kind = "Interface",
    plural = "interfaces",
    shortname = "iface",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Device","type":"string","jsonPath":".spec.deviceRef.name"}"#,
    printcolumn = r#"{"name":"Name","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceSpec {
    /// Device this interface belongs to
    pub device_ref: LocalObjectReference,

    /// Name of the interface on the device, e.g. `lo0`
    pub name: String,

    /// Interface type
    #[serde(rename = "type")]
    pub type_: InterfaceType,

    /// Administrative state
    #[serde(default)]
    pub admin_state: AdminState,

    /// Free-form description pushed to the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::{CustomResourceExt, Resource};

    #[test]
    fn interface_spec_uses_type_key() {
        let spec = InterfaceSpec {
            device_ref: LocalObjectReference::new("leaf1"),
            name: "lo0".to_string(),
            type_: InterfaceType::Loopback,
            admin_state: AdminState::Up,
            description: None,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "Loopback");
        assert_eq!(json["deviceRef"]["name"], "leaf1");
        assert!(json.get("description").is_none());
    }

    #[test]
    fn crds_are_namespaced_in_fabric_group() {
        let crd = Device::crd();
        assert_eq!(crd.spec.group, "networking.fabric.dev");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(Interface::kind(&()), "Interface");
    }
}
