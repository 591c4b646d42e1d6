//! VTEP and EVPNControlPlane CRDs
//!
//! A VTEP is bound to exactly one EVPNControlPlane on the same device. The
//! VTEP claims its control plane as controlling owner, so a control plane is
//! never shared by two VTEPs.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, HostReachability, LocalObjectReference, TypedLocalObjectReference};

/// Desired state of a VXLAN tunnel endpoint
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.fabric.dev",
    version = "v1alpha1",
    kind = "VTEP",
    root = "Vtep",
    plural = "vteps",
    shortname = "vtep",
    status = "VtepStatus",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Device","type":"string","jsonPath":".spec.deviceRef.name"}"#,
    printcolumn = r#"{
        "name": "ControlPlane",
        "type": "string",
        "jsonPath": ".spec.controlPlaneRef.name"
    }"#,
    printcolumn = r#"{
        "name": "Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct VtepSpec {
    /// Device this VTEP is configured on. Immutable.
    pub device_ref: LocalObjectReference,

    /// Whether the VTEP is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Loopback interface used as the primary tunnel source
    pub primary_interface_ref: LocalObjectReference,

    /// Loopback interface used as the anycast tunnel source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anycast_interface_ref: Option<LocalObjectReference>,

    /// EVPN control plane this VTEP is bound to
    pub control_plane_ref: LocalObjectReference,

    /// Suppress ARP flooding
    #[serde(default, rename = "suppressARP")]
    pub suppress_arp: bool,

    /// Host reachability protocol
    #[serde(default)]
    pub host_reachability: HostReachability,

    /// Provider-specific configuration, e.g. an `nx` VTEPConfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config_ref: Option<TypedLocalObjectReference>,
}

impl VtepSpec {
    /// Validate an update against the previously stored spec
    pub fn validate_update(&self, old: &VtepSpec) -> Result<(), crate::Error> {
        if self.device_ref != old.device_ref {
            return Err(crate::Error::validation("deviceRef is immutable"));
        }
        Ok(())
    }
}

/// Observed state of a VTEP
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VtepStatus {
    /// Ready, Configured and Operational, in that order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// On-device name of the primary interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_interface_name: Option<String>,

    /// On-device name of the anycast interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anycast_interface_name: Option<String>,

    /// Name of the claimed control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_name: Option<String>,
}

/// EVPN control plane settings consumed by a VTEP
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.fabric.dev",
    version = "v1alpha1",
    kind = "EVPNControlPlane",
    root = "EvpnControlPlane",
    plural = "evpncontrolplanes",
    shortname = "evpn",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Device","type":"string","jsonPath":".spec.deviceRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EvpnControlPlaneSpec {
    /// Device this control plane is configured on
    pub device_ref: LocalObjectReference,

    /// Host reachability protocol
    #[serde(default)]
    pub host_reachability: HostReachability,

    /// Suppress ARP flooding
    #[serde(default, rename = "suppressARP")]
    pub suppress_arp: bool,

    /// Provider-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config_ref: Option<TypedLocalObjectReference>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VtepSpec {
        VtepSpec {
            device_ref: LocalObjectReference::new("leaf1"),
            enabled: true,
            primary_interface_ref: LocalObjectReference::new("lo0"),
            anycast_interface_ref: None,
            control_plane_ref: LocalObjectReference::new("evpn"),
            suppress_arp: false,
            host_reachability: HostReachability::FloodAndLearn,
            provider_config_ref: None,
        }
    }

    #[test]
    fn device_ref_is_immutable() {
        let mut changed = spec();
        changed.device_ref = LocalObjectReference::new("leaf2");
        assert!(changed.validate_update(&spec()).is_err());

        let mut toggled = spec();
        toggled.enabled = false;
        assert!(toggled.validate_update(&spec()).is_ok());
    }

    #[test]
    fn control_plane_ref_is_serialized() {
        let json = serde_json::to_value(spec()).unwrap();
        assert_eq!(json["controlPlaneRef"]["name"], "evpn");
        assert_eq!(json["hostReachability"], "FloodAndLearn");
    }
}
