//! NVE CRD: the network virtualization edge of a device

use std::net::IpAddr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    AdminState, Condition, HostReachability, LocalObjectReference, TypedLocalObjectReference,
};

/// Desired state of the tunnel endpoint of a device
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.fabric.dev",
    version = "v1alpha1",
    kind = "NVE",
    root = "Nve",
    plural = "nves",
    shortname = "nve",
    status = "NveStatus",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Device","type":"string","jsonPath":".spec.deviceRef.name"}"#,
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".status.sourceInterfaceName"}"#,
    printcolumn = r#"{
        "name": "Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status"
    }"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NveSpec {
    /// Device this NVE is configured on. Immutable.
    pub device_ref: LocalObjectReference,

    /// Administrative state of the NVE interface
    #[serde(default)]
    pub admin_state: AdminState,

    /// Loopback interface used as the tunnel source
    pub source_interface_ref: LocalObjectReference,

    /// Loopback interface used as the anycast (vPC) tunnel source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anycast_source_interface_ref: Option<LocalObjectReference>,

    /// Suppress ARP flooding for hosts learned through the control plane
    #[serde(default, rename = "suppressARP")]
    pub suppress_arp: bool,

    /// Host reachability protocol
    #[serde(default)]
    pub host_reachability: HostReachability,

    /// Multicast groups used for BUM traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multicast_groups: Option<MulticastGroups>,

    /// Provider-specific configuration, e.g. an `nx` NVEConfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config_ref: Option<TypedLocalObjectReference>,
}

/// Multicast group addresses for layer 2 and layer 3 VNIs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MulticastGroups {
    /// Group for L2 VNIs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l2: Option<String>,

    /// Group for L3 VNIs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3: Option<String>,
}

impl NveSpec {
    /// Validate the spec at admission time
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(groups) = &self.multicast_groups {
            for group in [&groups.l2, &groups.l3].into_iter().flatten() {
                if !is_multicast(group) {
                    return Err(crate::Error::validation(format!(
                        "{group:?} is not a multicast address"
                    )));
                }
            }
        }

        if let Some(anycast) = &self.anycast_source_interface_ref {
            if anycast.name == self.source_interface_ref.name {
                return Err(crate::Error::validation(
                    "anycastSourceInterfaceRef must differ from sourceInterfaceRef",
                ));
            }
        }

        Ok(())
    }

    /// Validate an update against the previously stored spec
    pub fn validate_update(&self, old: &NveSpec) -> Result<(), crate::Error> {
        if self.device_ref != old.device_ref {
            return Err(crate::Error::validation("deviceRef is immutable"));
        }
        self.validate()
    }
}

fn is_multicast(value: &str) -> bool {
    value
        .parse::<IpAddr>()
        .map(|addr| addr.is_multicast())
        .unwrap_or(false)
}

/// Observed state of an NVE
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NveStatus {
    /// Ready, Configured and Operational, in that order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// On-device name of the resolved source interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_interface_name: Option<String>,

    /// On-device name of the resolved anycast source interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anycast_source_interface_name: Option<String>,

    /// Host reachability last pushed to the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_reachability: Option<HostReachability>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn spec() -> NveSpec {
        NveSpec {
            device_ref: LocalObjectReference::new("leaf1"),
            admin_state: AdminState::Up,
            source_interface_ref: LocalObjectReference::new("lo0"),
            anycast_source_interface_ref: Some(LocalObjectReference::new("lo1")),
            suppress_arp: true,
            host_reachability: HostReachability::Bgp,
            multicast_groups: None,
            provider_config_ref: None,
        }
    }

    #[rstest]
    #[case(Some("234.0.0.1"), None, true)]
    #[case(None, Some("ff02::1"), true)]
    #[case(Some("10.0.0.1"), None, false)]
    #[case(None, Some("not-an-ip"), false)]
    fn multicast_groups_must_be_multicast(
        #[case] l2: Option<&str>,
        #[case] l3: Option<&str>,
        #[case] ok: bool,
    ) {
        let mut spec = spec();
        spec.multicast_groups = Some(MulticastGroups {
            l2: l2.map(String::from),
            l3: l3.map(String::from),
        });
        assert_eq!(spec.validate().is_ok(), ok);
    }

    #[test]
    fn source_and_anycast_must_differ() {
        let mut spec = spec();
        spec.anycast_source_interface_ref = Some(LocalObjectReference::new("lo0"));
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn device_ref_is_immutable() {
        let old = spec();
        let mut new = spec();
        new.device_ref = LocalObjectReference::new("leaf2");
        assert!(new.validate_update(&old).is_err());
        assert!(spec().validate_update(&old).is_ok());
    }

    #[test]
    fn spec_uses_wire_names() {
        let json = serde_json::to_value(spec()).unwrap();
        assert_eq!(json["suppressARP"], true);
        assert_eq!(json["hostReachability"], "BGP");
        assert_eq!(json["anycastSourceInterfaceRef"]["name"], "lo1");
    }
}
