//! Custom Resource Definitions for the fabric operator
//!
//! Core kinds live in `networking.fabric.dev/v1alpha1`; provider-specific
//! configuration kinds live in their own group (e.g. `nx.networking.fabric.dev`).

mod device;
mod nve;
mod nx;
mod types;
mod vtep;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use device::{Device, DeviceSpec, Endpoint, Interface, InterfaceSpec, InterfaceType};
pub use nve::{MulticastGroups, Nve, NveSpec, NveStatus};
pub use nx::{
    validate_infra_vlans, NveConfig, NveConfigSpec, VlanListItem, VtepConfig, VtepConfigSpec,
    MAX_TOTAL_VLANS, MAX_VLAN_ID,
};
pub use types::{
    AdminState, Condition, ConditionStatus, HostReachability, LocalObjectReference,
    TypedLocalObjectReference,
};
pub use vtep::{EvpnControlPlane, EvpnControlPlaneSpec, Vtep, VtepSpec, VtepStatus};

/// Every CRD served by the operator, in installation order
pub fn all() -> Vec<CustomResourceDefinition> {
    vec![
        Device::crd(),
        Interface::crd(),
        EvpnControlPlane::crd(),
        NveConfig::crd(),
        VtepConfig::crd(),
        Nve::crd(),
        Vtep::crd(),
    ]
}
