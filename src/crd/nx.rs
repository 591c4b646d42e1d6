//! Cisco NX-OS provider configuration CRDs
//!
//! These kinds carry settings that only the NX-OS provider understands. A
//! primary object points at one of them through its `providerConfigRef`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::LocalObjectReference;

/// Highest VLAN ID usable as an infrastructure VLAN
pub const MAX_VLAN_ID: u16 = 3967;

/// Maximum number of infrastructure VLANs across all ranges
pub const MAX_TOTAL_VLANS: u32 = 512;

/// Valid range for `holdDownTime` in seconds
pub const HOLD_DOWN_TIME_RANGE: std::ops::RangeInclusive<u16> = 1..=1500;

/// NX-OS specific NVE settings
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "nx.networking.fabric.dev",
    version = "v1alpha1",
    kind = "NVEConfig",
    root = "NveConfig",
    plural = "nveconfigs",
    shortname = "nvecfg",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Device","type":"string","jsonPath":".spec.deviceRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NveConfigSpec {
    /// Device this configuration applies to
    pub device_ref: LocalObjectReference,

    /// Equivalent to `advertise virtual-rmac`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_virtual_mac: Option<bool>,

    /// Equivalent to `source-interface hold-down-time`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_down_time: Option<u16>,

    /// Infrastructure VLANs, equivalent to `system nve infra-vlans`
    #[serde(default, rename = "infraVLANs", skip_serializing_if = "Vec::is_empty")]
    pub infra_vlans: Vec<VlanListItem>,
}

impl NveConfigSpec {
    /// Validate the spec at admission time
    pub fn validate(&self) -> Result<(), crate::Error> {
        validate_hold_down_time(self.hold_down_time)?;
        validate_infra_vlans(&self.infra_vlans)
    }
}

/// NX-OS specific VTEP settings
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "nx.networking.fabric.dev",
    version = "v1alpha1",
    kind = "VTEPConfig",
    root = "VtepConfig",
    plural = "vtepconfigs",
    shortname = "vtepcfg",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Device","type":"string","jsonPath":".spec.deviceRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VtepConfigSpec {
    /// Device this configuration applies to
    pub device_ref: LocalObjectReference,

    /// Equivalent to `advertise virtual-rmac`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_virtual_mac: Option<bool>,

    /// Equivalent to `source-interface hold-down-time`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_down_time: Option<u16>,

    /// Infrastructure VLANs for ingress replication
    #[serde(default, rename = "infraVLANs", skip_serializing_if = "Vec::is_empty")]
    pub infra_vlans: Vec<VlanListItem>,
}

impl VtepConfigSpec {
    /// Validate the spec at admission time
    pub fn validate(&self) -> Result<(), crate::Error> {
        validate_hold_down_time(self.hold_down_time)?;
        validate_infra_vlans(&self.infra_vlans)
    }
}

/// A single VLAN ID or an inclusive range of VLAN IDs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VlanListItem {
    /// Single VLAN ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u16>,

    /// First VLAN of the range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_min: Option<u16>,

    /// Last VLAN of the range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_max: Option<u16>,
}

impl VlanListItem {
    /// A single VLAN
    pub fn single(id: u16) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    /// An inclusive VLAN range
    pub fn range(min: u16, max: u16) -> Self {
        Self {
            id: None,
            range_min: Some(min),
            range_max: Some(max),
        }
    }

    /// Inclusive bounds of this item
    pub fn bounds(&self) -> Result<(u16, u16), crate::Error> {
        match (self.id, self.range_min, self.range_max) {
            (Some(id), None, None) => Ok((id, id)),
            (None, Some(min), Some(max)) => Ok((min, max)),
            _ => Err(crate::Error::validation(
                "a VLAN item sets either id or both rangeMin and rangeMax",
            )),
        }
    }
}

fn validate_hold_down_time(value: Option<u16>) -> Result<(), crate::Error> {
    match value {
        Some(v) if !HOLD_DOWN_TIME_RANGE.contains(&v) => Err(crate::Error::validation(format!(
            "holdDownTime {v} must be between {} and {}",
            HOLD_DOWN_TIME_RANGE.start(),
            HOLD_DOWN_TIME_RANGE.end()
        ))),
        _ => Ok(()),
    }
}

/// Check a list of VLAN items for inverted, out-of-range and overlapping
/// entries and enforce the aggregate cap of [`MAX_TOTAL_VLANS`].
pub fn validate_infra_vlans(items: &[VlanListItem]) -> Result<(), crate::Error> {
    let mut ranges = Vec::with_capacity(items.len());
    for item in items {
        let (start, end) = item.bounds()?;
        if end < start {
            return Err(crate::Error::validation(format!(
                "range end < start in ({start}-{end})"
            )));
        }
        if start == 0 || end > MAX_VLAN_ID {
            return Err(crate::Error::validation(format!(
                "vlan range ({start}-{end}) outside 1-{MAX_VLAN_ID}"
            )));
        }
        ranges.push((start, end));
    }

    ranges.sort_unstable();

    let mut total: u32 = 0;
    for (i, &(start, end)) in ranges.iter().enumerate() {
        if i > 0 {
            let (prev_start, prev_end) = ranges[i - 1];
            if start <= prev_end {
                return Err(crate::Error::validation(format!(
                    "overlapping vlan ranges ({prev_start}-{prev_end}) and ({start}-{end})"
                )));
            }
        }
        total += u32::from(end - start) + 1;
        if total > MAX_TOTAL_VLANS {
            return Err(crate::Error::validation(format!(
                "total number of vlans exceeds maximum of {MAX_TOTAL_VLANS}"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn disjoint_ranges_are_accepted() {
        let items = vec![VlanListItem::single(100), VlanListItem::range(300, 400)];
        assert!(validate_infra_vlans(&items).is_ok());
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let items = vec![VlanListItem::range(100, 200), VlanListItem::range(150, 250)];
        let err = validate_infra_vlans(&items).unwrap_err();
        assert!(err.to_string().contains("overlapping"));
    }

    #[test]
    fn overlap_is_detected_regardless_of_order() {
        let items = vec![VlanListItem::range(150, 250), VlanListItem::single(200)];
        assert!(validate_infra_vlans(&items).is_err());
    }

    #[rstest]
    #[case(vec![VlanListItem::range(1, 513)])]
    #[case(vec![VlanListItem::range(1, 300), VlanListItem::range(1000, 1300)])]
    fn aggregate_cap_applies_even_without_overlap(#[case] items: Vec<VlanListItem>) {
        let err = validate_infra_vlans(&items).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum of 512"));
    }

    #[test]
    fn exactly_the_cap_is_accepted() {
        let items = vec![VlanListItem::range(1, 256), VlanListItem::range(1001, 1256)];
        assert!(validate_infra_vlans(&items).is_ok());
    }

    #[rstest]
    #[case(VlanListItem::range(400, 300), "end < start")]
    #[case(VlanListItem::single(0), "outside")]
    #[case(VlanListItem::single(4000), "outside")]
    #[case(VlanListItem { id: Some(1), range_min: Some(1), range_max: None }, "either id")]
    fn malformed_items_are_rejected(#[case] item: VlanListItem, #[case] expected: &str) {
        let err = validate_infra_vlans(&[item]).unwrap_err();
        assert!(err.to_string().contains(expected), "{err}");
    }

    #[test]
    fn hold_down_time_is_bounded() {
        let mut spec = NveConfigSpec {
            device_ref: LocalObjectReference::new("leaf1"),
            advertise_virtual_mac: Some(true),
            hold_down_time: Some(0),
            infra_vlans: vec![],
        };
        assert!(spec.validate().is_err());
        spec.hold_down_time = Some(300);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn infra_vlans_use_wire_name() {
        let spec = VtepConfigSpec {
            device_ref: LocalObjectReference::new("leaf1"),
            advertise_virtual_mac: None,
            hold_down_time: None,
            infra_vlans: vec![VlanListItem::range(10, 20)],
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["infraVLANs"][0]["rangeMin"], 10);
    }
}
