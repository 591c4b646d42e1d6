//! Watch event routing
//!
//! Dependencies do not know who references them. The [`ReferenceIndex`] keeps
//! that mapping, built from each primary's own reference fields and refreshed
//! on every primary event. Dependency events are looked up in the index and,
//! for claimable dependencies, also routed through their controlling owner
//! reference.
//!
//! Updates that change nothing a pass reads are dropped by a [`SpecFilter`],
//! so status and label churn does not fan out. For primaries that means the
//! spec, finalizers and deletion mark; for dependencies the spec and owner
//! references. A dependency whose only change is a new controlling owner
//! does not wake that owner, which made the change itself.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use super::ObjectKey;
use crate::{Error, Result};

/// API group and kind, without version
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKind {
    /// API group, empty for core
    pub group: String,
    /// Kind
    pub kind: String,
}

impl GroupKind {
    /// Build a group/kind pair
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    /// Group/kind of a static resource type
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self::new(K::group(&()), K::kind(&()))
    }

    /// Group/kind from an `apiVersion` string and a kind
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let group = api_version
            .rsplit_once('/')
            .map(|(group, _)| group)
            .unwrap_or_default();
        Self::new(group, kind)
    }
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// A dependency object, identified across kinds
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyKey {
    /// Kind of the dependency
    pub kind: GroupKind,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl DependencyKey {
    /// Key of a static resource object
    pub fn of<K: Resource<DynamicType = ()>>(object: &K) -> Option<Self> {
        let meta = object.meta();
        Some(Self {
            kind: GroupKind::of::<K>(),
            namespace: meta.namespace.clone()?,
            name: meta.name.clone()?,
        })
    }
}

/// Objects a primary depends on, read from its spec
pub trait References {
    /// `(kind, name)` of every referenced object in the same namespace
    fn references(&self) -> Vec<(GroupKind, String)>;
}

/// Reverse index from dependencies to the primaries referencing them
#[derive(Clone, Default)]
pub struct ReferenceIndex {
    forward: Arc<DashMap<DependencyKey, HashSet<ObjectKey>>>,
    reverse: Arc<DashMap<ObjectKey, Vec<DependencyKey>>>,
}

impl ReferenceIndex {
    /// An empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the dependencies recorded for `primary`; returns the old ones
    pub fn upsert(
        &self,
        primary: ObjectKey,
        dependencies: Vec<DependencyKey>,
    ) -> Vec<DependencyKey> {
        let previous = self.unlink(&primary);
        for dependency in &dependencies {
            self.forward
                .entry(dependency.clone())
                .or_default()
                .insert(primary.clone());
        }
        self.reverse.insert(primary, dependencies);
        previous
    }

    /// Forget `primary`; returns the dependencies it had
    pub fn remove(&self, primary: &ObjectKey) -> Vec<DependencyKey> {
        self.unlink(primary)
    }

    /// Primaries referencing `dependency`, sorted
    pub fn lookup(&self, dependency: &DependencyKey) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self
            .forward
            .get(dependency)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn unlink(&self, primary: &ObjectKey) -> Vec<DependencyKey> {
        let Some((_, previous)) = self.reverse.remove(primary) else {
            return Vec::new();
        };
        for dependency in &previous {
            let now_empty = match self.forward.get_mut(dependency) {
                Some(mut set) => {
                    set.remove(primary);
                    set.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.forward.remove_if(dependency, |_, set| set.is_empty());
            }
        }
        previous
    }
}

/// Last seen value of the watched fields of each object
#[derive(Clone, Default)]
pub struct SpecFilter {
    seen: Arc<DashMap<DependencyKey, Value>>,
}

impl SpecFilter {
    /// An empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value`; `true` when it is new or differs from the last one
    pub fn changed(&self, key: &DependencyKey, value: Value) -> bool {
        match self.seen.insert(key.clone(), value.clone()) {
            Some(previous) => previous != value,
            None => true,
        }
    }

    /// Forget a deleted object
    pub fn forget(&self, key: &DependencyKey) {
        self.seen.remove(key);
    }
}

fn spec_of<K: Serialize>(object: &K) -> Result<Value> {
    Ok(serde_json::to_value(object)?
        .get("spec")
        .cloned()
        .unwrap_or(Value::Null))
}

/// Primaries named by the controlling owner reference, if it is of `owner` kind
///
/// More than one controlling owner means something outside this controller
/// broke the ownership model; that is an invariant violation.
pub fn controller_owner_keys(
    meta: &ObjectMeta,
    namespace: &str,
    owner: &GroupKind,
) -> Result<Vec<ObjectKey>> {
    let controllers: Vec<_> = meta
        .owner_references
        .iter()
        .flatten()
        .filter(|r| r.controller == Some(true))
        .collect();
    if controllers.len() > 1 {
        return Err(Error::invariant(format!(
            "{}/{} has {} controlling owners",
            namespace,
            meta.name.as_deref().unwrap_or_default(),
            controllers.len()
        )));
    }
    Ok(controllers
        .into_iter()
        .filter(|r| GroupKind::from_api_version(&r.api_version, &r.kind) == *owner)
        .map(|r| ObjectKey::new(namespace, r.name.clone()))
        .collect())
}

/// Maps watch events of one primary kind and its dependencies to keys
#[derive(Clone, Default)]
pub struct Router {
    index: ReferenceIndex,
    primaries: SpecFilter,
    specs: SpecFilter,
    owners: SpecFilter,
}

impl Router {
    /// A router with an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// The reference index
    pub fn index(&self) -> &ReferenceIndex {
        &self.index
    }

    /// Index a batch of existing primaries before watches start
    pub fn prime<K>(&self, primaries: &[K]) -> Result<()>
    where
        K: Resource<DynamicType = ()> + References + Serialize,
    {
        for primary in primaries {
            self.primary_applied(primary)?;
        }
        Ok(())
    }

    /// A primary was created or changed
    ///
    /// Primaries still referencing a dependency this one dropped are woken
    /// too, since a claim it held there may now be free. The primary itself
    /// is woken only when its spec, finalizers or deletion mark changed.
    pub fn primary_applied<K>(&self, primary: &K) -> Result<Vec<ObjectKey>>
    where
        K: Resource<DynamicType = ()> + References + Serialize,
    {
        let (Some(key), Some(own)) = (ObjectKey::for_object(primary), DependencyKey::of(primary))
        else {
            return Ok(Vec::new());
        };
        let dependencies: Vec<DependencyKey> = primary
            .references()
            .into_iter()
            .map(|(kind, name)| DependencyKey {
                kind,
                namespace: key.namespace.clone(),
                name,
            })
            .collect();
        let previous = self.index.upsert(key.clone(), dependencies.clone());
        let mut keys: BTreeSet<ObjectKey> = previous
            .iter()
            .filter(|dependency| !dependencies.contains(dependency))
            .flat_map(|dependency| self.index.lookup(dependency))
            .collect();

        let meta = primary.meta();
        let watched = serde_json::json!({
            "spec": spec_of(primary)?,
            "finalizers": meta.finalizers,
            "deleting": meta.deletion_timestamp.is_some(),
        });
        if self.primaries.changed(&own, watched) {
            keys.insert(key);
        } else {
            trace!(name = %key, "status or metadata only, not waking");
        }
        Ok(keys.into_iter().collect())
    }

    /// A primary is gone; wake it and every primary sharing a dependency
    pub fn primary_deleted<K>(&self, primary: &K) -> Vec<ObjectKey>
    where
        K: Resource<DynamicType = ()>,
    {
        let Some(key) = ObjectKey::for_object(primary) else {
            return Vec::new();
        };
        if let Some(own) = DependencyKey::of(primary) {
            self.primaries.forget(&own);
        }
        let mut keys: BTreeSet<ObjectKey> = self
            .index
            .remove(&key)
            .iter()
            .flat_map(|dependency| self.index.lookup(dependency))
            .collect();
        keys.insert(key);
        keys.into_iter().collect()
    }

    /// A dependency was created or changed
    pub fn dependency_applied<D>(
        &self,
        dependency: &D,
        owner: Option<&GroupKind>,
    ) -> Result<Vec<ObjectKey>>
    where
        D: Resource<DynamicType = ()> + Serialize,
    {
        let Some(key) = DependencyKey::of(dependency) else {
            return Ok(Vec::new());
        };
        let meta = dependency.meta();
        let spec_changed = self.specs.changed(&key, spec_of(dependency)?);
        // A released claim must wake the waiters.
        let owners_changed = self
            .owners
            .changed(&key, serde_json::to_value(&meta.owner_references)?);
        if !spec_changed && !owners_changed {
            trace!(kind = %key.kind, name = %key.name, "spec unchanged, dropping event");
            return Ok(Vec::new());
        }
        let mut keys = self.affected(&key, meta, owner)?;
        if !spec_changed {
            if let Some(owner) = owner {
                let holders = controller_owner_keys(meta, &key.namespace, owner)?;
                keys.retain(|k| !holders.contains(k));
            }
        }
        Ok(keys)
    }

    /// A dependency was deleted
    pub fn dependency_deleted<D>(
        &self,
        dependency: &D,
        owner: Option<&GroupKind>,
    ) -> Result<Vec<ObjectKey>>
    where
        D: Resource<DynamicType = ()>,
    {
        let Some(key) = DependencyKey::of(dependency) else {
            return Ok(Vec::new());
        };
        self.specs.forget(&key);
        self.owners.forget(&key);
        self.affected(&key, dependency.meta(), owner)
    }

    fn affected(
        &self,
        key: &DependencyKey,
        meta: &ObjectMeta,
        owner: Option<&GroupKind>,
    ) -> Result<Vec<ObjectKey>> {
        let mut keys: BTreeSet<ObjectKey> = self.index.lookup(key).into_iter().collect();
        if let Some(owner) = owner {
            keys.extend(controller_owner_keys(meta, &key.namespace, owner)?);
        }
        Ok(keys.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AdminState, HostReachability, Interface, InterfaceSpec, InterfaceType,
        LocalObjectReference, Nve, NveSpec, NveStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};

    fn nve(name: &str, source: &str) -> Nve {
        let mut nve = Nve::new(
            name,
            NveSpec {
                device_ref: LocalObjectReference::new("leaf1"),
                admin_state: AdminState::Up,
                source_interface_ref: LocalObjectReference::new(source),
                anycast_source_interface_ref: None,
                suppress_arp: false,
                host_reachability: HostReachability::Bgp,
                multicast_groups: None,
                provider_config_ref: None,
            },
        );
        nve.metadata.namespace = Some("default".to_string());
        nve
    }

    fn interface(name: &str, description: Option<&str>) -> Interface {
        let mut iface = Interface::new(
            name,
            InterfaceSpec {
                device_ref: LocalObjectReference::new("leaf1"),
                name: name.to_string(),
                type_: InterfaceType::Loopback,
                admin_state: AdminState::Up,
                description: description.map(String::from),
            },
        );
        iface.metadata.namespace = Some("default".to_string());
        iface
    }

    fn owner(name: &str, uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "networking.fabric.dev/v1alpha1".to_string(),
            kind: "NVE".to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    mod indexing {
        use super::*;

        #[test]
        fn dependency_event_reaches_referencing_primaries() {
            let router = Router::new();
            router
                .prime(&[nve("a", "lo0"), nve("b", "lo0"), nve("c", "lo1")])
                .unwrap();

            let keys = router
                .dependency_applied(&interface("lo0", None), None)
                .unwrap();
            assert_eq!(
                keys,
                vec![ObjectKey::new("default", "a"), ObjectKey::new("default", "b")]
            );
        }

        #[test]
        fn changed_reference_moves_the_index_entry() {
            let router = Router::new();
            router.primary_applied(&nve("a", "lo0")).unwrap();
            router.primary_applied(&nve("a", "lo1")).unwrap();

            let lo0 = DependencyKey::of(&interface("lo0", None)).unwrap();
            let lo1 = DependencyKey::of(&interface("lo1", None)).unwrap();
            assert!(router.index().lookup(&lo0).is_empty());
            assert_eq!(router.index().lookup(&lo1).len(), 1);
        }

        #[test]
        fn dropped_reference_wakes_remaining_referrers() {
            let router = Router::new();
            router.prime(&[nve("a", "lo0"), nve("b", "lo0")]).unwrap();

            assert_eq!(
                router.primary_applied(&nve("a", "lo1")).unwrap(),
                vec![ObjectKey::new("default", "a"), ObjectKey::new("default", "b")]
            );
        }

        #[test]
        fn deleted_primary_wakes_siblings() {
            let router = Router::new();
            let mut elsewhere = nve("c", "lo1");
            elsewhere.spec.device_ref = LocalObjectReference::new("leaf2");
            router
                .prime(&[nve("a", "lo0"), nve("b", "lo0"), elsewhere])
                .unwrap();

            let keys = router.primary_deleted(&nve("a", "lo0"));
            assert_eq!(
                keys,
                vec![ObjectKey::new("default", "a"), ObjectKey::new("default", "b")]
            );
            let lo0 = DependencyKey::of(&interface("lo0", None)).unwrap();
            assert_eq!(router.index().lookup(&lo0), vec![ObjectKey::new("default", "b")]);
        }
    }

    mod filtering {
        use super::*;

        #[test]
        fn metadata_only_updates_are_dropped() {
            let router = Router::new();
            router.primary_applied(&nve("a", "lo0")).unwrap();

            let first = router.dependency_applied(&interface("lo0", None), None).unwrap();
            assert_eq!(first.len(), 1);

            let mut relabelled = interface("lo0", None);
            relabelled
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert("x".into(), "y".into());
            assert!(router.dependency_applied(&relabelled, None).unwrap().is_empty());

            let described = interface("lo0", Some("uplink source"));
            assert_eq!(router.dependency_applied(&described, None).unwrap().len(), 1);
        }

        #[test]
        fn released_claim_passes() {
            let router = Router::new();
            router.primary_applied(&nve("a", "lo0")).unwrap();

            let mut claimed = interface("lo0", None);
            claimed.metadata.owner_references = Some(vec![owner("b", "uid-b")]);
            assert_eq!(router.dependency_applied(&claimed, None).unwrap().len(), 1);

            let released = interface("lo0", None);
            assert_eq!(router.dependency_applied(&released, None).unwrap().len(), 1);
        }

        #[test]
        fn new_holder_is_not_woken_by_its_own_claim() {
            let router = Router::new();
            router.prime(&[nve("a", "lo0"), nve("b", "lo0")]).unwrap();
            let nve_kind = GroupKind::of::<Nve>();
            let a = ObjectKey::new("default", "a");
            let b = ObjectKey::new("default", "b");

            let free = interface("lo0", None);
            assert_eq!(
                router.dependency_applied(&free, Some(&nve_kind)).unwrap(),
                vec![a.clone(), b.clone()]
            );

            let mut claimed = interface("lo0", None);
            claimed.metadata.owner_references = Some(vec![owner("a", "uid-a")]);
            assert_eq!(
                router.dependency_applied(&claimed, Some(&nve_kind)).unwrap(),
                vec![b.clone()]
            );

            assert_eq!(
                router.dependency_applied(&free, Some(&nve_kind)).unwrap(),
                vec![a, b]
            );
        }

        #[test]
        fn primary_status_writes_are_dropped() {
            let router = Router::new();
            let a = ObjectKey::new("default", "a");
            assert_eq!(router.primary_applied(&nve("a", "lo0")).unwrap(), vec![a.clone()]);

            let mut reported = nve("a", "lo0");
            reported.status = Some(NveStatus {
                source_interface_name: Some("loopback0".to_string()),
                ..Default::default()
            });
            reported
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert("networking.fabric.dev/device-name".into(), "leaf1".into());
            assert!(router.primary_applied(&reported).unwrap().is_empty());

            let mut deleting = reported.clone();
            deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            assert_eq!(router.primary_applied(&deleting).unwrap(), vec![a]);
        }

        #[test]
        fn deletes_always_pass() {
            let router = Router::new();
            router.primary_applied(&nve("a", "lo0")).unwrap();
            router.dependency_applied(&interface("lo0", None), None).unwrap();
            assert_eq!(
                router.dependency_deleted(&interface("lo0", None), None).unwrap().len(),
                1
            );
            let recreated = router.dependency_applied(&interface("lo0", None), None).unwrap();
            assert_eq!(recreated.len(), 1);
        }
    }

    mod owners {
        use super::*;

        #[test]
        fn controlling_owner_of_matching_kind_is_routed() {
            let nve_kind = GroupKind::of::<Nve>();
            let meta = ObjectMeta {
                name: Some("cfg".to_string()),
                owner_references: Some(vec![owner("a", "uid-a")]),
                ..Default::default()
            };
            assert_eq!(
                controller_owner_keys(&meta, "default", &nve_kind).unwrap(),
                vec![ObjectKey::new("default", "a")]
            );

            let other = GroupKind::new("example.com", "Widget");
            assert!(controller_owner_keys(&meta, "default", &other).unwrap().is_empty());
        }

        #[test]
        fn two_controlling_owners_are_fatal() {
            let meta = ObjectMeta {
                name: Some("cfg".to_string()),
                owner_references: Some(vec![owner("a", "uid-a"), owner("b", "uid-b")]),
                ..Default::default()
            };
            let err = controller_owner_keys(&meta, "default", &GroupKind::of::<Nve>()).unwrap_err();
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn group_kind_parses_api_version() {
        let gk = GroupKind::from_api_version("nx.networking.fabric.dev/v1alpha1", "NVEConfig");
        assert_eq!(gk.group, "nx.networking.fabric.dev");
        assert_eq!(gk.to_string(), "NVEConfig.nx.networking.fabric.dev");
        assert_eq!(GroupKind::from_api_version("v1", "ConfigMap").group, "");
    }
}
