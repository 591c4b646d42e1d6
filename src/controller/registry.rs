//! Provider configuration registry
//!
//! Maps the `(group, version, kind)` of a `providerConfigRef` onto a
//! [`ProviderConfigKind`] and records which primary kinds each config kind
//! may serve. The registry is built once at startup and handed to the
//! resolver; nothing registers itself.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ApiResource;
use kube::Resource;

use crate::crd::{NveConfig, TypedLocalObjectReference, VtepConfig};
use crate::provider::ManagedKind;
use crate::store::Store;
use crate::Result;

/// Provider config kinds known to this build
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderConfigKind {
    /// `nx.networking.fabric.dev` NVEConfig
    NxNveConfig,
    /// `nx.networking.fabric.dev` VTEPConfig
    NxVtepConfig,
}

impl ProviderConfigKind {
    /// API resource of this kind
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::NxNveConfig => ApiResource::erase::<NveConfig>(&()),
            Self::NxVtepConfig => ApiResource::erase::<VtepConfig>(&()),
        }
    }

    /// Fetch a config of this kind from the store
    pub async fn fetch(
        &self,
        store: &Store,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ProviderConfig>> {
        Ok(match self {
            Self::NxNveConfig => store
                .get::<NveConfig>(namespace, name)
                .await?
                .map(ProviderConfig::NxNve),
            Self::NxVtepConfig => store
                .get::<VtepConfig>(namespace, name)
                .await?
                .map(ProviderConfig::NxVtep),
        })
    }
}

impl std::fmt::Display for ProviderConfigKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resource = self.api_resource();
        write!(f, "{}.{}", resource.kind, resource.group)
    }
}

/// A resolved provider config object
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderConfig {
    /// NX-OS NVE settings
    NxNve(NveConfig),
    /// NX-OS VTEP settings
    NxVtep(VtepConfig),
}

impl ProviderConfig {
    /// Device the config belongs to
    pub fn device_name(&self) -> &str {
        match self {
            Self::NxNve(c) => &c.spec.device_ref.name,
            Self::NxVtep(c) => &c.spec.device_ref.name,
        }
    }

    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::NxNve(c) => c.meta(),
            Self::NxVtep(c) => c.meta(),
        }
    }

    /// Mutable object metadata
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::NxNve(c) => c.meta_mut(),
            Self::NxVtep(c) => c.meta_mut(),
        }
    }

    /// Persist metadata changes
    pub async fn update(&self, store: &Store) -> Result<Self> {
        Ok(match self {
            Self::NxNve(c) => Self::NxNve(store.update(c).await?),
            Self::NxVtep(c) => Self::NxVtep(store.update(c).await?),
        })
    }
}

#[derive(Clone, Debug)]
struct Entry {
    kind: ProviderConfigKind,
    resource: ApiResource,
    serves: Vec<ManagedKind>,
}

/// Lookup table from typed references to provider config kinds
#[derive(Clone, Debug, Default)]
pub struct ProviderConfigRegistry {
    entries: Vec<Entry>,
}

impl ProviderConfigRegistry {
    /// A registry that knows no kinds
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every config kind compiled into this build
    pub fn builtin() -> Self {
        Self::empty()
            .register(ProviderConfigKind::NxNveConfig, &[ManagedKind::Nve])
            .register(ProviderConfigKind::NxVtepConfig, &[ManagedKind::Vtep])
    }

    /// Register `kind` as usable by the `serves` primary kinds
    ///
    /// Registering a kind twice widens the set of primaries it serves.
    pub fn register(mut self, kind: ProviderConfigKind, serves: &[ManagedKind]) -> Self {
        match self.entries.iter_mut().find(|e| e.kind == kind) {
            Some(entry) => {
                for primary in serves {
                    if !entry.serves.contains(primary) {
                        entry.serves.push(*primary);
                    }
                }
            }
            None => self.entries.push(Entry {
                kind,
                resource: kind.api_resource(),
                serves: serves.to_vec(),
            }),
        }
        self
    }

    /// Config kind a reference names, if registered, regardless of primary
    pub fn kind_of(&self, reference: &TypedLocalObjectReference) -> Option<ProviderConfigKind> {
        self.entries
            .iter()
            .find(|e| {
                e.resource.group == reference.group()
                    && e.resource.version == reference.version()
                    && e.resource.kind == reference.kind
            })
            .map(|e| e.kind)
    }

    /// Config kind a reference names, if registered for `primary`
    pub fn lookup(
        &self,
        reference: &TypedLocalObjectReference,
        primary: ManagedKind,
    ) -> Option<ProviderConfigKind> {
        let kind = self.kind_of(reference)?;
        self.entries
            .iter()
            .any(|e| e.kind == kind && e.serves.contains(&primary))
            .then_some(kind)
    }

    /// Registered kinds serving `primary`
    pub fn kinds_for(&self, primary: ManagedKind) -> Vec<ProviderConfigKind> {
        self.entries
            .iter()
            .filter(|e| e.serves.contains(&primary))
            .map(|e| e.kind)
            .collect()
    }
}
