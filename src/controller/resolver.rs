//! Dependency resolution
//!
//! Fetches the objects a primary references and checks that they are usable:
//! present, of the right type, on the same device, and not claimed by another
//! primary. Every failure here is a [`DependencyError`] that the engine turns
//! into a `Configured=False` condition. Store failures pass through untouched
//! as [`crate::Error`] so the pass is retried.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use thiserror::Error;
use tracing::{debug, info};

use super::ownership::{remove_owner_reference, set_controller_reference, OwnershipError};
use super::registry::{ProviderConfig, ProviderConfigRegistry};
use crate::conditions::Reason;
use crate::crd::{
    Device, EvpnControlPlane, Interface, InterfaceType, LocalObjectReference, Nve,
    TypedLocalObjectReference, Vtep,
};
use crate::provider::ManagedKind;
use crate::runtime::{GroupKind, References};
use crate::store::{Store, StoredObject};
use crate::{Error, Result};

/// Why a referenced object cannot be used
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DependencyError {
    /// The object does not exist yet
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Name of the missing object
        name: String,
    },

    /// An interface exists but has the wrong type for its role
    #[error("interface {name} has type {actual}, expected {expected}")]
    InvalidInterfaceType {
        /// Interface object name
        name: String,
        /// Required type
        expected: InterfaceType,
        /// Actual type
        actual: InterfaceType,
    },

    /// The object belongs to a different device than the primary
    #[error("{kind} {name} belongs to device {actual}, expected {expected}")]
    CrossDeviceReference {
        /// Kind of the referenced object
        kind: String,
        /// Name of the referenced object
        name: String,
        /// Device of the primary
        expected: String,
        /// Device of the referenced object
        actual: String,
    },

    /// The provider config reference names a kind not usable for this primary
    #[error("{kind} ({api_version}) {name} cannot configure a {primary}")]
    IncompatibleProviderConfig {
        /// `apiVersion` from the reference
        api_version: String,
        /// Kind from the reference
        kind: String,
        /// Name from the reference
        name: String,
        /// Kind of the referencing primary
        primary: ManagedKind,
    },

    /// Another primary controls the object
    #[error("{kind} {name} is already claimed by {owner}")]
    AlreadyClaimed {
        /// Kind of the claimed object
        kind: String,
        /// Name of the claimed object
        name: String,
        /// Name of the current owner
        owner: String,
    },

    /// The device already carries an NVE
    #[error("device {device} already has NVE {existing}")]
    NveAlreadyExists {
        /// Device both NVEs point at
        device: String,
        /// The NVE that keeps the device
        existing: String,
    },
}

impl DependencyError {
    /// Condition reason reported for this error
    pub fn reason(&self) -> Reason {
        match self {
            Self::NotFound { .. } => Reason::WaitingForDependencies,
            Self::InvalidInterfaceType { .. } => Reason::InvalidInterfaceType,
            Self::CrossDeviceReference { .. } => Reason::CrossDeviceReference,
            Self::IncompatibleProviderConfig { .. } => Reason::IncompatibleProviderConfigRef,
            Self::AlreadyClaimed { kind, .. } if kind == EvpnControlPlane::kind(&()).as_ref() => {
                Reason::ControlPlaneAlreadyClaimed
            }
            Self::AlreadyClaimed { .. } => Reason::ProviderConfigAlreadyClaimed,
            Self::NveAlreadyExists { .. } => Reason::NveConfigAlreadyExists,
        }
    }

    fn not_found<K: Resource<DynamicType = ()>>(name: &str) -> Self {
        Self::NotFound {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
        }
    }
}

fn same_device<K: Resource<DynamicType = ()>>(
    object: &K,
    actual: &str,
    expected: &str,
) -> Result<()> {
    if actual == expected {
        return Ok(());
    }
    Err(DependencyError::CrossDeviceReference {
        kind: K::kind(&()).to_string(),
        name: object.meta().name.clone().unwrap_or_default(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
    .into())
}

/// Resolves and claims the dependencies of primary objects
#[derive(Clone)]
pub struct Resolver {
    store: Store,
    registry: Arc<ProviderConfigRegistry>,
}

impl Resolver {
    /// Create a resolver over `store` using `registry` for provider configs
    pub fn new(store: Store, registry: Arc<ProviderConfigRegistry>) -> Self {
        Self { store, registry }
    }

    /// The provider config registry
    pub fn registry(&self) -> &ProviderConfigRegistry {
        &self.registry
    }

    /// Resolve the Device a primary lives on
    pub async fn device(
        &self,
        namespace: &str,
        reference: &LocalObjectReference,
    ) -> Result<Device> {
        self.store
            .get::<Device>(namespace, &reference.name)
            .await?
            .ok_or_else(|| DependencyError::not_found::<Device>(&reference.name).into())
    }

    /// Resolve an Interface that must have `required` type and sit on `device`
    pub async fn interface(
        &self,
        namespace: &str,
        reference: &LocalObjectReference,
        device: &str,
        required: InterfaceType,
    ) -> Result<Interface> {
        let interface = self
            .store
            .get::<Interface>(namespace, &reference.name)
            .await?
            .ok_or_else(|| Error::from(DependencyError::not_found::<Interface>(&reference.name)))?;

        if interface.spec.type_ != required {
            return Err(DependencyError::InvalidInterfaceType {
                name: reference.name.clone(),
                expected: required,
                actual: interface.spec.type_,
            }
            .into());
        }
        same_device(&interface, &interface.spec.device_ref.name, device)?;
        Ok(interface)
    }

    /// Resolve the EVPN control plane a VTEP is bound to
    pub async fn control_plane(
        &self,
        namespace: &str,
        reference: &LocalObjectReference,
        device: &str,
    ) -> Result<EvpnControlPlane> {
        let control_plane = self
            .store
            .get::<EvpnControlPlane>(namespace, &reference.name)
            .await?
            .ok_or_else(|| {
                Error::from(DependencyError::not_found::<EvpnControlPlane>(&reference.name))
            })?;
        same_device(&control_plane, &control_plane.spec.device_ref.name, device)?;
        Ok(control_plane)
    }

    /// Resolve a polymorphic provider config reference for a `primary`
    pub async fn provider_config(
        &self,
        namespace: &str,
        reference: &TypedLocalObjectReference,
        device: &str,
        primary: ManagedKind,
    ) -> Result<ProviderConfig> {
        let kind = self.registry.lookup(reference, primary).ok_or_else(|| {
            Error::from(DependencyError::IncompatibleProviderConfig {
                api_version: reference.api_version.clone(),
                kind: reference.kind.clone(),
                name: reference.name.clone(),
                primary,
            })
        })?;

        let config = kind
            .fetch(&self.store, namespace, &reference.name)
            .await?
            .ok_or_else(|| {
                Error::from(DependencyError::NotFound {
                    kind: reference.kind.clone(),
                    name: reference.name.clone(),
                })
            })?;

        if config.device_name() != device {
            return Err(DependencyError::CrossDeviceReference {
                kind: reference.kind.clone(),
                name: reference.name.clone(),
                expected: device.to_string(),
                actual: config.device_name().to_string(),
            }
            .into());
        }
        Ok(config)
    }

    /// Check that `nve` is the only NVE on `device`
    ///
    /// The oldest NVE that is not being deleted keeps the device, ties going
    /// to the lower name; every other one fails with
    /// [`DependencyError::NveAlreadyExists`].
    pub async fn sole_nve(&self, nve: &Nve, device: &str) -> Result<()> {
        let namespace = nve.namespace().unwrap_or_default();
        let rank = |n: &Nve| {
            let created = n.metadata.creation_timestamp.as_ref().map(|t| t.0);
            (created, n.name_any())
        };
        let mine = rank(nve);
        let earlier = self
            .store
            .list::<Nve>(Some(&namespace), None)
            .await?
            .into_iter()
            .filter(|other| other.spec.device_ref.name == device)
            .filter(|other| other.metadata.deletion_timestamp.is_none())
            .filter(|other| other.uid() != nve.uid())
            .filter(|other| rank(other) < mine)
            .min_by_key(rank);
        match earlier {
            Some(existing) => Err(DependencyError::NveAlreadyExists {
                device: device.to_string(),
                existing: existing.name_any(),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Make `owner` the controlling owner of `target`
    ///
    /// A claim held by a primary that no longer exists, or no longer
    /// references the target, is taken over. A live
    /// claim by someone else fails with [`DependencyError::AlreadyClaimed`].
    /// The write carries the target's resourceVersion, so of two concurrent
    /// claimants one gets [`Error::Conflict`] and retries into the error.
    pub async fn claim<K: StoredObject>(&self, owner: &OwnerReference, target: &K) -> Result<K> {
        let mut claimed = target.clone();
        match set_controller_reference(claimed.meta_mut(), owner.clone()) {
            Ok(false) => return Ok(claimed),
            Ok(true) => {}
            Err(OwnershipError::AlreadyOwned { existing }) => {
                if self.owner_is_live(target, &existing).await? {
                    return Err(DependencyError::AlreadyClaimed {
                        kind: K::kind(&()).to_string(),
                        name: target.name_any(),
                        owner: existing.name,
                    }
                    .into());
                }
                info!(
                    kind = %K::kind(&()),
                    name = %target.name_any(),
                    stale_owner = %existing.name,
                    new_owner = %owner.name,
                    "taking over claim from stale owner"
                );
                remove_owner_reference(claimed.meta_mut(), &existing.uid);
                set_controller_reference(claimed.meta_mut(), owner.clone())
                    .map_err(|e| Error::invariant(e.to_string()))?;
            }
        }
        debug!(kind = %K::kind(&()), name = %target.name_any(), owner = %owner.name, "claiming");
        self.store.update(&claimed).await
    }

    /// [`Resolver::claim`] for a provider config
    pub async fn claim_provider_config(
        &self,
        owner: &OwnerReference,
        config: &ProviderConfig,
    ) -> Result<ProviderConfig> {
        Ok(match config {
            ProviderConfig::NxNve(c) => ProviderConfig::NxNve(self.claim(owner, c).await?),
            ProviderConfig::NxVtep(c) => ProviderConfig::NxVtep(self.claim(owner, c).await?),
        })
    }

    /// Drop `owner_uid` from the owners of a target, if it is still there
    pub async fn release<K: StoredObject>(
        &self,
        owner_uid: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let Some(mut target) = self.store.get::<K>(namespace, name).await? else {
            return Ok(());
        };
        if remove_owner_reference(target.meta_mut(), owner_uid) {
            debug!(kind = %K::kind(&()), name = %name, "releasing claim");
            self.store.update(&target).await?;
        }
        Ok(())
    }

    /// [`Resolver::release`] for a provider config reference
    ///
    /// References to unregistered kinds were never claimed and are skipped.
    pub async fn release_provider_config(
        &self,
        owner_uid: &str,
        namespace: &str,
        reference: &TypedLocalObjectReference,
    ) -> Result<()> {
        let Some(kind) = self.registry.kind_of(reference) else {
            return Ok(());
        };
        let Some(mut config) = kind.fetch(&self.store, namespace, &reference.name).await? else {
            return Ok(());
        };
        if remove_owner_reference(config.meta_mut(), owner_uid) {
            debug!(kind = %kind, name = %reference.name, "releasing provider config claim");
            config.update(&self.store).await?;
        }
        Ok(())
    }

    /// Whether the owner recorded on `target` still holds it
    ///
    /// A holder is live while it exists with the same uid and its spec still
    /// references `target`; a primary that moved to another object left its
    /// old claim behind. Owners of kinds this controller does not manage are
    /// assumed live.
    async fn owner_is_live<K: StoredObject>(
        &self,
        target: &K,
        existing: &OwnerReference,
    ) -> Result<bool> {
        let namespace = target.namespace().unwrap_or_default();
        let holder = if existing.kind == Nve::kind(&()) {
            self.store
                .get::<Nve>(&namespace, &existing.name)
                .await?
                .map(|o| (o.metadata.uid.clone(), o.references()))
        } else if existing.kind == Vtep::kind(&()) {
            self.store
                .get::<Vtep>(&namespace, &existing.name)
                .await?
                .map(|o| (o.metadata.uid.clone(), o.references()))
        } else {
            return Ok(true);
        };
        let wanted = (GroupKind::of::<K>(), target.name_any());
        Ok(holder.is_some_and(|(uid, references)| {
            uid.as_deref() == Some(existing.uid.as_str()) && references.contains(&wanted)
        }))
    }
}
