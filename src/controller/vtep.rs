//! VTEP reconciler
//!
//! A VTEP resolves its device, a loopback primary interface, an optional
//! loopback anycast interface, and exactly one EVPNControlPlane on the same
//! device. The control plane and any provider config are claimed with a
//! controlling owner reference, so neither can be shared between VTEPs.

use async_trait::async_trait;
use kube::ResourceExt;

use super::engine::{ManagedResource, Reconciler};
use super::ownership::owner_reference;
use super::registry::ProviderConfig;
use super::resolver::Resolver;
use crate::crd::{
    Condition, Device, EvpnControlPlane, Interface, InterfaceType, LocalObjectReference, Vtep,
    VtepStatus,
};
use crate::provider::{ManagedKind, OperationalStatus, ProviderResult, Session, VtepRequest};
use crate::runtime::{GroupKind, References};
use crate::{Error, Result};

impl ManagedResource for Vtep {
    const KIND: ManagedKind = ManagedKind::Vtep;

    fn device_ref(&self) -> &LocalObjectReference {
        &self.spec.device_ref
    }

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(VtepStatus::default).conditions
    }
}

impl References for Vtep {
    fn references(&self) -> Vec<(GroupKind, String)> {
        let interface = GroupKind::of::<Interface>();
        let mut refs = vec![
            (GroupKind::of::<Device>(), self.spec.device_ref.name.clone()),
            (interface.clone(), self.spec.primary_interface_ref.name.clone()),
            (
                GroupKind::of::<EvpnControlPlane>(),
                self.spec.control_plane_ref.name.clone(),
            ),
        ];
        if let Some(anycast) = &self.spec.anycast_interface_ref {
            refs.push((interface, anycast.name.clone()));
        }
        if let Some(config) = &self.spec.provider_config_ref {
            refs.push((
                GroupKind::from_api_version(&config.api_version, &config.kind),
                config.name.clone(),
            ));
        }
        refs
    }
}

/// Dependencies of a VTEP once resolved and claimed
#[derive(Clone, Debug)]
pub struct ResolvedVtep {
    primary: Interface,
    anycast: Option<Interface>,
    control_plane: EvpnControlPlane,
    provider_config: Option<ProviderConfig>,
}

/// Drives VTEP objects onto devices
#[derive(Clone, Copy, Debug, Default)]
pub struct VtepReconciler;

#[async_trait]
impl Reconciler for VtepReconciler {
    type Object = Vtep;
    type Resolved = ResolvedVtep;

    async fn resolve(
        &self,
        vtep: &Vtep,
        device: &Device,
        resolver: &Resolver,
    ) -> Result<ResolvedVtep> {
        let namespace = vtep.namespace().unwrap_or_default();
        let device = device.name_any();

        let primary = resolver
            .interface(
                &namespace,
                &vtep.spec.primary_interface_ref,
                &device,
                InterfaceType::Loopback,
            )
            .await?;
        let anycast = match &vtep.spec.anycast_interface_ref {
            Some(reference) => Some(
                resolver
                    .interface(&namespace, reference, &device, InterfaceType::Loopback)
                    .await?,
            ),
            None => None,
        };

        let owner = owner_reference(vtep, true)
            .ok_or_else(|| Error::invariant("stored VTEP has no uid"))?;

        let control_plane = resolver
            .control_plane(&namespace, &vtep.spec.control_plane_ref, &device)
            .await?;
        let control_plane = resolver.claim(&owner, &control_plane).await?;

        let provider_config = match &vtep.spec.provider_config_ref {
            Some(reference) => {
                let config = resolver
                    .provider_config(&namespace, reference, &device, ManagedKind::Vtep)
                    .await?;
                Some(resolver.claim_provider_config(&owner, &config).await?)
            }
            None => None,
        };

        Ok(ResolvedVtep {
            primary,
            anycast,
            control_plane,
            provider_config,
        })
    }

    fn record(&self, vtep: &mut Vtep, resolved: &ResolvedVtep) {
        let status = vtep.status.get_or_insert_with(VtepStatus::default);
        status.primary_interface_name = Some(resolved.primary.spec.name.clone());
        status.anycast_interface_name = resolved.anycast.as_ref().map(|i| i.spec.name.clone());
        status.control_plane_name = Some(resolved.control_plane.name_any());
    }

    async fn ensure(
        &self,
        session: &Session,
        vtep: &Vtep,
        device: &Device,
        resolved: &ResolvedVtep,
    ) -> ProviderResult<()> {
        let request = VtepRequest {
            vtep: vtep.clone(),
            device: device.clone(),
            primary_interface: resolved.primary.clone(),
            anycast_interface: resolved.anycast.clone(),
            control_plane: resolved.control_plane.clone(),
            provider_config: resolved.provider_config.clone(),
        };
        session
            .provider()
            .ensure_vtep(session.connection(), &request)
            .await
    }

    async fn observe(&self, session: &Session, vtep: &Vtep) -> ProviderResult<OperationalStatus> {
        session.provider().vtep_status(session.connection(), vtep).await
    }

    async fn teardown(&self, session: &Session, vtep: &Vtep) -> ProviderResult<()> {
        session.provider().delete_vtep(session.connection(), vtep).await
    }

    async fn release(&self, vtep: &Vtep, resolver: &Resolver) -> Result<()> {
        let Some(uid) = vtep.uid() else {
            return Ok(());
        };
        let namespace = vtep.namespace().unwrap_or_default();
        resolver
            .release::<EvpnControlPlane>(&uid, &namespace, &vtep.spec.control_plane_ref.name)
            .await?;
        if let Some(reference) = &vtep.spec.provider_config_ref {
            resolver
                .release_provider_config(&uid, &namespace, reference)
                .await?;
        }
        Ok(())
    }
}
