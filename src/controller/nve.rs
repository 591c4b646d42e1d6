//! NVE reconciler
//!
//! An NVE needs its device, a loopback source interface, optionally a
//! loopback anycast interface, and optionally an NX NVEConfig that it claims
//! as controlling owner.

use async_trait::async_trait;
use kube::ResourceExt;

use super::engine::{ManagedResource, Reconciler};
use super::ownership::owner_reference;
use super::registry::ProviderConfig;
use super::resolver::Resolver;
use crate::crd::{
    Condition, Device, Interface, InterfaceType, LocalObjectReference, Nve, NveStatus,
};
use crate::provider::{ManagedKind, NveRequest, OperationalStatus, ProviderResult, Session};
use crate::runtime::{GroupKind, References};
use crate::{Error, Result};

impl ManagedResource for Nve {
    const KIND: ManagedKind = ManagedKind::Nve;

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
        &mut self.status.get_or_insert_with(NveStatus::default).conditions
    }
}

impl References for Nve {
    fn references(&self) -> Vec<(GroupKind, String)> {
        let interface = GroupKind::of::<Interface>();
        let mut refs = vec![
            (GroupKind::of::<Device>(), self.spec.device_ref.name.clone()),
            (interface.clone(), self.spec.source_interface_ref.name.clone()),
        ];
        if let Some(anycast) = &self.spec.anycast_source_interface_ref {
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

/// Dependencies of an NVE once resolved
#[derive(Clone, Debug)]
pub struct ResolvedNve {
    source: Interface,
    anycast: Option<Interface>,
    provider_config: Option<ProviderConfig>,
}

/// Drives NVE objects onto devices
#[derive(Clone, Copy, Debug, Default)]
pub struct NveReconciler;

#[async_trait]
impl Reconciler for NveReconciler {
    type Object = Nve;
    type Resolved = ResolvedNve;

    async fn resolve(
        &self,
        nve: &Nve,
        device: &Device,
        resolver: &Resolver,
    ) -> Result<ResolvedNve> {
        let namespace = nve.namespace().unwrap_or_default();
        let device = device.name_any();
        resolver.sole_nve(nve, &device).await?;

        let source = resolver
            .interface(
                &namespace,
                &nve.spec.source_interface_ref,
                &device,
                InterfaceType::Loopback,
            )
            .await?;
        let anycast = match &nve.spec.anycast_source_interface_ref {
            Some(reference) => Some(
                resolver
                    .interface(&namespace, reference, &device, InterfaceType::Loopback)
                    .await?,
            ),
            None => None,
        };

        let provider_config = match &nve.spec.provider_config_ref {
            Some(reference) => {
                let config = resolver
                    .provider_config(&namespace, reference, &device, ManagedKind::Nve)
                    .await?;
                let owner = owner_reference(nve, true)
                    .ok_or_else(|| Error::invariant("stored NVE has no uid"))?;
                Some(resolver.claim_provider_config(&owner, &config).await?)
            }
            None => None,
        };

        Ok(ResolvedNve {
            source,
            anycast,
            provider_config,
        })
    }

    fn record(&self, nve: &mut Nve, resolved: &ResolvedNve) {
        let status = nve.status.get_or_insert_with(NveStatus::default);
        status.source_interface_name = Some(resolved.source.spec.name.clone());
        status.anycast_source_interface_name =
            resolved.anycast.as_ref().map(|i| i.spec.name.clone());
        status.host_reachability = Some(nve.spec.host_reachability);
    }

    async fn ensure(
        &self,
        session: &Session,
        nve: &Nve,
        device: &Device,
        resolved: &ResolvedNve,
    ) -> ProviderResult<()> {
        let request = NveRequest {
            nve: nve.clone(),
            device: device.clone(),
            source_interface: resolved.source.clone(),
            anycast_source_interface: resolved.anycast.clone(),
            provider_config: resolved.provider_config.clone(),
        };
        session
            .provider()
            .ensure_nve(session.connection(), &request)
            .await
    }

    async fn observe(&self, session: &Session, nve: &Nve) -> ProviderResult<OperationalStatus> {
        session.provider().nve_status(session.connection(), nve).await
    }

    async fn teardown(&self, session: &Session, nve: &Nve) -> ProviderResult<()> {
        session.provider().delete_nve(session.connection(), nve).await
    }

    async fn release(&self, nve: &Nve, resolver: &Resolver) -> Result<()> {
        let (Some(reference), Some(uid)) = (&nve.spec.provider_config_ref, nve.uid()) else {
            return Ok(());
        };
        resolver
            .release_provider_config(&uid, &nve.namespace().unwrap_or_default(), reference)
            .await
    }
}
