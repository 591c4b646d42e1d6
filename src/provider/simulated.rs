//! Simulated provider
//!
//! Keeps per-device state in memory and records every call. Used for local
//! runs without hardware and as the device side of the scenario tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use kube::ResourceExt;
use tracing::{debug, info};

use super::{
    Connection, ManagedKind, NveRequest, OperationalStatus, Provider, ProviderError,
    ProviderResult, VtepRequest,
};
use crate::crd::{AdminState, Nve, Vtep};

/// Provider operations, used for call accounting and fault injection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`Provider::connect`]
    Connect,
    /// [`Provider::disconnect`]
    Disconnect,
    /// [`Provider::ensure_nve`]
    EnsureNve,
    /// [`Provider::delete_nve`]
    DeleteNve,
    /// [`Provider::nve_status`]
    NveStatus,
    /// [`Provider::ensure_vtep`]
    EnsureVtep,
    /// [`Provider::delete_vtep`]
    DeleteVtep,
    /// [`Provider::vtep_status`]
    VtepStatus,
}

#[derive(Default)]
struct DeviceState {
    sessions: u32,
    nves: HashMap<String, AdminState>,
    vteps: HashMap<String, bool>,
}

#[derive(Default)]
struct Journal {
    calls: Vec<(Operation, String)>,
    nve_requests: Vec<NveRequest>,
    vtep_requests: Vec<VtepRequest>,
    failures: HashMap<Operation, VecDeque<ProviderError>>,
}

/// In-memory [`Provider`]
pub struct SimulatedProvider {
    kinds: HashSet<ManagedKind>,
    devices: DashMap<String, DeviceState>,
    journal: Mutex<Journal>,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvider {
    /// A provider supporting every managed kind
    pub fn new() -> Self {
        Self::with_kinds(&[ManagedKind::Nve, ManagedKind::Vtep])
    }

    /// A provider supporting only the given kinds
    pub fn with_kinds(kinds: &[ManagedKind]) -> Self {
        Self {
            kinds: kinds.iter().copied().collect(),
            devices: DashMap::new(),
            journal: Mutex::new(Journal::default()),
        }
    }

    /// Make the next call of `operation` fail with `error`
    ///
    /// Queued failures are consumed in order, one per call.
    pub fn fail_next(&self, operation: Operation, error: ProviderError) {
        self.journal()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Every call made so far, with the device it targeted
    pub fn calls(&self) -> Vec<(Operation, String)> {
        self.journal().calls.clone()
    }

    /// Number of calls of one operation
    pub fn count(&self, operation: Operation) -> usize {
        self.journal()
            .calls
            .iter()
            .filter(|(op, _)| *op == operation)
            .count()
    }

    /// Requests received by `ensure_nve`
    pub fn nve_requests(&self) -> Vec<NveRequest> {
        self.journal().nve_requests.clone()
    }

    /// Requests received by `ensure_vtep`
    pub fn vtep_requests(&self) -> Vec<VtepRequest> {
        self.journal().vtep_requests.clone()
    }

    /// Whether an NVE is currently configured on a device
    pub fn has_nve(&self, device: &str, name: &str) -> bool {
        self.devices
            .get(device)
            .is_some_and(|d| d.nves.contains_key(name))
    }

    /// Whether a VTEP is currently configured on a device
    pub fn has_vtep(&self, device: &str, name: &str) -> bool {
        self.devices
            .get(device)
            .is_some_and(|d| d.vteps.contains_key(name))
    }

    /// Number of sessions currently open against a device
    pub fn open_sessions(&self, device: &str) -> u32 {
        self.devices.get(device).map_or(0, |d| d.sessions)
    }

    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log the call and pop an injected failure, if any
    fn enter(&self, operation: Operation, connection: &Connection) -> ProviderResult<()> {
        let mut journal = self.journal();
        journal.calls.push((operation, connection.device.clone()));
        match journal
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn require_session(&self, connection: &Connection) -> ProviderResult<()> {
        match self.devices.get(&connection.device) {
            Some(state) if state.sessions > 0 => Ok(()),
            _ => Err(ProviderError::Unavailable(format!(
                "no open session to {connection}"
            ))),
        }
    }

    fn require_kind(&self, kind: ManagedKind) -> ProviderResult<()> {
        if self.kinds.contains(&kind) {
            Ok(())
        } else {
            Err(ProviderError::NotImplemented(kind.to_string()))
        }
    }
}

fn status_of(up: bool) -> OperationalStatus {
    if up {
        OperationalStatus::Up
    } else {
        OperationalStatus::Down
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn supports(&self, kind: ManagedKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn connect(&self, connection: &Connection) -> ProviderResult<()> {
        self.enter(Operation::Connect, connection)?;
        self.devices
            .entry(connection.device.clone())
            .or_default()
            .sessions += 1;
        debug!(device = %connection.device, "simulated connect");
        Ok(())
    }

    async fn disconnect(&self, connection: &Connection) -> ProviderResult<()> {
        if let Some(mut state) = self.devices.get_mut(&connection.device) {
            state.sessions = state.sessions.saturating_sub(1);
        }
        self.enter(Operation::Disconnect, connection)
    }

    async fn ensure_nve(
        &self,
        connection: &Connection,
        request: &NveRequest,
    ) -> ProviderResult<()> {
        self.enter(Operation::EnsureNve, connection)?;
        self.require_kind(ManagedKind::Nve)?;
        self.require_session(connection)?;
        self.journal().nve_requests.push(request.clone());
        let name = request.nve.name_any();
        if let Some(mut state) = self.devices.get_mut(&connection.device) {
            state.nves.insert(name.clone(), request.nve.spec.admin_state);
        }
        info!(
            device = %connection.device,
            nve = %name,
            source = %request.source_interface.spec.name,
            "simulated NVE configured"
        );
        Ok(())
    }

    async fn delete_nve(&self, connection: &Connection, nve: &Nve) -> ProviderResult<()> {
        self.enter(Operation::DeleteNve, connection)?;
        self.require_session(connection)?;
        let removed = self
            .devices
            .get_mut(&connection.device)
            .and_then(|mut state| state.nves.remove(&nve.name_any()));
        match removed {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound),
        }
    }

    async fn nve_status(
        &self,
        connection: &Connection,
        nve: &Nve,
    ) -> ProviderResult<OperationalStatus> {
        self.enter(Operation::NveStatus, connection)?;
        self.require_session(connection)?;
        Ok(self
            .devices
            .get(&connection.device)
            .and_then(|state| state.nves.get(&nve.name_any()).copied())
            .map_or(OperationalStatus::Unknown, |admin| {
                status_of(admin == AdminState::Up)
            }))
    }

    async fn ensure_vtep(
        &self,
        connection: &Connection,
        request: &VtepRequest,
    ) -> ProviderResult<()> {
        self.enter(Operation::EnsureVtep, connection)?;
        self.require_kind(ManagedKind::Vtep)?;
        self.require_session(connection)?;
        self.journal().vtep_requests.push(request.clone());
        let name = request.vtep.name_any();
        if let Some(mut state) = self.devices.get_mut(&connection.device) {
            state.vteps.insert(name.clone(), request.vtep.spec.enabled);
        }
        info!(
            device = %connection.device,
            vtep = %name,
            control_plane = %request.control_plane.name_any(),
            "simulated VTEP configured"
        );
        Ok(())
    }

    async fn delete_vtep(&self, connection: &Connection, vtep: &Vtep) -> ProviderResult<()> {
        self.enter(Operation::DeleteVtep, connection)?;
        self.require_session(connection)?;
        let removed = self
            .devices
            .get_mut(&connection.device)
            .and_then(|mut state| state.vteps.remove(&vtep.name_any()));
        match removed {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound),
        }
    }

    async fn vtep_status(
        &self,
        connection: &Connection,
        vtep: &Vtep,
    ) -> ProviderResult<OperationalStatus> {
        self.enter(Operation::VtepStatus, connection)?;
        self.require_session(connection)?;
        Ok(self
            .devices
            .get(&connection.device)
            .and_then(|state| state.vteps.get(&vtep.name_any()).copied())
            .map_or(OperationalStatus::Unknown, status_of))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        Device, DeviceSpec, Endpoint, HostReachability, Interface, InterfaceSpec, InterfaceType,
        LocalObjectReference, NveSpec,
    };

    fn conn() -> Connection {
        Connection {
            device: "leaf1".to_string(),
            address: "192.0.2.1".to_string(),
            port: None,
        }
    }

    fn nve(admin_state: AdminState) -> Nve {
        Nve::new(
            "nve1",
            NveSpec {
                device_ref: LocalObjectReference::new("leaf1"),
                admin_state,
                source_interface_ref: LocalObjectReference::new("lo0"),
                anycast_source_interface_ref: None,
                suppress_arp: false,
                host_reachability: HostReachability::Bgp,
                multicast_groups: None,
                provider_config_ref: None,
            },
        )
    }

    fn request(admin_state: AdminState) -> NveRequest {
        NveRequest {
            nve: nve(admin_state),
            device: Device::new(
                "leaf1",
                DeviceSpec {
                    endpoint: Endpoint {
                        address: "192.0.2.1".to_string(),
                        port: None,
                    },
                },
            ),
            source_interface: Interface::new(
                "lo0",
                InterfaceSpec {
                    device_ref: LocalObjectReference::new("leaf1"),
                    name: "loopback0".to_string(),
                    type_: InterfaceType::Loopback,
                    admin_state: AdminState::Up,
                    description: None,
                },
            ),
            anycast_source_interface: None,
            provider_config: None,
        }
    }

    #[tokio::test]
    async fn operations_need_an_open_session() {
        let provider = SimulatedProvider::new();
        let err = provider
            .ensure_nve(&conn(), &request(AdminState::Up))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));

        provider.connect(&conn()).await.unwrap();
        provider
            .ensure_nve(&conn(), &request(AdminState::Up))
            .await
            .unwrap();
        assert!(provider.has_nve("leaf1", "nve1"));
        assert_eq!(provider.nve_requests().len(), 1);
    }

    #[tokio::test]
    async fn status_follows_admin_state() {
        let provider = SimulatedProvider::new();
        provider.connect(&conn()).await.unwrap();
        assert_eq!(
            provider.nve_status(&conn(), &nve(AdminState::Up)).await,
            Ok(OperationalStatus::Unknown)
        );

        provider
            .ensure_nve(&conn(), &request(AdminState::Down))
            .await
            .unwrap();
        assert_eq!(
            provider.nve_status(&conn(), &nve(AdminState::Down)).await,
            Ok(OperationalStatus::Down)
        );
    }

    #[tokio::test]
    async fn deleting_absent_object_reports_not_found() {
        let provider = SimulatedProvider::new();
        provider.connect(&conn()).await.unwrap();
        assert_eq!(
            provider.delete_nve(&conn(), &nve(AdminState::Up)).await,
            Err(ProviderError::NotFound)
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_once() {
        let provider = SimulatedProvider::new();
        provider.fail_next(
            Operation::Connect,
            ProviderError::Unavailable("down".to_string()),
        );
        assert!(provider.connect(&conn()).await.is_err());
        assert!(provider.connect(&conn()).await.is_ok());
        assert_eq!(provider.count(Operation::Connect), 2);
        assert_eq!(provider.open_sessions("leaf1"), 1);
    }

    #[tokio::test]
    async fn unsupported_kind_is_not_implemented() {
        let provider = SimulatedProvider::with_kinds(&[ManagedKind::Vtep]);
        assert!(!provider.supports(ManagedKind::Nve));
        provider.connect(&conn()).await.unwrap();
        let err = provider
            .ensure_nve(&conn(), &request(AdminState::Up))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotImplemented(_)));
    }
}
