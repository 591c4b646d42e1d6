//! Device provider abstraction layer
//!
//! A [`Provider`] pushes tunnel endpoint configuration to devices and reads
//! back their operational state. The engine never holds a connection across
//! passes: every pass opens a [`Session`], runs its operations, and closes it.
//!
//! # Providers
//!
//! - [`SimulatedProvider`] - in-memory devices for local runs and tests
//!
//! # Example
//!
//! ```text
//! let session = Session::open(provider, Connection::for_device(&device)).await?;
//! let outcome = session.provider().ensure_nve(session.connection(), &request).await;
//! session.close(outcome).await?;
//! ```

mod session;
mod simulated;

pub use session::Session;
pub use simulated::{Operation, SimulatedProvider};

use async_trait::async_trait;
use kube::ResourceExt;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::controller::registry::ProviderConfig;
use crate::crd::{Device, EvpnControlPlane, Interface, Nve, Vtep};

/// Address of a device management endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Connection {
    /// Name of the Device object
    pub device: String,
    /// Management address
    pub address: String,
    /// Management port, provider default when unset
    pub port: Option<u16>,
}

impl Connection {
    /// Build the connection for a Device
    pub fn for_device(device: &Device) -> Self {
        Self {
            device: device.name_any(),
            address: device.spec.endpoint.address.clone(),
            port: device.spec.endpoint.port,
        }
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{} ({}:{})", self.device, self.address, port),
            None => write!(f, "{} ({})", self.device, self.address),
        }
    }
}

/// Errors reported by a provider
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ProviderError {
    /// The device could not be reached or the session is not connected
    #[error("device unavailable: {0}")]
    Unavailable(String),

    /// The device refused the configuration
    #[error("rejected by device ({reason}): {message}")]
    Rejected {
        /// Device-side reason code
        reason: String,
        /// Device-side message
        message: String,
    },

    /// The object does not exist on the device
    #[error("object not found on device")]
    NotFound,

    /// The provider has no implementation for the operation
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The operation failed and so did the disconnect that followed it
    #[error("{operation}; disconnect also failed: {release}")]
    Aggregate {
        /// Error of the operation itself
        operation: Box<ProviderError>,
        /// Error of the disconnect
        release: Box<ProviderError>,
    },
}

impl ProviderError {
    /// True when the object is confirmed absent on the device
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound => true,
            Self::Aggregate { operation, .. } => operation.is_not_found(),
            _ => false,
        }
    }
}

/// Result type for provider operations
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Primary kinds a provider may manage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManagedKind {
    /// Network virtualization edge
    Nve,
    /// VXLAN tunnel endpoint
    Vtep,
}

impl std::fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nve => write!(f, "NVE"),
            Self::Vtep => write!(f, "VTEP"),
        }
    }
}

/// Health of a configured object as reported by the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationalStatus {
    /// Forwarding
    Up,
    /// Configured but not forwarding
    Down,
    /// The device did not say
    Unknown,
}

/// Everything a provider needs to configure an NVE
///
/// Interfaces are passed as full objects so the provider can read on-device
/// names and types without another lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct NveRequest {
    /// The NVE being configured
    pub nve: Nve,
    /// Device it lives on
    pub device: Device,
    /// Resolved source loopback
    pub source_interface: Interface,
    /// Resolved anycast source loopback
    pub anycast_source_interface: Option<Interface>,
    /// Resolved provider-specific configuration
    pub provider_config: Option<ProviderConfig>,
}

/// Everything a provider needs to configure a VTEP
#[derive(Clone, Debug, PartialEq)]
pub struct VtepRequest {
    /// The VTEP being configured
    pub vtep: Vtep,
    /// Device it lives on
    pub device: Device,
    /// Resolved primary loopback
    pub primary_interface: Interface,
    /// Resolved anycast loopback
    pub anycast_interface: Option<Interface>,
    /// Claimed EVPN control plane
    pub control_plane: EvpnControlPlane,
    /// Resolved provider-specific configuration
    pub provider_config: Option<ProviderConfig>,
}

/// Gateway to network devices
///
/// Implementations must treat deleting an object that is already absent as
/// success or report [`ProviderError::NotFound`]; the engine accepts both.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Whether this provider can manage the given kind
    fn supports(&self, kind: ManagedKind) -> bool;

    /// Open a connection to the device
    async fn connect(&self, connection: &Connection) -> ProviderResult<()>;

    /// Close a connection opened by [`Provider::connect`]
    async fn disconnect(&self, connection: &Connection) -> ProviderResult<()>;

    /// Create or update an NVE
    async fn ensure_nve(&self, connection: &Connection, request: &NveRequest) -> ProviderResult<()>;

    /// Remove an NVE
    async fn delete_nve(&self, connection: &Connection, nve: &Nve) -> ProviderResult<()>;

    /// Read the operational state of an NVE
    async fn nve_status(&self, connection: &Connection, nve: &Nve)
        -> ProviderResult<OperationalStatus>;

    /// Create or update a VTEP
    async fn ensure_vtep(&self, connection: &Connection, request: &VtepRequest)
        -> ProviderResult<()>;

    /// Remove a VTEP
    async fn delete_vtep(&self, connection: &Connection, vtep: &Vtep) -> ProviderResult<()>;

    /// Read the operational state of a VTEP
    async fn vtep_status(
        &self,
        connection: &Connection,
        vtep: &Vtep,
    ) -> ProviderResult<OperationalStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DeviceSpec, Endpoint};

    #[test]
    fn connection_comes_from_device_endpoint() {
        let device = Device::new(
            "leaf1",
            DeviceSpec {
                endpoint: Endpoint {
                    address: "192.0.2.10".to_string(),
                    port: Some(443),
                },
            },
        );
        let conn = Connection::for_device(&device);
        assert_eq!(conn.device, "leaf1");
        assert_eq!(conn.to_string(), "leaf1 (192.0.2.10:443)");
    }

    #[test]
    fn not_found_survives_aggregation() {
        let err = ProviderError::Aggregate {
            operation: Box::new(ProviderError::NotFound),
            release: Box::new(ProviderError::Unavailable("reset".to_string())),
        };
        assert!(err.is_not_found());
        assert!(err.to_string().contains("disconnect also failed"));
        assert!(!ProviderError::Unavailable("x".to_string()).is_not_found());
    }

    #[test]
    fn managed_kinds_render_as_kubernetes_kinds() {
        assert_eq!(ManagedKind::Nve.to_string(), "NVE");
        assert_eq!(ManagedKind::Vtep.to_string(), "VTEP");
    }
}
