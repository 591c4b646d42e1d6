//! Fabric - declarative control plane for network-device tunnel endpoints
//!
//! Users declare NVE and VTEP objects that point at devices, interfaces,
//! EVPN control planes and provider-specific configuration. Controllers
//! resolve those references, claim what must not be shared, push the result
//! to the device through a provider, and report progress as conditions.
//!
//! # Architecture
//!
//! - Watches on every referenced kind are routed back to the primaries that
//!   depend on them and fed into a deduplicating work queue
//! - A generic engine runs one pass per key: finalizer, conditions,
//!   dependency resolution, provider apply, status
//! - Deletion tears the object down on the device before the finalizer is
//!   released
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (NVE, VTEP, Device, Interface, ...)
//! - [`controller`] - Reconciliation engine, resolver and per-kind reconcilers
//! - [`runtime`] - Event routing, work queue and worker pool
//! - [`conditions`] - Condition state machine
//! - [`provider`] - Device provider abstraction and the simulated provider
//! - [`store`] - Object store seam (Kubernetes API or in-memory)
//! - [`webhook`] - Validating admission webhook
//! - [`retry`] - Backoff and jitter helpers
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod conditions;
pub mod controller;
pub mod crd;
pub mod error;
pub mod provider;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod webhook;

use std::time::Duration;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Finalizer placed on every primary before any device side effect
pub const FINALIZER: &str = "networking.fabric.dev/finalizer";

/// Label linking a primary to the Device it is configured on
pub const DEVICE_LABEL: &str = "networking.fabric.dev/device-name";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "fabric-operator";

/// Default interval between periodic re-checks of a healthy object
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(60);

/// Default listen address of the admission webhook
pub const DEFAULT_WEBHOOK_ADDR: &str = "0.0.0.0:9443";
