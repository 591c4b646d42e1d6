//! Condition state machine
//!
//! Conditions are keyed by type and kept in first-insertion order. Setting a
//! condition to the value it already has is a no-op: the transition time is
//! left alone and the caller is told nothing changed, so the engine can skip
//! the status write entirely.
//!
//! Three types are tracked. `Configured` and `Operational` are set by the
//! engine; `Ready` is only ever produced by [`aggregate_ready`], evaluated
//! after the other two.

use crate::crd::{Condition, ConditionStatus};

/// Aggregate readiness
pub const READY: &str = "Ready";
/// Dependency resolution and provider apply outcome
pub const CONFIGURED: &str = "Configured";
/// Device-reported health
pub const OPERATIONAL: &str = "Operational";

/// Tracked condition types in storage order
pub const TRACKED: [&str; 3] = [READY, CONFIGURED, OPERATIONAL];

/// Reason attached to freshly seeded conditions
pub const RECONCILING: &str = "Reconciling";

/// Closed set of condition reasons
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    /// Dependency resolution and provider apply succeeded
    Configured,
    /// A referenced object does not exist yet
    WaitingForDependencies,
    /// A referenced interface has the wrong type for its role
    InvalidInterfaceType,
    /// A referenced object belongs to a different device
    CrossDeviceReference,
    /// The provider config reference names an unsupported kind
    IncompatibleProviderConfigRef,
    /// The provider config is claimed by another object
    ProviderConfigAlreadyClaimed,
    /// The control plane is claimed by another object
    ControlPlaneAlreadyClaimed,
    /// The device already carries another NVE
    NveConfigAlreadyExists,
    /// The provider rejected or failed the operation
    ProviderError,
    /// The provider does not implement this kind
    NotImplemented,
    /// Device reports the object up
    Operational,
    /// Device reports the object down
    Degraded,
    /// Device health could not be read
    StatusUnavailable,
}

impl Reason {
    /// Wire representation of the reason
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configured => "Configured",
            Self::WaitingForDependencies => "WaitingForDependencies",
            Self::InvalidInterfaceType => "InvalidInterfaceType",
            Self::CrossDeviceReference => "CrossDeviceReference",
            Self::IncompatibleProviderConfigRef => "IncompatibleProviderConfigRef",
            Self::ProviderConfigAlreadyClaimed => "ProviderConfigAlreadyClaimed",
            Self::ControlPlaneAlreadyClaimed => "ControlPlaneAlreadyClaimed",
            Self::NveConfigAlreadyExists => "NVEConfigAlreadyExists",
            Self::ProviderError => "ProviderError",
            Self::NotImplemented => "NotImplemented",
            Self::Operational => "Operational",
            Self::Degraded => "Degraded",
            Self::StatusUnavailable => "StatusUnavailable",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured=True
pub fn configured(message: impl Into<String>) -> Condition {
    Condition::new(
        CONFIGURED,
        ConditionStatus::True,
        Reason::Configured.as_str(),
        message,
    )
}

/// Configured=False with the given reason
pub fn not_configured(reason: Reason, message: impl Into<String>) -> Condition {
    Condition::new(CONFIGURED, ConditionStatus::False, reason.as_str(), message)
}

/// Operational condition with an explicit status
pub fn operational(
    status: ConditionStatus,
    reason: Reason,
    message: impl Into<String>,
) -> Condition {
    Condition::new(OPERATIONAL, status, reason.as_str(), message)
}

/// Find a condition by type
pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Merge `condition` into the list.
///
/// Returns `true` when the list changed. An existing entry is replaced only
/// if status, reason or message differ; a new type is appended.
pub fn set(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message
            {
                return false;
            }
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Seed every missing type as Unknown, preserving existing entries.
///
/// Returns `true` when anything was added.
pub fn initialize(conditions: &mut Vec<Condition>, types: &[&str]) -> bool {
    let mut changed = false;
    for type_ in types {
        if find(conditions, type_).is_none() {
            conditions.push(Condition::new(
                *type_,
                ConditionStatus::Unknown,
                RECONCILING,
                "reconciliation has not completed yet",
            ));
            changed = true;
        }
    }
    changed
}

/// Compute Ready from Configured and Operational.
pub fn aggregate_ready(conditions: &[Condition]) -> Condition {
    let configured = find(conditions, CONFIGURED);
    let operational = find(conditions, OPERATIONAL);

    for dependency in [configured, operational].into_iter().flatten() {
        if dependency.is_false() {
            return Condition::new(
                READY,
                ConditionStatus::False,
                dependency.reason.clone(),
                dependency.message.clone(),
            );
        }
    }

    match (configured, operational) {
        (Some(c), Some(o)) if c.is_true() && o.is_true() => Condition::new(
            READY,
            ConditionStatus::True,
            "Ready",
            "configured and operational",
        ),
        _ => Condition::new(
            READY,
            ConditionStatus::Unknown,
            RECONCILING,
            "waiting for configuration and operational status",
        ),
    }
}

/// Recompute Ready and merge it; returns `true` on change.
pub fn update_ready(conditions: &mut Vec<Condition>) -> bool {
    let ready = aggregate_ready(conditions);
    set(conditions, ready)
}
