//! Controller runtime
//!
//! Turns watch events into reconciliation requests and runs them:
//!
//! - [`router`] maps dependency changes to the primaries that reference them
//! - [`queue`] deduplicates pending keys and coalesces in-flight ones
//! - [`runner`] drives watch sources and dispatches keys onto workers

pub mod queue;
pub mod router;
pub mod runner;

pub use queue::{QueueReceiver, WorkQueue};
pub use router::{DependencyKey, GroupKind, ReferenceIndex, References, Router, SpecFilter};
pub use runner::{drive, kube_events, memory_events, Runner, WatchEvent};

use std::time::Duration;

use kube::Resource;

/// Namespace and name of a primary object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Build a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an object; `None` when name or namespace is missing
    pub fn for_object<K: Resource>(object: &K) -> Option<Self> {
        let meta = object.meta();
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What to do with a key after a successful pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Run again after the delay
    Requeue(Duration),
    /// Run again only when a watch event arrives
    AwaitChange,
}

impl Action {
    /// Run again after `duration`
    pub fn requeue(duration: Duration) -> Self {
        Self::Requeue(duration)
    }

    /// Run again as soon as possible
    pub fn requeue_now() -> Self {
        Self::Requeue(Duration::ZERO)
    }

    /// Wait for the next change
    pub fn await_change() -> Self {
        Self::AwaitChange
    }

    /// Requeue delay, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Requeue(d) => Some(*d),
            Self::AwaitChange => None,
        }
    }
}
