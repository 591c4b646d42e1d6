//! Finalizer lifecycle
//!
//! The marker is added before any external side effect and removed only once
//! the device confirms the object is gone (or was never there). Everything in
//! between is retried: a teardown failure leaves the object in
//! [`FinalizerState::Finalizing`] and surfaces as an error so the runner backs
//! off.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{info, instrument, warn};

use super::engine::{persist, scheduled, ManagedResource, Reconciler};
use super::Context;
use crate::conditions::{self, not_configured};
use crate::provider::{Connection, Session};
use crate::runtime::Action;
use crate::{Error, Result, FINALIZER};

/// Where an object stands in its finalizer lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizerState {
    /// Live object without the marker
    NoFinalizer,
    /// Live object carrying the marker
    Finalized,
    /// Deletion requested, marker still present
    Finalizing,
    /// Deletion requested and the marker is gone
    Deleted,
}

/// Classify an object by deletion timestamp and marker presence
pub fn state_of(meta: &ObjectMeta, finalizer: &str) -> FinalizerState {
    match (meta.deletion_timestamp.is_some(), has_finalizer(meta, finalizer)) {
        (false, false) => FinalizerState::NoFinalizer,
        (false, true) => FinalizerState::Finalized,
        (true, true) => FinalizerState::Finalizing,
        (true, false) => FinalizerState::Deleted,
    }
}

/// Whether the marker is present
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Add the marker; returns whether anything changed
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Remove the marker; returns whether anything changed
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}

/// Tear down a deleting object and release its marker
///
/// Steps, in order: resolve the device, delete on the device (absent counts
/// as done), release claims on dependencies, drop the marker.
#[instrument(
    skip_all,
    fields(kind = %<R::Object as ManagedResource>::KIND, name = %object.name_any())
)]
pub async fn finalize<R: Reconciler>(
    object: R::Object,
    ctx: &Context,
    reconciler: &R,
) -> Result<Action> {
    let namespace = object.namespace().unwrap_or_default();

    if ctx.provider.supports(<R::Object as ManagedResource>::KIND) {
        let device = match ctx.resolver.device(&namespace, object.device_ref()).await {
            Ok(device) => device,
            Err(Error::Dependency(dep)) => {
                warn!(error = %dep, "device missing, cannot tear down yet");
                let mut waiting = object.clone();
                conditions::set(
                    waiting.conditions_mut(),
                    not_configured(dep.reason(), format!("waiting to tear down: {dep}")),
                );
                conditions::update_ready(waiting.conditions_mut());
                persist(&object, waiting, &ctx.store).await?;
                return Ok(scheduled(ctx));
            }
            Err(e) => return Err(e),
        };

        let session = Session::open(ctx.provider.clone(), Connection::for_device(&device)).await?;
        let outcome = match reconciler.teardown(&session, &object).await {
            Err(e) if e.is_not_found() => {
                info!(device = %device.name_any(), "already absent on device");
                Ok(())
            }
            other => other,
        };
        session.close(outcome).await?;
        info!(device = %device.name_any(), "removed from device");
    } else {
        info!("provider does not manage this kind, skipping teardown");
    }

    reconciler.release(&object, &ctx.resolver).await?;

    let mut released = object;
    if remove_finalizer(released.meta_mut(), FINALIZER) {
        ctx.store.update(&released).await?;
    }
    info!("finalizer removed");
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    const MARKER: &str = "networking.fabric.dev/finalizer";

    fn meta(deleting: bool, marker: bool) -> ObjectMeta {
        ObjectMeta {
            deletion_timestamp: deleting.then(|| Time(Utc::now())),
            finalizers: marker.then(|| vec![MARKER.to_string()]),
            ..Default::default()
        }
    }

    #[test]
    fn lifecycle_states_cover_both_axes() {
        assert_eq!(state_of(&meta(false, false), MARKER), FinalizerState::NoFinalizer);
        assert_eq!(state_of(&meta(false, true), MARKER), FinalizerState::Finalized);
        assert_eq!(state_of(&meta(true, true), MARKER), FinalizerState::Finalizing);
        assert_eq!(state_of(&meta(true, false), MARKER), FinalizerState::Deleted);
    }

    #[test]
    fn marker_edits_are_idempotent() {
        let mut m = ObjectMeta::default();
        assert!(add_finalizer(&mut m, MARKER));
        assert!(!add_finalizer(&mut m, MARKER));
        assert_eq!(m.finalizers.as_ref().unwrap().len(), 1);

        assert!(remove_finalizer(&mut m, MARKER));
        assert!(!remove_finalizer(&mut m, MARKER));
        assert!(!has_finalizer(&m, MARKER));
    }

    #[test]
    fn foreign_finalizers_are_kept() {
        let mut m = meta(false, true);
        m.finalizers
            .as_mut()
            .unwrap()
            .push("example.com/other".to_string());
        remove_finalizer(&mut m, MARKER);
        assert_eq!(m.finalizers.unwrap(), vec!["example.com/other".to_string()]);
    }
}
