//! Reconciliation engine
//!
//! One generic pass drives every primary kind. The per-kind parts (what to
//! resolve, what to send to the device, what to record in status) come from a
//! [`Reconciler`]; ordering, conditions, finalizers and persistence live here.
//!
//! A pass is:
//!
//! 1. fetch (absent objects are done)
//! 2. deleting objects go to [`finalize`]
//! 3. add the finalizer marker, persist, requeue
//! 4. seed conditions, persist, requeue
//! 5. capability check against the provider
//! 6. resolve dependencies and adopt the device
//! 7. apply through a provider [`Session`]
//! 8. aggregate Ready
//! 9. persist metadata and status, skipping unchanged parts
//! 10. schedule the periodic re-check

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::finalizer::{add_finalizer, finalize, state_of, FinalizerState};
use super::ownership::{owner_reference, set_owner_reference};
use super::resolver::Resolver;
use super::Context;
use crate::conditions::{self, configured, not_configured, operational, Reason};
use crate::crd::{Condition, ConditionStatus, Device, LocalObjectReference};
use crate::provider::{Connection, ManagedKind, OperationalStatus, ProviderResult, Session};
use crate::retry::jittered;
use crate::runtime::router::References;
use crate::runtime::{Action, ObjectKey};
use crate::store::{Store, StoredObject};
use crate::{Error, Result, DEVICE_LABEL, FINALIZER};

/// A primary object driven by the engine
pub trait ManagedResource: StoredObject + References {
    /// Provider-facing kind
    const KIND: ManagedKind;

    /// Device the object lives on
    fn device_ref(&self) -> &LocalObjectReference;

    /// Current conditions, empty when status is unset
    fn conditions(&self) -> &[Condition];

    /// Mutable conditions, creating status if needed
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

/// Kind-specific half of a reconciliation pass
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Primary kind handled
    type Object: ManagedResource;
    /// Everything `resolve` produced, handed to `record` and `ensure`
    type Resolved: Send + Sync;

    /// Resolve and claim the dependencies other than the device
    async fn resolve(
        &self,
        object: &Self::Object,
        device: &Device,
        resolver: &Resolver,
    ) -> Result<Self::Resolved>;

    /// Copy observed facts into status
    fn record(&self, object: &mut Self::Object, resolved: &Self::Resolved);

    /// Push desired state to the device
    async fn ensure(
        &self,
        session: &Session,
        object: &Self::Object,
        device: &Device,
        resolved: &Self::Resolved,
    ) -> ProviderResult<()>;

    /// Read operational state from the device
    async fn observe(
        &self,
        session: &Session,
        object: &Self::Object,
    ) -> ProviderResult<OperationalStatus>;

    /// Remove the object from the device
    async fn teardown(&self, session: &Session, object: &Self::Object) -> ProviderResult<()>;

    /// Release every claim the object holds
    async fn release(&self, object: &Self::Object, resolver: &Resolver) -> Result<()>;
}

/// Run one reconciliation pass for `key`
#[instrument(skip(ctx, reconciler), fields(kind = %<R::Object as ManagedResource>::KIND))]
pub async fn reconcile<R: Reconciler>(
    key: &ObjectKey,
    ctx: &Context,
    reconciler: &R,
) -> Result<Action> {
    let Some(fetched) = ctx
        .store
        .get::<R::Object>(&key.namespace, &key.name)
        .await?
    else {
        debug!("object no longer exists");
        return Ok(Action::await_change());
    };

    match state_of(fetched.meta(), FINALIZER) {
        FinalizerState::Finalizing => return finalize(fetched, ctx, reconciler).await,
        FinalizerState::Deleted => return Ok(Action::await_change()),
        FinalizerState::NoFinalizer => {
            let mut marked = fetched;
            add_finalizer(marked.meta_mut(), FINALIZER);
            ctx.store.update(&marked).await?;
            debug!("finalizer added");
            return Ok(Action::requeue_now());
        }
        FinalizerState::Finalized => {}
    }

    let mut object = fetched.clone();
    if conditions::initialize(object.conditions_mut(), &conditions::TRACKED) {
        ctx.store.update_status(&object).await?;
        debug!("conditions seeded");
        return Ok(Action::requeue_now());
    }

    if ctx.provider.supports(<R::Object as ManagedResource>::KIND) {
        converge(&mut object, ctx, reconciler).await?;
    } else {
        conditions::set(
            object.conditions_mut(),
            not_configured(
                Reason::NotImplemented,
                format!(
                    "provider does not implement {}",
                    <R::Object as ManagedResource>::KIND
                ),
            ),
        );
    }

    conditions::update_ready(object.conditions_mut());
    persist(&fetched, object, &ctx.store).await?;
    Ok(scheduled(ctx))
}

/// Resolve, apply and record; sets Configured and Operational
async fn converge<R: Reconciler>(
    object: &mut R::Object,
    ctx: &Context,
    reconciler: &R,
) -> Result<()> {
    let (device, resolved) = match resolve(object, ctx, reconciler).await {
        Ok(resolved) => resolved,
        Err(Error::Dependency(dep)) => {
            info!(reason = %dep.reason(), error = %dep, "dependencies not usable");
            conditions::set(
                object.conditions_mut(),
                not_configured(dep.reason(), dep.to_string()),
            );
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    reconciler.record(object, &resolved);

    let (applied, observed) = apply(object, &device, &resolved, ctx, reconciler).await;
    match applied {
        Ok(()) => {
            conditions::set(
                object.conditions_mut(),
                configured(format!("configured on device {}", device.name_any())),
            );
        }
        Err(e) => {
            warn!(device = %device.name_any(), error = %e, "provider failed to apply");
            conditions::set(
                object.conditions_mut(),
                not_configured(Reason::ProviderError, e.to_string()),
            );
        }
    }

    if let Some(observed) = observed {
        conditions::set(object.conditions_mut(), operational_condition(observed));
    }
    Ok(())
}

/// Resolve the device, adopt it, then resolve the kind's own dependencies
async fn resolve<R: Reconciler>(
    object: &mut R::Object,
    ctx: &Context,
    reconciler: &R,
) -> Result<(Device, R::Resolved)> {
    let namespace = object.namespace().unwrap_or_default();
    let device = ctx
        .resolver
        .device(&namespace, object.device_ref())
        .await?;
    adopt(object, &device);
    let resolved = reconciler.resolve(object, &device, &ctx.resolver).await?;
    Ok((device, resolved))
}

/// Point the object at its device: a non-controlling owner and a label
fn adopt<K: ManagedResource>(object: &mut K, device: &Device) {
    if let Some(owner) = owner_reference(device, false) {
        set_owner_reference(object.meta_mut(), owner);
    }
    object
        .labels_mut()
        .insert(DEVICE_LABEL.to_string(), device.name_any());
}

/// Apply inside a session; the second value is the best-effort status read
async fn apply<R: Reconciler>(
    object: &R::Object,
    device: &Device,
    resolved: &R::Resolved,
    ctx: &Context,
    reconciler: &R,
) -> (
    ProviderResult<()>,
    Option<ProviderResult<OperationalStatus>>,
) {
    let session = match Session::open(ctx.provider.clone(), Connection::for_device(device)).await
    {
        Ok(session) => session,
        Err(e) => return (Err(e), None),
    };

    let ensured = reconciler.ensure(&session, object, device, resolved).await;
    let observed = if ensured.is_ok() {
        Some(reconciler.observe(&session, object).await)
    } else {
        None
    };
    (session.close(ensured).await, observed)
}

fn operational_condition(observed: ProviderResult<OperationalStatus>) -> Condition {
    match observed {
        Ok(OperationalStatus::Up) => operational(
            ConditionStatus::True,
            Reason::Operational,
            "device reports the object up",
        ),
        Ok(OperationalStatus::Down) => operational(
            ConditionStatus::False,
            Reason::Degraded,
            "device reports the object down",
        ),
        Ok(OperationalStatus::Unknown) => operational(
            ConditionStatus::Unknown,
            Reason::StatusUnavailable,
            "device did not report a state",
        ),
        Err(e) => operational(
            ConditionStatus::Unknown,
            Reason::StatusUnavailable,
            format!("status read failed: {e}"),
        ),
    }
}

/// Write back whatever differs from `fetched`
///
/// Metadata first (finalizers, owner references, labels), then status with
/// the resourceVersion the metadata write returned. Nothing is written when
/// both are unchanged.
pub(crate) async fn persist<K: ManagedResource>(
    fetched: &K,
    mut object: K,
    store: &Store,
) -> Result<()> {
    if object.meta() != fetched.meta() {
        let updated = store.update(&object).await?;
        object.meta_mut().resource_version = updated.meta().resource_version.clone();
        debug!(name = %object.name_any(), "metadata updated");
    }
    if status_json(&object)? != status_json(fetched)? {
        store.update_status(&object).await?;
        debug!(name = %object.name_any(), "status updated");
    }
    Ok(())
}

fn status_json<K: ManagedResource>(object: &K) -> Result<Option<serde_json::Value>> {
    let mut value = serde_json::to_value(object)?;
    Ok(value.as_object_mut().and_then(|map| map.remove("status")))
}

/// Periodic re-check with jitter
pub(crate) fn scheduled(ctx: &Context) -> Action {
    Action::requeue(jittered(
        ctx.config.requeue_interval,
        ctx.config.jitter_factor,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operational_maps_device_state() {
        let up = operational_condition(Ok(OperationalStatus::Up));
        assert!(up.is_true());
        assert_eq!(up.reason, "Operational");

        let down = operational_condition(Ok(OperationalStatus::Down));
        assert!(down.is_false());
        assert_eq!(down.reason, "Degraded");

        let failed = operational_condition(Err(crate::provider::ProviderError::NotImplemented(
            "status".to_string(),
        )));
        assert_eq!(failed.status, ConditionStatus::Unknown);
        assert_eq!(failed.reason, "StatusUnavailable");
    }

    mod story {
        use super::*;
        use std::sync::Arc;

        use crate::conditions::CONFIGURED;
        use crate::controller::NveReconciler;
        use crate::crd::{
            AdminState, DeviceSpec, Endpoint, HostReachability, Interface, InterfaceSpec,
            InterfaceType, Nve, NveSpec,
        };
        use crate::provider::{Operation, ProviderError, SimulatedProvider};
        use crate::store::MemoryStore;

        const NS: &str = "default";

        struct Fixture {
            memory: Arc<MemoryStore>,
            provider: Arc<SimulatedProvider>,
            ctx: Context,
        }

        fn namespaced<K: Resource>(mut object: K) -> K {
            object.meta_mut().namespace = Some(NS.to_string());
            object
        }

        /// leaf1 with an NVE whose source interface lives on `interface_device`
        async fn fixture(interface_device: &str) -> Fixture {
            let memory = Arc::new(MemoryStore::new());
            let provider = Arc::new(SimulatedProvider::new());
            let store = Store::new(memory.clone());
            for name in ["leaf1", "leaf2"] {
                let device = Device::new(
                    name,
                    DeviceSpec {
                        endpoint: Endpoint {
                            address: "192.0.2.1".to_string(),
                            port: None,
                        },
                    },
                );
                store.create(&namespaced(device)).await.unwrap();
            }
            let lo0 = Interface::new(
                "lo0",
                InterfaceSpec {
                    device_ref: LocalObjectReference::new(interface_device),
                    name: "loopback0".to_string(),
                    type_: InterfaceType::Loopback,
                    admin_state: AdminState::Up,
                    description: None,
                },
            );
            store.create(&namespaced(lo0)).await.unwrap();
            let nve = Nve::new(
                "nve1",
                NveSpec {
                    device_ref: LocalObjectReference::new("leaf1"),
                    admin_state: AdminState::Up,
                    source_interface_ref: LocalObjectReference::new("lo0"),
                    anycast_source_interface_ref: None,
                    suppress_arp: false,
                    host_reachability: HostReachability::Bgp,
                    multicast_groups: None,
                    provider_config_ref: None,
                },
            );
            store.create(&namespaced(nve)).await.unwrap();
            let ctx = Context::builder(store, provider.clone()).build();
            Fixture {
                memory,
                provider,
                ctx,
            }
        }

        async fn pass(f: &Fixture) -> Result<Action> {
            reconcile(&ObjectKey::new(NS, "nve1"), &f.ctx, &NveReconciler).await
        }

        async fn settle(f: &Fixture) -> Nve {
            for _ in 0..5 {
                if pass(f).await.unwrap() != Action::requeue_now() {
                    break;
                }
            }
            f.ctx.store.get::<Nve>(NS, "nve1").await.unwrap().unwrap()
        }

        /// Story: a converged object is checked again and nothing is written
        #[tokio::test]
        async fn story_second_pass_writes_nothing() {
            let f = fixture("leaf1").await;
            let nve = settle(&f).await;
            assert!(conditions::find(nve.conditions(), conditions::READY)
                .unwrap()
                .is_true());
            let requests = f.provider.nve_requests();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].source_interface.spec.name, "loopback0");
            assert_eq!(requests[0].device.name_any(), "leaf1");

            let writes = f.memory.write_count();
            let action = pass(&f).await.unwrap();
            assert!(action.requeue_after().is_some());
            assert_eq!(f.memory.write_count(), writes);
        }

        /// Story: the source interface belongs to another device
        ///
        /// The mismatch is reported as a condition and the device is never
        /// contacted.
        #[tokio::test]
        async fn story_cross_device_interface_never_reaches_provider() {
            let f = fixture("leaf2").await;
            let nve = settle(&f).await;

            let configured = conditions::find(nve.conditions(), CONFIGURED).unwrap();
            assert!(configured.is_false());
            assert_eq!(configured.reason, "CrossDeviceReference");
            assert!(f.provider.calls().is_empty());
        }

        /// Story: teardown fails once, then succeeds
        ///
        /// The finalizer stays until the device confirms removal.
        #[tokio::test]
        async fn story_failed_teardown_keeps_finalizer_until_retry() {
            let f = fixture("leaf1").await;
            settle(&f).await;
            f.ctx.store.delete::<Nve>(NS, "nve1").await.unwrap();
            f.provider.fail_next(
                Operation::DeleteNve,
                ProviderError::Unavailable("link down".to_string()),
            );

            let err = pass(&f).await.unwrap_err();
            assert!(matches!(err, Error::Provider(_)));
            let still_there = f.ctx.store.get::<Nve>(NS, "nve1").await.unwrap().unwrap();
            assert!(still_there.meta().deletion_timestamp.is_some());
            assert!(still_there.finalizers().iter().any(|m| m == FINALIZER));
            assert!(f.provider.has_nve("leaf1", "nve1"));

            assert_eq!(pass(&f).await.unwrap(), Action::await_change());
            assert!(f.ctx.store.get::<Nve>(NS, "nve1").await.unwrap().is_none());
            assert!(!f.provider.has_nve("leaf1", "nve1"));
            assert_eq!(f.provider.open_sessions("leaf1"), 0);
        }

        /// Story: the device is gone before the NVE is deleted
        #[tokio::test]
        async fn story_missing_device_blocks_finalization() {
            let f = fixture("leaf1").await;
            settle(&f).await;
            f.ctx.store.delete::<Device>(NS, "leaf1").await.unwrap();
            f.ctx.store.delete::<Nve>(NS, "nve1").await.unwrap();

            let action = pass(&f).await.unwrap();
            assert!(action.requeue_after().is_some());

            let nve = f.ctx.store.get::<Nve>(NS, "nve1").await.unwrap().unwrap();
            assert!(nve.finalizers().iter().any(|m| m == FINALIZER));
            let configured = conditions::find(nve.conditions(), CONFIGURED).unwrap();
            assert_eq!(configured.reason, "WaitingForDependencies");
            assert_eq!(f.provider.count(Operation::DeleteNve), 0);
        }
    }
}
