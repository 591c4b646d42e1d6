//! Controllers for the fabric CRDs
//!
//! Each primary kind (NVE, VTEP) runs its own [`Runner`] fed by watches on
//! the primary and on every kind it depends on. The per-kind logic lives in
//! a [`Reconciler`]; ordering, conditions and finalizers are shared in
//! [`engine`].

pub mod engine;
pub mod finalizer;
pub mod nve;
pub mod ownership;
pub mod registry;
pub mod resolver;
pub mod vtep;

pub use engine::{reconcile, ManagedResource, Reconciler};
pub use nve::NveReconciler;
pub use registry::{ProviderConfig, ProviderConfigKind, ProviderConfigRegistry};
pub use resolver::{DependencyError, Resolver};
pub use vtep::VtepReconciler;

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::sync::watch;
use tracing::{info, instrument};

use crate::crd::{Device, EvpnControlPlane, Interface, NveConfig, VtepConfig};
use crate::provider::{ManagedKind, Provider};
use crate::retry::RetryConfig;
use crate::runtime::{
    drive, kube_events, memory_events, GroupKind, ObjectKey, Router, Runner, WatchEvent,
    WorkQueue,
};
use crate::store::{MemoryStore, Store, StoredObject};
use crate::{Result, DEFAULT_REQUEUE_INTERVAL};

/// Tunables shared by every controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace to watch, all namespaces when unset
    pub namespace: Option<String>,
    /// Periodic re-check interval for healthy objects
    pub requeue_interval: Duration,
    /// Largest fraction of `requeue_interval` added at random
    pub jitter_factor: f64,
    /// Concurrent passes per controller
    pub workers: usize,
    /// Pending keys per controller
    pub queue_capacity: usize,
    /// Retry schedule for failed passes
    pub backoff: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            jitter_factor: 0.1,
            workers: 4,
            queue_capacity: 1024,
            backoff: RetryConfig::default(),
        }
    }
}

/// Shared state handed to every reconciliation pass
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(store, provider)
///     .namespace("fabric")
///     .build();
/// ```
pub struct Context {
    /// Object store
    pub store: Store,
    /// Device gateway
    pub provider: Arc<dyn Provider>,
    /// Dependency resolver over `store`
    pub resolver: Resolver,
    /// Tunables
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(store: Store, provider: Arc<dyn Provider>) -> ContextBuilder {
        ContextBuilder::new(store, provider)
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    store: Store,
    provider: Arc<dyn Provider>,
    registry: ProviderConfigRegistry,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(store: Store, provider: Arc<dyn Provider>) -> Self {
        Self {
            store,
            provider,
            registry: ProviderConfigRegistry::builtin(),
            config: ControllerConfig::default(),
        }
    }

    /// Replace the provider config registry
    pub fn registry(mut self, registry: ProviderConfigRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace all tunables at once
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Restrict the controllers to one namespace
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = Some(namespace.into());
        self
    }

    /// Set the periodic re-check interval
    pub fn requeue_interval(mut self, interval: Duration) -> Self {
        self.config.requeue_interval = interval;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let resolver = Resolver::new(self.store.clone(), Arc::new(self.registry));
        Context {
            store: self.store,
            provider: self.provider,
            resolver,
            config: self.config,
        }
    }
}

/// Where watch events come from
pub trait EventSource: Clone + Send + Sync + 'static {
    /// Events for one kind, for as long as the source lives
    fn events<K: StoredObject>(&self) -> BoxStream<'static, Result<WatchEvent<K>>>;
}

/// Watches on the Kubernetes API server
#[derive(Clone)]
pub struct KubeEvents {
    client: Client,
    namespace: Option<String>,
}

impl KubeEvents {
    /// Watch `namespace`, or every namespace when `None`
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }
}

impl EventSource for KubeEvents {
    fn events<K: StoredObject>(&self) -> BoxStream<'static, Result<WatchEvent<K>>> {
        let api: Api<K> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        kube_events(api, watcher::Config::default()).boxed()
    }
}

/// Watches on a [`MemoryStore`]
#[derive(Clone)]
pub struct MemoryEvents {
    store: Arc<MemoryStore>,
}

impl MemoryEvents {
    /// Subscribe to `store`
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

impl EventSource for MemoryEvents {
    fn events<K: StoredObject>(&self) -> BoxStream<'static, Result<WatchEvent<K>>> {
        memory_events::<K>(&self.store).boxed()
    }
}

/// Run the controller for one primary kind until `shutdown` flips
///
/// Existing primaries are listed first to prime the reference index and
/// queue an initial pass each; then watches start on the primary and on its
/// dependency kinds:
///
/// | Kind             | Routed through                         |
/// |------------------|----------------------------------------|
/// | Device           | reference index                        |
/// | Interface        | reference index                        |
/// | EVPNControlPlane | reference index, controlling owner     |
/// | provider configs | reference index, controlling owner     |
#[instrument(skip_all, fields(kind = %<R::Object as ManagedResource>::KIND))]
pub async fn run<R, E>(
    reconciler: R,
    ctx: Arc<Context>,
    events: E,
    shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    R: Reconciler,
    E: EventSource,
{
    let kind = <R::Object as ManagedResource>::KIND;
    let config = &ctx.config;
    let router = Router::new();

    let existing = ctx
        .store
        .list::<R::Object>(config.namespace.as_deref(), None)
        .await?;
    router.prime(&existing)?;
    let initial: Vec<ObjectKey> = existing.iter().filter_map(ObjectKey::for_object).collect();
    info!(count = initial.len(), "primed from existing objects");

    let runner = Runner::new(
        kind.to_string(),
        config.queue_capacity,
        config.workers,
        config.backoff.clone(),
    );
    let queue = runner.queue();
    let owner = GroupKind::of::<R::Object>();

    let initial_queue = queue.clone();
    let primary_router = router.clone();
    let mut runner = runner
        .source(async move {
            for key in initial {
                initial_queue.enqueue(key).await;
            }
            Ok(())
        })
        .source(drive(
            events.events::<R::Object>(),
            queue.clone(),
            move |event| match event {
                WatchEvent::Applied(o) => primary_router.primary_applied(&o),
                WatchEvent::Deleted(o) => Ok(primary_router.primary_deleted(&o)),
            },
        ))
        .source(dependency_source::<Device, _>(&events, &queue, &router, None))
        .source(dependency_source::<Interface, _>(
            &events, &queue, &router, None,
        ));

    if kind == ManagedKind::Vtep {
        runner = runner.source(dependency_source::<EvpnControlPlane, _>(
            &events,
            &queue,
            &router,
            Some(owner.clone()),
        ));
    }

    for config_kind in ctx.resolver.registry().kinds_for(kind) {
        runner = match config_kind {
            ProviderConfigKind::NxNveConfig => runner.source(dependency_source::<NveConfig, _>(
                &events,
                &queue,
                &router,
                Some(owner.clone()),
            )),
            ProviderConfigKind::NxVtepConfig => runner.source(
                dependency_source::<VtepConfig, _>(&events, &queue, &router, Some(owner.clone())),
            ),
        };
    }

    let reconciler = Arc::new(reconciler);
    runner
        .run(
            move |key| {
                let ctx = ctx.clone();
                let reconciler = reconciler.clone();
                async move { reconcile(&key, &ctx, reconciler.as_ref()).await }
            },
            shutdown,
        )
        .await
}

/// A watch on dependency kind `D` routed onto primaries
fn dependency_source<D, E>(
    events: &E,
    queue: &WorkQueue,
    router: &Router,
    owner: Option<GroupKind>,
) -> impl std::future::Future<Output = Result<()>> + Send + 'static
where
    D: StoredObject,
    E: EventSource,
{
    let router = router.clone();
    drive(events.events::<D>(), queue.clone(), move |event| match event {
        WatchEvent::Applied(d) => router.dependency_applied(&d, owner.as_ref()),
        WatchEvent::Deleted(d) => router.dependency_deleted(&d, owner.as_ref()),
    })
}
