//! Watch sources and the worker loop
//!
//! A [`Runner`] owns one work queue. Watch sources push keys into it; the run
//! loop takes keys off it and hands each to a worker task, with at most
//! `workers` passes running at once and never two for the same key.
//!
//! Failed passes are retried with per-key exponential backoff that resets
//! after a success. Errors that cannot clear on their own park the key until
//! its next watch event. A fatal error from a pass or a source stops the
//! runner.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use kube::core::ApiResource;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use super::queue::{QueueReceiver, WorkQueue};
use super::{Action, ObjectKey};
use crate::retry::RetryConfig;
use crate::store::{MemoryStore, StoredObject};
use crate::{Error, Result};

/// A change to a watched object
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    /// Created, updated, or seen during the initial list
    Applied(K),
    /// Removed from the store
    Deleted(K),
}

/// Watch a kube API and translate its events
///
/// Stream errors are yielded as [`Error::Watch`]; the underlying watcher
/// backs off and resumes on its own.
pub fn kube_events<K>(
    api: Api<K>,
    config: watcher::Config,
) -> impl Stream<Item = Result<WatchEvent<K>>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    watcher(api, config).default_backoff().filter_map(|event| async move {
        match event {
            Ok(watcher::Event::Apply(object)) | Ok(watcher::Event::InitApply(object)) => {
                Some(Ok(WatchEvent::Applied(object)))
            }
            Ok(watcher::Event::Delete(object)) => Some(Ok(WatchEvent::Deleted(object))),
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
            Err(e) => Some(Err(Error::Watch(e.to_string()))),
        }
    })
}

/// Watch a [`MemoryStore`] for one kind
pub fn memory_events<K: StoredObject>(
    store: &MemoryStore,
) -> impl Stream<Item = Result<WatchEvent<K>>> + Send {
    let resource = ApiResource::erase::<K>(&());
    BroadcastStream::new(store.subscribe()).filter_map(move |event| {
        let wanted = match &event {
            Ok(e) => e.api_version == resource.api_version && e.kind == resource.kind,
            Err(_) => true,
        };
        async move {
            if !wanted {
                return None;
            }
            Some(match event {
                Ok(e) => serde_json::from_value::<K>(e.object)
                    .map_err(Error::from)
                    .map(|object| {
                        if e.deleted {
                            WatchEvent::Deleted(object)
                        } else {
                            WatchEvent::Applied(object)
                        }
                    }),
                Err(lagged) => Err(Error::Watch(lagged.to_string())),
            })
        }
    })
}

/// Feed `queue` from a stream of events using `route`
///
/// Stream errors are logged and skipped. A routing error ends the source and
/// is returned to the runner.
pub async fn drive<S, K, F>(stream: S, queue: WorkQueue, mut route: F) -> Result<()>
where
    S: Stream<Item = Result<WatchEvent<K>>> + Send,
    F: FnMut(WatchEvent<K>) -> Result<Vec<ObjectKey>> + Send,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "watch stream error");
                continue;
            }
        };
        for key in route(event)? {
            queue.enqueue(key).await;
        }
    }
    Ok(())
}

/// Dispatches queued keys to a bounded pool of workers
pub struct Runner {
    name: String,
    queue: WorkQueue,
    receiver: QueueReceiver,
    sources: Vec<BoxFuture<'static, Result<()>>>,
    workers: usize,
    backoff: RetryConfig,
}

impl Runner {
    /// A runner with its own queue of `capacity` keys and `workers` slots
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        workers: usize,
        backoff: RetryConfig,
    ) -> Self {
        let (queue, receiver) = WorkQueue::bounded(capacity);
        Self {
            name: name.into(),
            queue,
            receiver,
            sources: Vec::new(),
            workers: workers.max(1),
            backoff,
        }
    }

    /// Producer handle for this runner's queue
    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Add an event source; it runs for as long as the runner does
    pub fn source(mut self, source: impl Future<Output = Result<()>> + Send + 'static) -> Self {
        self.sources.push(source.boxed());
        self
    }

    /// Run until `shutdown` flips or a fatal error occurs
    ///
    /// In-flight passes are not awaited on shutdown.
    pub async fn run<F, Fut>(self, reconcile: F, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        F: Fn(ObjectKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Action>> + Send + 'static,
    {
        let Runner {
            name,
            queue,
            mut receiver,
            sources,
            workers,
            backoff,
        } = self;

        let reconcile = Arc::new(reconcile);
        let semaphore = Arc::new(Semaphore::new(workers));
        let failures: Arc<DashMap<ObjectKey, u32>> = Arc::new(DashMap::new());
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<Error>(1);

        let mut running = JoinSet::new();
        for source in sources {
            running.spawn(source);
        }
        info!(runner = %name, workers, "runner started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                Some(err) = fatal_rx.recv() => return Err(err),
                Some(joined) = running.join_next() => {
                    match joined {
                        Ok(Err(e)) if e.is_fatal() => {
                            error!(runner = %name, error = %e, "watch source failed");
                            return Err(e);
                        }
                        Ok(Err(e)) => {
                            warn!(runner = %name, error = %e, "watch source ended with error")
                        }
                        Ok(Ok(())) => warn!(runner = %name, "watch source ended"),
                        Err(e) => warn!(runner = %name, error = %e, "watch source panicked"),
                    }
                    continue;
                }
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|_| Error::invariant("worker pool closed"))?,
            };

            let key = tokio::select! {
                _ = shutdown.changed() => break,
                Some(err) = fatal_rx.recv() => return Err(err),
                key = receiver.next() => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            queue.start(&key);
            let reconcile = reconcile.clone();
            let queue = queue.clone();
            let failures = failures.clone();
            let fatal_tx = fatal_tx.clone();
            let backoff = backoff.clone();
            tokio::spawn(async move {
                match reconcile(key.clone()).await {
                    Ok(action) => {
                        failures.remove(&key);
                        match action {
                            Action::Requeue(delay) => queue.enqueue_after(key.clone(), delay),
                            Action::AwaitChange => queue.cancel(&key),
                        }
                        debug!(key = %key, ?action, "pass complete");
                    }
                    Err(e) if e.is_fatal() => {
                        error!(key = %key, error = %e, "fatal reconciliation error");
                        let _ = fatal_tx.send(e).await;
                    }
                    Err(e) if !e.is_retryable() => {
                        failures.remove(&key);
                        queue.cancel(&key);
                        warn!(
                            key = %key,
                            error = %e,
                            "reconciliation failed, waiting for a change"
                        );
                    }
                    Err(e) => {
                        let attempt = {
                            let mut count = failures.entry(key.clone()).or_insert(0);
                            *count += 1;
                            *count
                        };
                        let delay = backoff.delay_for(attempt);
                        warn!(
                            key = %key,
                            error = %e,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "reconciliation failed, backing off"
                        );
                        queue.enqueue_after(key.clone(), delay);
                    }
                }
                drop(permit);
                queue.finish(&key).await;
            });
        }

        info!(runner = %name, "runner stopped");
        running.abort_all();
        Ok(())
    }
}
