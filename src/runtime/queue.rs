//! Deduplicating work queue
//!
//! Keys travel over a bounded channel. A key is in at most one of three
//! places: queued (in the channel, at most once), in flight (a worker holds
//! it), or idle. Enqueueing an in-flight key marks it dirty instead; the
//! worker re-enqueues it once when it finishes, so a burst of events during a
//! pass costs exactly one extra pass.
//!
//! Delayed enqueues keep one timer generation per key. Scheduling again
//! supersedes the older timer rather than stacking a second one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

use super::ObjectKey;

#[derive(Default)]
struct QueueState {
    queued: HashSet<ObjectKey>,
    in_flight: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    timers: HashMap<ObjectKey, u64>,
    next_generation: u64,
}

/// Producer side of the queue; cheap to clone
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<ObjectKey>,
    state: Arc<Mutex<QueueState>>,
}

/// Consumer side of the queue
pub struct QueueReceiver {
    rx: mpsc::Receiver<ObjectKey>,
}

impl QueueReceiver {
    /// Next key, `None` once every producer is gone
    pub async fn next(&mut self) -> Option<ObjectKey> {
        self.rx.recv().await
    }
}

impl WorkQueue {
    /// A queue holding at most `capacity` pending keys
    pub fn bounded(capacity: usize) -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                state: Arc::new(Mutex::new(QueueState::default())),
            },
            QueueReceiver { rx },
        )
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request a pass for `key`
    ///
    /// Returns `true` when the key was put on the channel, `false` when it
    /// was already pending or was marked dirty while in flight.
    pub async fn enqueue(&self, key: ObjectKey) -> bool {
        {
            let mut state = self.lock();
            if state.in_flight.contains(&key) {
                trace!(key = %key, "in flight, marking dirty");
                state.dirty.insert(key);
                return false;
            }
            if !state.queued.insert(key.clone()) {
                return false;
            }
        }
        if self.tx.send(key.clone()).await.is_err() {
            self.lock().queued.remove(&key);
            return false;
        }
        true
    }

    /// Request a pass for `key` after `delay`, replacing any earlier timer
    pub fn enqueue_after(&self, key: ObjectKey, delay: Duration) {
        let generation = {
            let mut state = self.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.timers.insert(key.clone(), generation);
            generation
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let current = {
                let mut state = queue.lock();
                if state.timers.get(&key) == Some(&generation) {
                    state.timers.remove(&key);
                    true
                } else {
                    false
                }
            };
            if current {
                queue.enqueue(key).await;
            }
        });
    }

    /// Drop any pending timer for `key`
    pub fn cancel(&self, key: &ObjectKey) {
        self.lock().timers.remove(key);
    }

    /// Mark `key` as taken by a worker
    pub(crate) fn start(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.queued.remove(key);
        state.in_flight.insert(key.clone());
    }

    /// Release `key`; re-enqueues it if events arrived during the pass
    pub(crate) async fn finish(&self, key: &ObjectKey) {
        let dirty = {
            let mut state = self.lock();
            state.in_flight.remove(key);
            state.dirty.remove(key)
        };
        if dirty {
            self.enqueue(key.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    #[tokio::test]
    async fn pending_keys_are_deduplicated() {
        let (queue, mut rx) = WorkQueue::bounded(8);
        assert!(queue.enqueue(key("a")).await);
        assert!(!queue.enqueue(key("a")).await);
        assert!(queue.enqueue(key("b")).await);

        assert_eq!(rx.next().await, Some(key("a")));
        assert_eq!(rx.next().await, Some(key("b")));
        assert!(rx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_during_a_pass_coalesce_into_one_rerun() {
        let (queue, mut rx) = WorkQueue::bounded(8);
        queue.enqueue(key("a")).await;
        let taken = rx.next().await.unwrap();
        queue.start(&taken);

        assert!(!queue.enqueue(key("a")).await);
        assert!(!queue.enqueue(key("a")).await);
        assert!(!queue.lock().queued.contains(&key("a")));

        queue.finish(&taken).await;
        assert_eq!(rx.next().await, Some(key("a")));
        assert!(rx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn clean_finish_does_not_requeue() {
        let (queue, mut rx) = WorkQueue::bounded(8);
        queue.enqueue(key("a")).await;
        let taken = rx.next().await.unwrap();
        queue.start(&taken);
        queue.finish(&taken).await;
        assert!(rx.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn later_schedule_supersedes_earlier_timer() {
        let (queue, mut rx) = WorkQueue::bounded(8);
        queue.enqueue_after(key("a"), Duration::from_secs(10));
        queue.enqueue_after(key("a"), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(rx.rx.try_recv().is_err());
        assert!(queue.lock().timers.contains_key(&key("a")));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(rx.next().await, Some(key("a")));
        assert!(!queue.lock().timers.contains_key(&key("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (queue, mut rx) = WorkQueue::bounded(8);
        queue.enqueue_after(key("a"), Duration::from_secs(5));
        queue.cancel(&key("a"));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(rx.rx.try_recv().is_err());
    }
}
