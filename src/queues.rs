// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Retrying work queues for reconciliation.
//!
//! A [`RetryingWorkQueue`] is a keyed FIFO with rate-limited retries. Event
//! handlers enqueue resource keys; worker tasks pull a key, re-read the
//! current entity through the injected reflector store, and run the
//! processor. Failed keys are re-enqueued with exponential backoff until the
//! retry budget is spent.
//!
//! Guarantees:
//!
//! - Duplicate pending keys coalesce: a key is queued at most once.
//! - At most one worker holds a given key at any instant. An `add` that
//!   arrives while the key is in flight marks it dirty and causes a single
//!   re-queue after the current run completes.
//! - Keys whose entity has vanished from the cache are forgotten without
//!   invoking the processor.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::runtime::reflector::{Lookup, ObjectRef, Store};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{MAX_QUEUE_RETRIES, QUEUE_BASE_DELAY_MILLIS, QUEUE_MAX_DELAY_SECS};

/// A keyed FIFO with per-key retry backoff and read-through entity lookup.
pub struct RetryingWorkQueue<K>
where
    K: Lookup<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    queue_type: &'static str,
    threadiness: usize,
    store: Store<K>,
    inner: Arc<Inner<K>>,
}

struct Inner<K: Lookup<DynamicType = ()>> {
    state: Mutex<State<K>>,
    notify: Notify,
}

struct State<K: Lookup<DynamicType = ()>> {
    pending: VecDeque<ObjectRef<K>>,
    queued: HashSet<ObjectRef<K>>,
    active: HashSet<ObjectRef<K>>,
    dirty: HashSet<ObjectRef<K>>,
    requeues: HashMap<ObjectRef<K>, u32>,
    shut_down: bool,
}

impl<K: Lookup<DynamicType = ()>> Default for State<K> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            queued: HashSet::new(),
            active: HashSet::new(),
            dirty: HashSet::new(),
            requeues: HashMap::new(),
            shut_down: false,
        }
    }
}

impl<K> RetryingWorkQueue<K>
where
    K: Lookup<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Create a queue that resolves keys through `store`.
    #[must_use]
    pub fn new(queue_type: &'static str, store: Store<K>, threadiness: usize) -> Self {
        Self {
            queue_type,
            threadiness: threadiness.max(1),
            store,
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue the key for an entity, coalescing duplicates.
    pub fn add(&self, obj: &K) {
        let key = obj.to_object_ref(());
        self.add_key(key);
    }

    fn add_key(&self, key: ObjectRef<K>) {
        let mut state = self.inner.state.lock().expect("queue state poisoned");
        if state.shut_down {
            return;
        }
        Self::enqueue_locked(&mut state, key);
        drop(state);
        self.inner.notify.notify_one();
    }

    fn enqueue_locked(state: &mut State<K>, key: ObjectRef<K>) {
        if state.active.contains(&key) {
            // Re-queued once after the in-flight run completes
            state.dirty.insert(key);
        } else if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
        }
    }

    /// Spawn `threadiness` workers that process keys until [`shutdown`] is
    /// called.
    ///
    /// [`shutdown`]: RetryingWorkQueue::shutdown
    pub fn run<F, Fut>(self: &Arc<Self>, processor: F) -> Vec<JoinHandle<()>>
    where
        F: Fn(Arc<K>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        info!("Starting {} queue", self.queue_type);
        (0..self.threadiness)
            .map(|_| {
                let queue = Arc::clone(self);
                let processor = processor.clone();
                tokio::spawn(async move { queue.worker(processor).await })
            })
            .collect()
    }

    async fn worker<F, Fut>(self: Arc<Self>, processor: F)
    where
        F: Fn(Arc<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        while let Some(key) = self.next_key().await {
            match self.store.get(&key) {
                None => {
                    // Entity vanished from the cache; nothing left to reconcile
                    warn!("{} {:?} does not exist anymore", self.queue_type, key);
                    self.forget(&key);
                }
                Some(obj) => {
                    let result = processor(obj).await;
                    self.finish(key, result);
                }
            }
        }
        debug!("{} queue worker stopping", self.queue_type);
    }

    async fn next_key(&self) -> Option<ObjectRef<K>> {
        loop {
            {
                let mut state = self.inner.state.lock().expect("queue state poisoned");
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    let more_pending = !state.pending.is_empty();
                    drop(state);
                    if more_pending {
                        // Hand the wakeup on so siblings drain the backlog
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    fn finish(self: &Arc<Self>, key: ObjectRef<K>, result: anyhow::Result<()>) {
        let mut state = self.inner.state.lock().expect("queue state poisoned");
        state.active.remove(&key);

        match result {
            Ok(()) => {
                // Success clears the retry history so future errors start a
                // fresh backoff sequence
                state.requeues.remove(&key);
                if state.dirty.remove(&key) {
                    Self::enqueue_locked(&mut state, key);
                    drop(state);
                    self.inner.notify.notify_one();
                }
            }
            Err(err) => {
                state.dirty.remove(&key);
                let attempts = state.requeues.entry(key.clone()).or_insert(0);
                *attempts += 1;
                if *attempts <= MAX_QUEUE_RETRIES {
                    let delay = Self::backoff_for(*attempts);
                    info!(
                        "Error syncing {} {:?}: {:#}. Retrying in {:?}",
                        self.queue_type, key, err, delay
                    );
                    drop(state);
                    let queue = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        queue.add_key(key);
                    });
                } else {
                    state.requeues.remove(&key);
                    warn!(
                        "Dropping {} {:?} out of the queue: {:#}",
                        self.queue_type, key, err
                    );
                }
            }
        }
    }

    fn forget(&self, key: &ObjectRef<K>) {
        let mut state = self.inner.state.lock().expect("queue state poisoned");
        state.active.remove(key);
        state.dirty.remove(key);
        state.requeues.remove(key);
    }

    /// Per-key delay for the nth consecutive failure: exponential from the
    /// base delay, capped.
    fn backoff_for(attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let millis = QUEUE_BASE_DELAY_MILLIS.saturating_mul(1u64 << exp);
        Duration::from_millis(millis).min(Duration::from_secs(QUEUE_MAX_DELAY_SECS))
    }

    /// Wake every worker to exit. Pending keys are discarded.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock().expect("queue state poisoned");
        state.shut_down = true;
        state.pending.clear();
        state.queued.clear();
        drop(state);
        self.inner.notify.notify_waiters();
        info!("Stopping {} queue", self.queue_type);
    }
}

#[cfg(test)]
#[path = "queues_tests.rs"]
mod queues_tests;
