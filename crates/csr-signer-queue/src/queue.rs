//! Deduplicating, rate-limited work queue
//!
//! Every key has an explicit state record `{dirty, processing}` kept behind a
//! single mutex together with the FIFO of ready keys and the table of delayed
//! re-adds:
//!
//! - `add` marks a key dirty and queues it, unless it is already dirty
//!   (collapses duplicates) or currently processing (deferred until `done`).
//! - `get` hands out the oldest ready key and marks it processing, so no two
//!   consumers ever hold the same key at once.
//! - `done` clears processing and re-queues the key if it was added meanwhile.
//!
//! Delayed re-adds (`add_after`, `add_rate_limited`) are tokio timers; a newer
//! request for the same key only ever moves its deadline earlier.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::rate_limiter::RateLimiter;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ItemState {
    /// Needs processing (queued, or re-added while processing)
    dirty: bool,
    /// Currently held by a consumer
    processing: bool,
}

struct State<K> {
    ready: VecDeque<K>,
    items: HashMap<K, ItemState>,
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

/// A cloneable handle to a shared work queue
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a named queue using `rate_limiter` for `add_rate_limited`
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    ready: VecDeque::new(),
                    items: HashMap::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    /// Name given at construction
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `key` as needing processing
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            return;
        }
        let item = state.items.entry(key.clone()).or_default();
        if item.dirty {
            trace!(queue = %self.inner.name, ?key, "Key already pending");
            return;
        }
        item.dirty = true;
        if item.processing {
            trace!(queue = %self.inner.name, ?key, "Key in processing, deferring");
            return;
        }
        state.ready.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next key; `None` once the queue is shut down and drained
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add or shutdown
            // cannot slip between the check and the wait.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.ready.pop_front() {
                    let item = state.items.entry(key.clone()).or_default();
                    item.processing = true;
                    item.dirty = false;
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on; one notify may cover several adds.
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        let requeue = match state.items.get_mut(key) {
            Some(item) => {
                item.processing = false;
                item.dirty
            }
            None => false,
        };
        if requeue {
            state.ready.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        } else {
            state.items.remove(key);
        }
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            if let Some(existing) = state.waiting.get(&key) {
                if *existing <= ready_at {
                    return;
                }
            }
            state.waiting.insert(key.clone(), ready_at);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            let fire = {
                let mut state = queue.inner.state.lock();
                if state.waiting.get(&key) == Some(&ready_at) {
                    state.waiting.remove(&key);
                    true
                } else {
                    false
                }
            };
            if fire {
                queue.add(key);
            }
        });
    }

    /// Add `key` after the delay chosen by the rate limiter
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.rate_limiter.when(&key);
        trace!(queue = %self.inner.name, ?key, delay_ms = delay.as_millis() as u64, "Requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Reset the failure history of `key`
    pub fn forget(&self, key: &K) {
        self.inner.rate_limiter.forget(key);
    }

    /// Number of rate-limited requeues recorded for `key`
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.rate_limiter.num_requeues(key)
    }

    /// Number of keys ready to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    /// Whether no key is ready to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys and wake every waiting consumer
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.inner.notify.notify_waiters();
    }

    /// Whether `shut_down` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}
