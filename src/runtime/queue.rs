//! Bounded, deduplicating work queue with single-flight per key
//!
//! A key is in at most one of three places: waiting in `ready`, being
//! processed by a worker, or both processing and dirty (re-added while
//! in flight). A dirty key goes back to `ready` only when its worker calls
//! [`WorkQueue::done`], so the same key is never handed to two workers at
//! once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::retry::RetryConfig;

/// Result of [`WorkQueue::add`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Key is now waiting for a worker
    Queued,
    /// Key was already waiting; nothing changed
    Coalesced,
    /// Key is being processed; it runs again once that finishes
    Deferred,
    /// Queue is at capacity; the key was dropped
    Full,
    /// Queue is shutting down
    Rejected,
}

struct State<K> {
    ready: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    delayed: HashMap<K, Instant>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> Default for State<K> {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            delayed: HashMap::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

/// Work queue shared by the router, the resync loop and the worker pool
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    capacity: usize,
    backoff: RetryConfig,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    /// Queue holding at most `capacity` waiting keys
    pub fn new(capacity: usize, backoff: RetryConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            backoff,
        }
    }

    /// Request processing of `key`
    pub fn add(&self, key: K) -> AddOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.shutting_down {
                AddOutcome::Rejected
            } else if state.dirty.contains(&key) {
                AddOutcome::Coalesced
            } else if state.processing.contains(&key) {
                state.dirty.insert(key.clone());
                AddOutcome::Deferred
            } else if state.ready.len() >= self.capacity {
                AddOutcome::Full
            } else {
                state.dirty.insert(key.clone());
                state.ready.push_back(key.clone());
                AddOutcome::Queued
            }
        };

        match outcome {
            AddOutcome::Queued => self.notify.notify_one(),
            AddOutcome::Full => {
                warn!(key = %key, capacity = self.capacity, "work queue full, dropping key")
            }
            _ => trace!(key = %key, ?outcome, "key not queued"),
        }
        outcome
    }

    /// Request processing of `key` after `delay`
    ///
    /// When the key already has a pending deadline, the earlier one wins.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            match state.delayed.get(&key) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    state.delayed.insert(key.clone(), deadline);
                }
            }
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let due = {
                let mut state = queue.state.lock();
                if state.delayed.get(&key) == Some(&deadline) {
                    state.delayed.remove(&key);
                    true
                } else {
                    false
                }
            };
            if due {
                queue.add(key);
            }
        });
    }

    /// Requeue `key` after its next backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let attempt = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            *failures
        };
        let delay = self.backoff.delay_for_attempt(attempt);
        debug!(key = %key, attempt, delay_ms = delay.as_millis(), "backing off");
        self.add_after(key, delay);
    }

    /// Clear the failure history of `key`
    pub fn forget(&self, key: &K) {
        self.state.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &K) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key; `None` once the queue shuts down
    ///
    /// The caller owns the key until it calls [`WorkQueue::done`].
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as finished; requeue it if it was re-added meanwhile
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and drop pending delays
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.delayed.clear();
        }
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shutdown`] was called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Whether no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently held by workers
    pub fn in_flight(&self) -> usize {
        self.state.lock().processing.len()
    }
}
