//! Deduplicating, delayable, rate-limited work queue
//!
//! The queue holds resource keys, not events. Multiple enqueues of the same
//! key before it is processed collapse into a single pending delivery, and a
//! key is never delivered to two workers at once: a key added while in
//! flight is deferred until [`WorkQueue::done`] is called for the previous
//! delivery.
//!
//! Three ways in:
//! - [`WorkQueue::add`] - eligible immediately
//! - [`WorkQueue::add_after`] - eligible once a deadline passes
//! - [`WorkQueue::add_rate_limited`] - eligible after an exponential
//!   per-key backoff (1s base, 5min cap), reset by [`WorkQueue::forget`]

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::ObjectKey;

/// First retry delay for a failing key
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the retry delay for a failing key
const MAX_DELAY: Duration = Duration::from_secs(300);

/// A key waiting for its deadline before becoming eligible
#[derive(PartialEq, Eq)]
struct DelayedItem {
    deadline: Instant,
    key: ObjectKey,
}

impl Ord for DelayedItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for DelayedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    /// Keys eligible for delivery, in arrival order
    ready: VecDeque<ObjectKey>,
    /// Keys with a pending delivery (ready or deferred behind processing)
    dirty: HashSet<ObjectKey>,
    /// Keys currently delivered to a worker
    processing: HashSet<ObjectKey>,
    /// Keys waiting for a deadline, earliest first
    delayed: BinaryHeap<Reverse<DelayedItem>>,
    /// Consecutive failure count per key, for backoff
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

impl QueueState {
    /// Mark the key dirty and push it to the ready list unless it is already
    /// pending or in flight. Returns true when a waiter should be woken.
    fn insert_ready(&mut self, key: ObjectKey) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            // In flight: done() will re-queue it
            return false;
        }
        self.ready.push_back(key);
        true
    }

    /// Move every delayed item whose deadline has passed onto the ready list
    fn promote_due(&mut self, now: Instant) {
        while matches!(self.delayed.peek(), Some(Reverse(item)) if item.deadline <= now) {
            if let Some(Reverse(item)) = self.delayed.pop() {
                self.insert_ready(item.key);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse(item)| item.deadline)
    }
}

/// Work queue of resource keys with deduplication, delayed eligibility, and
/// per-key rate limiting
///
/// Invariants:
/// - at most one in-flight delivery per key at any time
/// - delayed items become eligible no earlier than their deadline
/// - an item is never dropped silently; shutdown delivers what is already
///   eligible and then stops
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn locked(&self) -> MutexGuard<'_, QueueState> {
        // The queue never panics while holding the lock, but recover anyway
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a key for immediate processing
    pub fn add(&self, key: ObjectKey) {
        let woke = self.locked().insert_ready(key);
        if woke {
            self.notify.notify_one();
        }
    }

    /// Enqueue a key to become eligible only after `delay` elapses
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        {
            let mut state = self.locked();
            if state.shutting_down {
                return;
            }
            state.delayed.push(Reverse(DelayedItem {
                deadline: Instant::now() + delay,
                key,
            }));
        }
        // Wake a sleeping getter so it re-arms its timer for the new deadline
        self.notify.notify_one();
    }

    /// Re-enqueue a failed key with exponential backoff
    ///
    /// The delay grows with the key's consecutive failure count and is reset
    /// by [`Self::forget`] once the key succeeds.
    pub fn add_rate_limited(&self, key: ObjectKey) {
        let delay = {
            let mut state = self.locked();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = backoff_for(*failures);
            *failures += 1;
            state.delayed.push(Reverse(DelayedItem {
                deadline: Instant::now() + delay,
                key,
            }));
            delay
        };
        tracing::debug!(delay_ms = delay.as_millis() as u64, "key re-queued with backoff");
        self.notify.notify_one();
    }

    /// Block until a key is eligible and deliver it to exactly one caller
    ///
    /// Returns `None` once the queue has shut down and everything already
    /// eligible has been delivered.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            // Arm the notification before inspecting state so a concurrent
            // add between the check and the await is not lost
            let notified = self.notify.notified();

            let deadline = {
                let mut state = self.locked();
                state.promote_due(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark processing of a key as finished
    ///
    /// If the key was re-added while in flight, it becomes eligible again
    /// now - this is what serializes per-key deliveries.
    pub fn done(&self, key: &ObjectKey) {
        let woke = {
            let mut state = self.locked();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if woke {
            self.notify.notify_one();
        }
    }

    /// Reset the backoff counter for a key after a successful reconcile
    pub fn forget(&self, key: &ObjectKey) {
        self.locked().failures.remove(key);
    }

    /// Stop accepting new work and let `get` drain what is already eligible
    pub fn shutdown(&self) {
        self.locked().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Number of keys currently eligible for delivery
    pub fn len(&self) -> usize {
        self.locked().ready.len()
    }

    /// Whether no keys are currently eligible
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Backoff delay for a key that has failed `failures` times before
fn backoff_for(failures: u32) -> Duration {
    let factor = 1u64 << failures.min(32);
    Duration::from_millis((BASE_DELAY.as_millis() as u64).saturating_mul(factor)).min(MAX_DELAY)
}
