//! Deduplicating, per-key rate-limited work queue.
//!
//! The watch stream delivers secret change notifications unordered, possibly
//! repeated, and possibly while an earlier notification for the same secret
//! is still being reconciled. This queue turns that stream into a schedule
//! the workers can drain safely:
//!
//! - a key is handed to at most one worker at a time
//! - events that arrive while a key is being processed are coalesced into a
//!   single redelivery after [`WorkQueue::done`]
//! - failed keys come back through [`WorkQueue::add_rate_limited`] with a
//!   per-key exponential backoff that [`WorkQueue::forget`] resets
//!
//! Every key's status lives in a single record inside one mutex-guarded map,
//! so the exclusion invariant (absent, queued, or processing, never more
//! than one) is enforced by construction rather than by keeping parallel
//! sets in sync.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use certwatch_common::{ChangeReason, SecretRef};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

/// Backoff base of the upstream default controller rate limiter.
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Backoff ceiling of the upstream default controller rate limiter.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// A dequeued unit of work: which secret, and the most recent reason it was
/// enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Secret to reconcile
    pub key: SecretRef,
    /// Latest change reason observed for the key
    pub reason: ChangeReason,
}

/// Where a key currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    /// Not queued and not being processed; the record only survives to keep
    /// the failure counter until the key succeeds
    Idle,
    /// Waiting in FIFO order for a worker
    Queued,
    /// Owned by exactly one worker
    Processing,
    /// Owned by a worker, and a new event arrived meanwhile; redelivered
    /// once after `done`
    Dirty,
}

/// Per-key bookkeeping: lifecycle state, latest reason, failure count.
#[derive(Debug)]
struct KeyRecord {
    state: KeyState,
    reason: ChangeReason,
    failures: u32,
}

#[derive(Default)]
struct QueueState {
    records: HashMap<SecretRef, KeyRecord>,
    order: VecDeque<SecretRef>,
    shutdown: bool,
}

/// Deduplicating work queue with per-key exponential backoff.
///
/// All mutation funnels through one mutex; [`WorkQueue::get`] suspends on a
/// [`Notify`] instead of polling. Backoff re-enqueues run on spawned timers
/// so they never occupy a worker.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl WorkQueue {
    /// Queue with the default backoff window (5ms doubling up to 1000s).
    pub fn new() -> Arc<Self> {
        Self::with_backoff(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    /// Queue with an explicit backoff window.
    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        })
    }

    /// Enqueue a change notification for `key`.
    ///
    /// If the key is already queued, only the reason is refreshed. If the
    /// key is currently being processed, the key is marked dirty and will be
    /// redelivered once after the worker calls [`WorkQueue::done`].
    pub fn add(&self, key: SecretRef, reason: ChangeReason) {
        let mut guard = self.state.lock();
        if guard.shutdown {
            return;
        }

        let state = &mut *guard;
        let record = state.records.entry(key.clone()).or_insert(KeyRecord {
            state: KeyState::Idle,
            reason,
            failures: 0,
        });
        // Latest enqueued reason wins coalescing.
        record.reason = reason;

        let wake = match record.state {
            KeyState::Idle => {
                record.state = KeyState::Queued;
                state.order.push_back(key);
                true
            }
            KeyState::Queued | KeyState::Dirty => false,
            KeyState::Processing => {
                trace!(key = %key, "coalescing event for in-flight key");
                record.state = KeyState::Dirty;
                false
            }
        };

        drop(guard);
        if wake {
            self.notify.notify_one();
        }
    }

    /// Pop the next key, suspending while the queue is empty.
    ///
    /// Returns `None` once [`WorkQueue::shut_down`] has been called; workers
    /// use that as their exit signal.
    pub async fn get(&self) -> Option<QueueEntry> {
        loop {
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.order.pop_front() {
                    let record = state
                        .records
                        .get_mut(&key)
                        .expect("queued key must have a record");
                    record.state = KeyState::Processing;
                    return Some(QueueEntry {
                        reason: record.reason,
                        key,
                    });
                }
                if state.shutdown {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark processing of `key` finished.
    ///
    /// If events arrived while the key was in flight, it is re-queued here
    /// so none of them are lost.
    pub fn done(&self, key: &SecretRef) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(record) = state.records.get_mut(key) else {
            return;
        };

        let wake = match record.state {
            KeyState::Dirty => {
                record.state = KeyState::Queued;
                state.order.push_back(key.clone());
                true
            }
            KeyState::Processing => {
                if record.failures == 0 {
                    state.records.remove(key);
                } else {
                    // Keep the record alive so the backoff counter survives
                    // until the key eventually succeeds.
                    record.state = KeyState::Idle;
                }
                false
            }
            KeyState::Idle | KeyState::Queued => false,
        };

        drop(guard);
        if wake {
            self.notify.notify_one();
        }
    }

    /// Re-enqueue `key` after its per-key backoff delay.
    ///
    /// Each call lengthens the next delay (base × 2^failures, clamped to the
    /// ceiling) until [`WorkQueue::forget`] resets the counter. The delay
    /// runs on a spawned timer; if a fresh event arrives first, the timer's
    /// re-add coalesces into it without overriding the newer reason, and a
    /// `forget` before the timer fires cancels the retry outright.
    pub fn add_rate_limited(self: &Arc<Self>, key: SecretRef, reason: ChangeReason) {
        let delay = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            let record = state.records.entry(key.clone()).or_insert(KeyRecord {
                state: KeyState::Idle,
                reason,
                failures: 0,
            });
            let delay = self.backoff_for(record.failures);
            record.failures = record.failures.saturating_add(1);
            delay
        };

        trace!(key = %key, delay_ms = delay.as_millis() as u64, "scheduling rate-limited requeue");

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.requeue(key, reason);
        });
    }

    /// Reset the backoff counter for `key`. Called on successful
    /// reconciliation.
    pub fn forget(&self, key: &SecretRef) {
        let mut state = self.state.lock();
        if let Some(record) = state.records.get_mut(key) {
            record.failures = 0;
            if record.state == KeyState::Idle {
                state.records.remove(key);
            }
        }
    }

    /// Stop dispatch: all blocked and future [`WorkQueue::get`] calls return
    /// `None`. Keys already handed to workers are unaffected.
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
        }
        self.notify.notify_waiters();
    }

    /// Number of keys waiting for dispatch (excludes in-flight keys).
    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    /// True when no key is waiting for dispatch.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deferred re-add from a backoff timer.
    ///
    /// Unlike [`WorkQueue::add`] this never overrides the reason of an entry
    /// that is already pending (a fresh event enqueued during the delay is
    /// newer than the retry), and it drops the retry entirely when the key
    /// has been forgotten since the failure: the retry's purpose is gone
    /// once the key completed successfully.
    fn requeue(&self, key: SecretRef, reason: ChangeReason) {
        let mut guard = self.state.lock();
        if guard.shutdown {
            return;
        }

        let state = &mut *guard;
        let Some(record) = state.records.get_mut(&key) else {
            return;
        };
        if record.failures == 0 {
            return;
        }

        let wake = match record.state {
            KeyState::Idle => {
                record.state = KeyState::Queued;
                record.reason = reason;
                state.order.push_back(key);
                true
            }
            KeyState::Processing => {
                record.state = KeyState::Dirty;
                false
            }
            KeyState::Queued | KeyState::Dirty => false,
        };

        drop(guard);
        if wake {
            self.notify.notify_one();
        }
    }

    fn backoff_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
