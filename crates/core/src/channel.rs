//! Bounded single-producer/multi-consumer FIFO with drop policies,
//! drop-listeners, timed reads, and cooperative cancellation.
//!
//! A lock-free ring buffer with a counting semaphore would also satisfy the
//! contract below; a mutex+condvar bounded queue is an equally acceptable
//! substitute. Performance matters most on the hot write path (every
//! submitted frame) and the N-way read-join handoff, and a
//! `Mutex<VecDeque<T>>` keeps that path simple to reason about.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::PipelineError;

/// What happens to an item enqueued against a full channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Evict the oldest queued item to make room for the new one.
    Oldest,
    /// Reject the new item, leaving the queue untouched.
    Newest,
}

struct Inner<T> {
    queue: VecDeque<T>,
    cancelled: bool,
    pending_reads: u64,
}

/// A bounded FIFO channel. See module docs for the concurrency contract.
pub struct Channel<T> {
    capacity: usize,
    policy: DropPolicy,
    state: Mutex<Inner<T>>,
    not_empty: Condvar,
    listeners: Mutex<Vec<Box<dyn Fn(&T) + Send + Sync>>>,
}

impl<T> Channel<T> {
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        Self {
            capacity,
            policy,
            state: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                cancelled: false,
                pending_reads: 0,
            }),
            not_empty: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback invoked synchronously, inside the enqueue call
    /// that caused the drop, with the evicted (or rejected) value.
    pub fn connect_dropped<F>(&self, listener: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    fn notify_dropped(&self, value: &T) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener(value);
        }
    }

    /// Current occupancy snapshot.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// Non-blocking write. Returns `true` if `value` ended up enqueued.
    ///
    /// - If there is space, the item is appended and a waiting reader is woken.
    /// - If full and the policy is `Oldest`, the front item is evicted (and
    ///   reported to drop-listeners) to make room.
    /// - If full and the policy is `Newest`, `value` itself is reported to
    ///   drop-listeners and rejected.
    pub fn try_write(&self, value: T) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.queue.len() < self.capacity {
            state.queue.push_back(value);
            self.not_empty.notify_one();
            return true;
        }

        match self.policy {
            DropPolicy::Oldest => {
                if let Some(evicted) = state.queue.pop_front() {
                    state.queue.push_back(value);
                    self.not_empty.notify_one();
                    drop(state);
                    self.notify_dropped(&evicted);
                    true
                } else {
                    // Capacity zero degenerate case: nothing to evict.
                    drop(state);
                    self.notify_dropped(&value);
                    false
                }
            }
            DropPolicy::Newest => {
                drop(state);
                self.notify_dropped(&value);
                false
            }
        }
    }

    /// Wait up to `timeout` for an item. Returns `None` on timeout, or
    /// `Err(Cancelled)` if the channel is or becomes cancelled during the wait.
    pub fn try_read(&self, timeout: Duration) -> Result<Option<T>, PipelineError> {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            return Err(PipelineError::Cancelled);
        }

        state.pending_reads += 1;
        let deadline = Instant::now() + timeout;

        let result = loop {
            if let Some(value) = state.queue.pop_front() {
                break Ok(Some(value));
            }
            if state.cancelled {
                break Err(PipelineError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                break Ok(None);
            }
            let (guard, wait_result) = self
                .not_empty
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
            if wait_result.timed_out() && state.queue.is_empty() && !state.cancelled {
                break Ok(None);
            }
        };

        state.pending_reads -= 1;
        result
    }

    /// Blocking read with unbounded wait. Fails with `Cancelled` under the
    /// same conditions as `try_read`.
    pub fn read(&self) -> Result<T, PipelineError> {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            return Err(PipelineError::Cancelled);
        }
        state.pending_reads += 1;

        let result = loop {
            if let Some(value) = state.queue.pop_front() {
                break Ok(value);
            }
            if state.cancelled {
                break Err(PipelineError::Cancelled);
            }
            state = self.not_empty.wait(state).unwrap();
        };

        state.pending_reads -= 1;
        result
    }

    /// Idempotently cancel the channel, waking every reader currently
    /// blocked in `read`/`try_read` so it observes `Cancelled` immediately.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        self.not_empty.notify_all();
    }

    /// Drain and return every item still queued, e.g. during shutdown.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock().unwrap();
        state.queue.drain(..).collect()
    }
}
