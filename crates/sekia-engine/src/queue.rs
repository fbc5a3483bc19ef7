// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-workflow bounded dispatch queue (§5 backpressure).
//!
//! A plain `tokio::sync::mpsc` channel can reject or block on overflow,
//! but not evict the oldest pending item — and §5 requires drop-oldest.
//! This is a small `VecDeque` behind a mutex with a `Notify` for wakeups,
//! closable so a reload/shutdown can drain it to `None` instead of
//! blocking forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Outcome of pushing an item onto a [`BoundedQueue`].
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued with room to spare.
    Enqueued,
    /// Enqueued, but the oldest pending item was dropped to make room.
    EnqueuedDroppingOldest,
    /// The queue is closed; the item was not enqueued.
    Closed,
}

/// A bounded, closable, drop-oldest-on-overflow FIFO queue.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Push an item, dropping the oldest pending one if at capacity.
    pub fn push(&self, item: T) -> PushOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return PushOutcome::Closed;
        }
        let mut guard = self.items.lock().unwrap();
        let outcome = if guard.len() >= self.capacity {
            guard.pop_front();
            PushOutcome::EnqueuedDroppingOldest
        } else {
            PushOutcome::Enqueued
        };
        guard.push_back(item);
        drop(guard);
        self.notify.notify_one();
        outcome
    }

    /// Pop the next item in FIFO order, waiting if the queue is empty.
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut guard = self.items.lock().unwrap();
                if let Some(item) = guard.pop_front() {
                    return Some(item);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting new items and wake any pending `pop` so it can
    /// observe closure once the backlog is drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Number of items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// `true` if no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
