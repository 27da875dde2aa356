//! Bounded blocking queue used for request and fragment handoff between
//! loop threads.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    active: bool,
}

/// MPMC bounded queue with blocking push/pop and a deactivation switch
/// that wakes and drains every waiter during teardown.
pub struct BlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BlockingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                active: true,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueues `item`, blocking while the queue is full.
    ///
    /// `timeout` of `None` blocks indefinitely; `Some(d)` gives up after
    /// `d`. Returns `false` when the item was not enqueued (timeout or
    /// deactivated queue).
    pub fn push(&self, item: T, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut guard = self.inner.lock();
        while guard.active && guard.items.len() == guard.capacity {
            match deadline {
                Some(deadline) => {
                    if self.not_full.wait_until(&mut guard, deadline).timed_out() {
                        return false;
                    }
                }
                None => self.not_full.wait(&mut guard),
            }
        }
        if !guard.active {
            return false;
        }
        guard.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Dequeues the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` on timeout or when the queue is deactivated.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut guard = self.inner.lock();
        while guard.active && guard.items.is_empty() {
            match deadline {
                Some(deadline) => {
                    if self.not_empty.wait_until(&mut guard, deadline).timed_out() {
                        return None;
                    }
                }
                None => self.not_empty.wait(&mut guard),
            }
        }
        let item = guard.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Dequeues without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let mut guard = self.inner.lock();
        let item = guard.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Blocks until the queue holds at least one item, without popping.
    /// Returns `false` on timeout or deactivation.
    pub fn wait_nonempty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock();
        while guard.active && guard.items.is_empty() {
            if self.not_empty.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        guard.active && !guard.items.is_empty()
    }

    /// Drops all queued items and wakes every blocked producer and
    /// consumer; subsequent pushes and pops fail fast.
    pub fn deactivate(&self) {
        let mut guard = self.inner.lock();
        guard.active = false;
        guard.items.clear();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
