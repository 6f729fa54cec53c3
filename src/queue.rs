//! Bounded queues connecting pipeline stages
//!
//! Two flavors with distinct contracts:
//!
//! - [`SpscRing`]: lock-free single-producer single-consumer ring for the
//!   video hot path. The producer never blocks; `try_push` reports full and
//!   the producer decides the drop policy.
//! - [`BoundedQueue`]: mutex + condvar MPSC queue for the audio and
//!   reassembled-frame paths. Overflow evicts the oldest item so producers
//!   never block; `close()` wakes all waiting consumers.

use crossbeam::queue::ArrayQueue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Lock-free SPSC ring with a fixed power-of-two capacity.
///
/// Publish/consume ordering is release/acquire: whenever the consumer
/// observes an element, the element is fully constructed.
pub struct SpscRing<T> {
    queue: ArrayQueue<T>,
    overflow_count: AtomicUsize,
}

impl<T> SpscRing<T> {
    /// Create a ring with the given capacity.
    ///
    /// # Panics
    /// Panics if `capacity` is not a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "Capacity must be power of 2");
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Push an item. Returns false (and counts the overflow) when full.
    pub fn try_push(&self, item: T) -> bool {
        match self.queue.push(item) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop an item. Returns None when empty.
    pub fn try_pop(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Number of rejected pushes since creation.
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Blocking MPSC queue with drop-oldest overflow and a close signal.
///
/// Multiple producers may `push` concurrently; a single consumer drains via
/// `try_pop` or `wait_pop`. At capacity the oldest item is evicted under the
/// lock, so the consumer never observes a gap without a corresponding
/// eviction. A closed queue accepts no new items; `wait_pop` keeps returning
/// queued items after close until the queue is drained, then returns None.
pub struct BoundedQueue<T> {
    inner: Mutex<QueueInner<T>>,
    not_empty: Condvar,
    capacity: usize,
    dropped_count: AtomicUsize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Capacity must be > 0");
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            capacity,
            dropped_count: AtomicUsize::new(0),
        }
    }

    /// Enqueue an item, evicting the oldest one when at capacity.
    ///
    /// Returns false if the queue is closed.
    pub fn push(&self, item: T) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return false;
            }
            if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                self.dropped_count.fetch_add(1, Ordering::Relaxed);
            }
            inner.items.push_back(item);
        }
        self.not_empty.notify_one();
        true
    }

    /// Dequeue without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    /// Block until an item arrives, the queue closes, or the timeout elapses.
    pub fn wait_pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _result) = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }

    /// Close the queue, waking all waiters. Queued items remain poppable.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
        }
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items evicted by drop-oldest since creation.
    pub fn dropped_count(&self) -> usize {
        self.dropped_count.load(Ordering::Relaxed)
    }
}
