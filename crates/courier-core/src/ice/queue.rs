//! Bounded inbound queue for ICE sessions.
//!
//! Producer is the session's reader task; consumers are any number of
//! threads blocked in [`InboundQueue::recv_timeout`]. When full, a push
//! evicts the oldest entry: this is a lossy buffer, not a backpressure
//! point.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

/// Default capacity of a session's inbound queue
pub const INBOUND_QUEUE_CAPACITY: usize = 16;

struct QueueInner {
    items: VecDeque<Bytes>,
    dropped: u64,
    closed: bool,
}

/// Thread-safe, fixed-capacity, drop-oldest message queue.
pub struct InboundQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl InboundQueue {
    /// Create a queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                dropped: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a message, evicting the oldest one if the queue is full.
    ///
    /// Returns the evicted message, if any. Pushes after [`close`] are
    /// ignored.
    ///
    /// [`close`]: InboundQueue::close
    pub fn push(&self, message: Bytes) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        let evicted = if inner.items.len() >= self.capacity {
            inner.dropped += 1;
            inner.items.pop_front()
        } else {
            None
        };
        inner.items.push_back(message);
        drop(inner);
        self.available.notify_one();
        evicted
    }

    /// Wait for a message.
    ///
    /// - `Some(Duration::ZERO)` polls without blocking
    /// - `Some(t)` blocks for at most `t`
    /// - `None` blocks until a message arrives or the queue is closed
    pub fn recv_timeout(&self, timeout: Option<Duration>) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        match timeout {
            None => loop {
                if let Some(message) = inner.items.pop_front() {
                    return Some(message);
                }
                if inner.closed {
                    return None;
                }
                self.available.wait(&mut inner);
            },
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(message) = inner.items.pop_front() {
                        return Some(message);
                    }
                    if inner.closed {
                        return None;
                    }
                    if self.available.wait_until(&mut inner, deadline).timed_out() {
                        return inner.items.pop_front();
                    }
                }
            }
        }
    }

    /// Wake all waiters and refuse further pushes. Queued messages can
    /// still be drained.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_all();
    }

    /// Drop every queued message.
    pub fn clear(&self) {
        self.inner.lock().items.clear();
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages evicted by overflow so far
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Maximum number of retained messages
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new(INBOUND_QUEUE_CAPACITY)
    }
}
