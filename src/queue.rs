//! Bounded per-subscription message queue.
//!
//! A FIFO guarded by a mutex and condition variable with two limits: a
//! maximum message count and a maximum cumulative payload size. Producers
//! never block; an enqueue that would exceed either limit is rejected and the
//! caller decides how to surface the overflow. Consumers may block with an
//! optional timeout and are woken immediately when the queue is closed.

use crate::types::Message;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Why a dequeue returned without a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DequeueError {
    /// The deadline elapsed with the queue still empty.
    Timeout,
    /// The queue was drained and closed.
    Closed,
}

struct QueueState {
    items: VecDeque<Message>,
    /// Sum of payload sizes currently queued.
    bytes: usize,
    max_msgs: usize,
    max_bytes: usize,
    closed: bool,
}

impl QueueState {
    fn pop(&mut self) -> Option<Message> {
        let message = self.items.pop_front()?;
        self.bytes -= message.size();
        Some(message)
    }
}

/// Thread-safe FIFO with a dual count/byte limit.
pub struct BoundedQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl BoundedQueue {
    /// Create an empty queue with the given limits.
    pub fn new(max_msgs: usize, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                bytes: 0,
                max_msgs,
                max_bytes,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a message if both limits stay satisfied and the queue is open.
    ///
    /// Returns false without blocking otherwise.
    pub fn enqueue(&self, message: Message) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        let size = message.size();
        if state.items.len() + 1 > state.max_msgs || state.bytes + size > state.max_bytes {
            return false;
        }
        state.bytes += size;
        state.items.push_back(message);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Remove the oldest message, waiting up to `timeout` (forever if `None`).
    pub fn dequeue(&self, timeout: Option<Duration>) -> Result<Message, DequeueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(DequeueError::Closed);
            }
            if let Some(message) = state.pop() {
                return Ok(message);
            }
            match deadline {
                None => self.available.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(DequeueError::Timeout);
                    }
                    self.available.wait_until(&mut state, deadline);
                }
            }
        }
    }

    /// Remove the oldest message without waiting.
    pub fn try_dequeue(&self) -> Option<Message> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.pop()
    }

    /// Discard everything queued and close. Every blocked consumer wakes with
    /// [`DequeueError::Closed`]. Returns the number of discarded messages.
    pub fn drain_and_close(&self) -> usize {
        let mut state = self.state.lock();
        let discarded = state.items.len();
        state.items.clear();
        state.bytes = 0;
        state.closed = true;
        drop(state);
        self.available.notify_all();
        discarded
    }

    /// Replace both limits. Messages already queued are kept even if they now
    /// exceed the new limits.
    pub fn set_limits(&self, max_msgs: usize, max_bytes: usize) {
        let mut state = self.state.lock();
        state.max_msgs = max_msgs;
        state.max_bytes = max_bytes;
    }

    /// Current `(max_msgs, max_bytes)`.
    pub fn limits(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.max_msgs, state.max_bytes)
    }

    /// Currently queued `(messages, bytes)`.
    pub fn pending(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.items.len(), state.bytes)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
