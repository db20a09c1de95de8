//! Subscription state and the application-facing handle.

use crate::error::{ClientError, Result};
use crate::queue::{BoundedQueue, DequeueError};
use crate::types::{Message, SubscriptionId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::manager::SubscriptionManager;

/// Callback invoked for each message of an asynchronous subscription.
pub type MessageHandler = Box<dyn FnMut(Message) + Send>;

/// Why a subscription stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// Delivered its auto-unsubscribe quota.
    MaxMessages,
    /// The owning connection was closed.
    ConnectionClosed,
}

/// Lifecycle state of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Closed(CloseReason),
}

/// Result of offering an inbound message to a subscription.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Acceptance {
    Queued,
    /// Closed, or the auto-unsubscribe quota is already queued.
    Discarded,
    /// Queue full. `first` is set for the first drop of an overflow episode.
    Overflow { first: bool },
}

/// Outcome of accounting one hand-off to the consumer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Deliver { last: bool },
    Stop,
}

/// Counters and state guarded together.
#[derive(Debug)]
struct Counters {
    state: SubscriptionState,
    delivered: u64,
    /// Messages accepted into the queue over the subscription's life.
    received: u64,
    dropped: u64,
    /// Auto-unsubscribe threshold, 0 = unlimited.
    max: u64,
    /// Inside an overflow episode.
    slow: bool,
    /// Overflow not yet reported to a synchronous puller.
    slow_unreported: bool,
    /// `MaxMessagesReached` already returned to a puller.
    max_reported: bool,
}

/// State shared between the registry, the dispatcher and every handle.
pub(crate) struct SubscriptionShared {
    pub id: SubscriptionId,
    pub subject: String,
    pub queue_group: Option<String>,
    pub is_async: bool,
    pub queue: BoundedQueue,
    counters: Mutex<Counters>,
}

impl SubscriptionShared {
    pub fn new(
        id: SubscriptionId,
        subject: String,
        queue_group: Option<String>,
        is_async: bool,
        max_pending_msgs: usize,
        max_pending_bytes: usize,
    ) -> Self {
        Self {
            id,
            subject,
            queue_group,
            is_async,
            queue: BoundedQueue::new(max_pending_msgs, max_pending_bytes),
            counters: Mutex::new(Counters {
                state: SubscriptionState::Active,
                delivered: 0,
                received: 0,
                dropped: 0,
                max: 0,
                slow: false,
                slow_unreported: false,
                max_reported: false,
            }),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.counters.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// Offer an inbound message.
    pub fn accept(&self, message: Message) -> Acceptance {
        let mut c = self.counters.lock();
        if c.state != SubscriptionState::Active || (c.max > 0 && c.received >= c.max) {
            return Acceptance::Discarded;
        }
        if self.queue.enqueue(message) {
            c.received += 1;
            c.slow = false;
            Acceptance::Queued
        } else {
            c.dropped += 1;
            c.slow_unreported = true;
            let first = !c.slow;
            c.slow = true;
            Acceptance::Overflow { first }
        }
    }

    /// Account one hand-off. Moves to `Closed(MaxMessages)` when the quota is met.
    pub fn begin_delivery(&self) -> Delivery {
        let mut c = self.counters.lock();
        if c.state != SubscriptionState::Active {
            return Delivery::Stop;
        }
        c.delivered += 1;
        let last = c.max > 0 && c.delivered >= c.max;
        if last {
            c.state = SubscriptionState::Closed(CloseReason::MaxMessages);
        }
        Delivery::Deliver { last }
    }

    /// Set the auto-unsubscribe threshold. Returns true when the quota is
    /// already met and the subscription closed on the spot.
    pub fn set_max(&self, max: u64) -> Result<bool> {
        let mut c = self.counters.lock();
        if c.state != SubscriptionState::Active {
            return Err(ClientError::BadSubscription);
        }
        c.max = max;
        if c.delivered >= max {
            c.state = SubscriptionState::Closed(CloseReason::MaxMessages);
            return Ok(true);
        }
        Ok(false)
    }

    /// Transition to closed and drop the queue contents. Returns false if the
    /// subscription was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut c = self.counters.lock();
        let transitioned = c.state == SubscriptionState::Active;
        if transitioned {
            c.state = SubscriptionState::Closed(reason);
        }
        self.queue.drain_and_close();
        transitioned
    }

    /// What the server should be told after a reconnect: `None` if nothing
    /// remains to receive, otherwise the remaining quota (0 = unlimited).
    pub fn remaining_quota(&self) -> Option<u64> {
        let c = self.counters.lock();
        if c.state != SubscriptionState::Active {
            return None;
        }
        if c.max == 0 {
            return Some(0);
        }
        if c.received >= c.max {
            None
        } else {
            Some(c.max - c.received)
        }
    }

    /// Error to report to a synchronous puller before waiting, if any.
    fn pull_precondition(&self) -> Result<()> {
        let mut c = self.counters.lock();
        if let SubscriptionState::Closed(reason) = c.state {
            return Err(Self::closed_error(&mut c, reason));
        }
        if c.slow_unreported {
            c.slow_unreported = false;
            return Err(ClientError::SlowConsumer);
        }
        Ok(())
    }

    fn pull_closed_error(&self) -> ClientError {
        let mut c = self.counters.lock();
        match c.state {
            SubscriptionState::Closed(reason) => Self::closed_error(&mut c, reason),
            SubscriptionState::Active => ClientError::BadSubscription,
        }
    }

    fn closed_error(c: &mut Counters, reason: CloseReason) -> ClientError {
        match reason {
            CloseReason::Unsubscribed => ClientError::BadSubscription,
            CloseReason::ConnectionClosed => ClientError::ConnectionClosed,
            CloseReason::MaxMessages if !c.max_reported => {
                c.max_reported = true;
                ClientError::MaxMessagesReached
            }
            CloseReason::MaxMessages => ClientError::BadSubscription,
        }
    }
}

/// Handle to a subscription. Cheap to clone; every clone refers to the same
/// subscription.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) shared: Arc<SubscriptionShared>,
    pub(crate) manager: Weak<SubscriptionManager>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    pub fn subject(&self) -> &str {
        &self.shared.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.shared.queue_group.as_deref()
    }

    /// True when messages are delivered to a handler rather than pulled.
    pub fn is_async(&self) -> bool {
        self.shared.is_async
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    /// Registered, not unsubscribed, and below its auto-unsubscribe quota.
    pub fn is_valid(&self) -> bool {
        self.shared.is_active()
    }

    /// Messages handed to the consumer so far.
    pub fn delivered(&self) -> u64 {
        self.shared.counters.lock().delivered
    }

    /// Messages discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.counters.lock().dropped
    }

    /// Auto-unsubscribe threshold, 0 when unlimited.
    pub fn max_messages(&self) -> u64 {
        self.shared.counters.lock().max
    }

    /// Queued but undelivered `(messages, bytes)`.
    pub fn pending(&self) -> (usize, usize) {
        self.shared.queue.pending()
    }

    /// Current `(max_msgs, max_bytes)`.
    pub fn pending_limits(&self) -> (usize, usize) {
        self.shared.queue.limits()
    }

    /// Change the queue limits. Takes effect for the next inbound message.
    pub fn set_pending_limits(&self, max_msgs: usize, max_bytes: usize) -> Result<()> {
        if max_msgs == 0 || max_bytes == 0 {
            return Err(ClientError::InvalidArgument(
                "pending limits must be greater than zero".to_string(),
            ));
        }
        if !self.is_valid() {
            return Err(ClientError::BadSubscription);
        }
        self.shared.queue.set_limits(max_msgs, max_bytes);
        Ok(())
    }

    /// Stop after `max` messages in total have been delivered.
    pub fn auto_unsubscribe(&self, max: u64) -> Result<()> {
        let manager = self.manager.upgrade().ok_or(ClientError::BadSubscription)?;
        manager.auto_unsubscribe(&self.shared, max)
    }

    /// Remove the subscription and discard anything still queued.
    pub fn unsubscribe(&self) -> Result<()> {
        match self.manager.upgrade() {
            Some(manager) => manager.unsubscribe(&self.shared),
            None => Err(ClientError::BadSubscription),
        }
    }

    /// Pull the next message, waiting up to `timeout`.
    ///
    /// Only valid on synchronous subscriptions. A closed subscription fails
    /// immediately; one closed while the caller waits releases it at once.
    pub fn next_message(&self, timeout: Duration) -> Result<Message> {
        if self.shared.is_async {
            return Err(ClientError::AsyncSubscription);
        }
        self.shared.pull_precondition()?;

        let message = match self.shared.queue.dequeue(Some(timeout)) {
            Ok(message) => message,
            Err(DequeueError::Timeout) => return Err(ClientError::Timeout),
            Err(DequeueError::Closed) => return Err(self.shared.pull_closed_error()),
        };

        match self.shared.begin_delivery() {
            Delivery::Deliver { last } => {
                if last {
                    self.expire();
                }
                Ok(message)
            }
            Delivery::Stop => Err(self.shared.pull_closed_error()),
        }
    }

    /// Clean up after the quota was met.
    pub(crate) fn expire(&self) {
        match self.manager.upgrade() {
            Some(manager) => manager.expire(&self.shared),
            None => {
                self.shared.queue.drain_and_close();
            }
        }
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Subscription {}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("subject", &self.shared.subject)
            .field("queue_group", &self.shared.queue_group)
            .field("is_async", &self.shared.is_async)
            .field("state", &self.state())
            .finish()
    }
}
