//! Subscription registry and inbound router.

use crate::dispatch::{self, DispatchStats};
use crate::error::{ClientError, Result};
use crate::events::EventSurface;
use crate::transport::{Outbound, Transport};
use crate::types::{validate_subject, ConnectionStatus, Message, SubscriptionId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::types::{Acceptance, CloseReason, MessageHandler, Subscription, SubscriptionShared};

/// Connection-owned registry of subscriptions.
///
/// The registry lock is only held to look up, insert or remove entries. Each
/// subscription guards its own counters, so routing to one subscription
/// never waits on another.
pub struct SubscriptionManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<SubscriptionShared>>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    outbound: Arc<Outbound>,
    events: Arc<EventSurface>,
    dispatch_stats: Arc<DispatchStats>,
    /// Prefix for dispatcher thread names.
    name: String,
    default_max_msgs: usize,
    default_max_bytes: usize,
}

impl SubscriptionManager {
    pub(crate) fn new(
        name: String,
        outbound: Arc<Outbound>,
        events: Arc<EventSurface>,
        default_max_msgs: usize,
        default_max_bytes: usize,
    ) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            outbound,
            events,
            dispatch_stats: Arc::new(DispatchStats::default()),
            name,
            default_max_msgs,
            default_max_bytes,
        }
    }

    /// Register a subscription and tell the server about it.
    ///
    /// With a handler, delivery is asynchronous on a dedicated thread;
    /// without one the subscription is pulled with
    /// [`Subscription::next_message`].
    pub fn subscribe(
        self: &Arc<Self>,
        subject: &str,
        queue_group: Option<&str>,
        handler: Option<MessageHandler>,
    ) -> Result<Subscription> {
        validate_subject(subject)?;
        if let Some(group) = queue_group {
            if group.is_empty() || group.chars().any(char::is_whitespace) {
                return Err(ClientError::InvalidArgument(format!(
                    "invalid queue group: {:?}",
                    group
                )));
            }
        }
        if self.outbound.status() == ConnectionStatus::Closed {
            return Err(ClientError::ConnectionClosed);
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let shared = Arc::new(SubscriptionShared::new(
            id,
            subject.to_string(),
            queue_group.map(str::to_string),
            handler.is_some(),
            self.default_max_msgs,
            self.default_max_bytes,
        ));
        let subscription = self.handle(&shared);

        if let Some(handler) = handler {
            let spawned = dispatch::spawn(
                &self.name,
                subscription.clone(),
                handler,
                Arc::clone(&self.events),
                Arc::clone(&self.dispatch_stats),
            );
            if let Err(e) = spawned {
                shared.close(CloseReason::Unsubscribed);
                return Err(ClientError::Thread(e.to_string()));
            }
        }

        // Insert and send under one status hold: a concurrent reconnect
        // either replays this entry or sees the frame go out, never both.
        let sent = self.outbound.with_session(|transport| {
            self.subscriptions.write().insert(id, Arc::clone(&shared));
            match transport {
                Some(transport) => transport.send_subscribe(subject, queue_group, id),
                None => Ok(()),
            }
        });
        if let Err(e) = sent {
            self.discard(&shared, CloseReason::Unsubscribed);
            return Err(e);
        }

        debug!(sid = id.0, subject, queue_group = ?queue_group, "subscribed");
        Ok(subscription)
    }

    /// Deliver an inbound message to its subscription's queue.
    ///
    /// Unknown or closed subscriptions swallow the message. Overflow is
    /// reported once per episode through the error handler; it never fails
    /// the caller.
    pub fn route(self: &Arc<Self>, message: Message) {
        let sid = message.sid;
        let shared = match self.subscriptions.read().get(&sid) {
            Some(shared) => Arc::clone(shared),
            None => {
                trace!(sid = sid.0, "message for unknown subscription");
                return;
            }
        };

        match shared.accept(message) {
            Acceptance::Queued | Acceptance::Discarded => {}
            Acceptance::Overflow { first } => {
                if first {
                    warn!(sid = sid.0, subject = %shared.subject, "slow consumer, dropping messages");
                    self.events
                        .emit_error(Some(self.handle(&shared)), ClientError::SlowConsumer);
                }
            }
        }
    }

    pub(crate) fn unsubscribe(&self, shared: &Arc<SubscriptionShared>) -> Result<()> {
        if !self.discard(shared, CloseReason::Unsubscribed) {
            return Err(ClientError::BadSubscription);
        }
        debug!(sid = shared.id.0, subject = %shared.subject, "unsubscribed");
        self.outbound
            .control(|t| t.send_unsubscribe(shared.id, None))
    }

    pub(crate) fn auto_unsubscribe(&self, shared: &Arc<SubscriptionShared>, max: u64) -> Result<()> {
        if max == 0 {
            return Err(ClientError::InvalidArgument(
                "auto-unsubscribe threshold must be greater than zero".to_string(),
            ));
        }
        if shared.set_max(max)? {
            self.expire(shared);
            return Ok(());
        }
        self.outbound
            .control(|t| t.send_unsubscribe(shared.id, Some(max)))
    }

    /// Remove a subscription that met its auto-unsubscribe quota.
    pub(crate) fn expire(&self, shared: &Arc<SubscriptionShared>) {
        self.subscriptions.write().remove(&shared.id);
        shared.queue.drain_and_close();
        debug!(sid = shared.id.0, subject = %shared.subject, "auto-unsubscribe quota reached");
        if let Err(e) = self
            .outbound
            .control(|t| t.send_unsubscribe(shared.id, None))
        {
            trace!(sid = shared.id.0, error = %e, "unsubscribe after quota not sent");
        }
    }

    /// Remove and drain every subscription. Used when the connection closes.
    pub(crate) fn close_all(&self) {
        let drained: Vec<_> = self.subscriptions.write().drain().collect();
        for (_, shared) in &drained {
            shared.close(CloseReason::ConnectionClosed);
        }
        debug!(count = drained.len(), "closed all subscriptions");
    }

    /// Re-register every still-valid subscription on a fresh transport
    /// session, carrying over what is left of each auto-unsubscribe quota.
    pub(crate) fn replay(&self, transport: &dyn Transport) -> Result<usize> {
        let snapshot: Vec<_> = self.subscriptions.read().values().cloned().collect();
        let mut replayed = 0;
        for shared in snapshot {
            let remaining = match shared.remaining_quota() {
                Some(remaining) => remaining,
                None => continue,
            };
            transport.send_subscribe(&shared.subject, shared.queue_group.as_deref(), shared.id)?;
            if remaining > 0 {
                transport.send_unsubscribe(shared.id, Some(remaining))?;
            }
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Look up a registered subscription.
    pub fn get(self: &Arc<Self>, id: SubscriptionId) -> Option<Subscription> {
        let shared = self.subscriptions.read().get(&id).cloned()?;
        Some(self.handle(&shared))
    }

    /// Get subscription count.
    pub fn count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub(crate) fn dispatch_stats(&self) -> &DispatchStats {
        &self.dispatch_stats
    }

    fn handle(self: &Arc<Self>, shared: &Arc<SubscriptionShared>) -> Subscription {
        Subscription {
            shared: Arc::clone(shared),
            manager: Arc::downgrade(self),
        }
    }

    /// Remove from the registry and close. Returns false if already closed.
    fn discard(&self, shared: &Arc<SubscriptionShared>, reason: CloseReason) -> bool {
        self.subscriptions.write().remove(&shared.id);
        shared.close(reason)
    }
}
