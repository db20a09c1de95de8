//! Connection: the engine tying subscriptions, delivery and reconnection
//! together on top of a transport.

use crate::error::{ClientError, Result};
use crate::events::EventSurface;
use crate::reconnect::{LossOutcome, ReconnectCoordinator};
use crate::subscriptions::{MessageHandler, Subscription, SubscriptionManager};
use crate::transport::{Outbound, ProtocolEvent, Transport};
use crate::types::{validate_subject, ConnectionStatus, Message, Statistics, StatsCounters};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Prefix of generated inbox subjects.
pub const INBOX_PREFIX: &str = "_INBOX.";

/// Connection configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Name used for thread names and logs.
    pub name: String,

    /// Default queue message limit for new subscriptions.
    /// Default: 65536
    pub max_pending_msgs: usize,

    /// Default queue byte limit for new subscriptions.
    /// Default: 64MB
    pub max_pending_bytes: usize,

    /// Keep subscriptions across transport loss. When false, losing the
    /// transport closes the connection.
    pub allow_reconnect: bool,

    /// Bytes of publishes buffered while disconnected. 0 rejects publishes
    /// with `NotConnected` instead.
    /// Default: 8MB
    pub reconnect_buffer_size: usize,

    /// Timeout used by [`Connection::flush_default`], in milliseconds.
    pub flush_timeout_ms: u64,

    /// Timeout used by [`Connection::request_default`], in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            max_pending_msgs: 65_536,
            max_pending_bytes: 65_536 * 1024,
            allow_reconnect: true,
            reconnect_buffer_size: 8 * 1024 * 1024,
            flush_timeout_ms: 60_000,
            request_timeout_ms: 2_000,
        }
    }
}

impl ConnectionConfig {
    /// Parse a configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_pending_msgs == 0 || self.max_pending_bytes == 0 {
            return Err(ClientError::InvalidArgument(
                "pending limits must be greater than zero".to_string(),
            ));
        }
        if self.name.is_empty() {
            return Err(ClientError::InvalidArgument("name must not be empty".to_string()));
        }
        Ok(())
    }
}

/// State shared with the inbound thread.
struct Core {
    outbound: Arc<Outbound>,
    manager: Arc<SubscriptionManager>,
    events: Arc<EventSurface>,
    stats: Arc<StatsCounters>,
    reconnect: ReconnectCoordinator,
    /// Flush waiters, answered in order by pongs.
    pongs: Mutex<VecDeque<Sender<Result<()>>>>,
    closed: AtomicBool,
}

impl Core {
    fn handle(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Message(message) => {
                self.stats.record_in(message.size());
                self.manager.route(message);
            }
            ProtocolEvent::Pong => {
                if let Some(waiter) = self.pongs.lock().pop_front() {
                    let _ = waiter.try_send(Ok(()));
                }
            }
            ProtocolEvent::ConnectionLost => match self.reconnect.connection_lost() {
                LossOutcome::Suspended => self.fail_flushes(ClientError::NotConnected),
                LossOutcome::Close => {
                    info!("connection lost and reconnect disabled");
                    self.close();
                }
                LossOutcome::Ignored => {}
            },
            ProtocolEvent::ConnectionRestored => {
                if let Err(e) = self.reconnect.connection_restored() {
                    self.events.emit_error(None, e);
                }
            }
            ProtocolEvent::TransportError(cause) => {
                warn!(cause = %cause, "transport error");
                self.events.emit_error(None, ClientError::Transport(cause));
            }
        }
    }

    fn fail_flushes(&self, error: ClientError) {
        for waiter in self.pongs.lock().drain(..) {
            let _ = waiter.try_send(Err(error.clone()));
        }
    }

    /// Idempotent shutdown of everything except the inbound thread itself.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound.set_status(ConnectionStatus::Closed);
        self.manager.close_all();
        self.fail_flushes(ClientError::ConnectionClosed);
        self.events.emit_closed();
        self.events.shutdown();
        info!("connection closed");
    }
}

struct ConnectionInner {
    config: ConnectionConfig,
    core: Arc<Core>,
    shutdown: Sender<()>,
    inbound: Mutex<Option<JoinHandle<()>>>,
    inbound_id: ThreadId,
}

impl ConnectionInner {
    fn close(&self) {
        self.core.close();
        let _ = self.shutdown.try_send(());
        if thread::current().id() == self.inbound_id {
            return;
        }
        if let Some(handle) = self.inbound.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// A client connection. Cheap to clone; all clones share one connection.
///
/// Provides:
/// - Publishing, with buffering while the transport is down
/// - Synchronous and asynchronous subscriptions, optionally in queue groups
/// - Request/reply over ephemeral inbox subscriptions
/// - Flush round trips
/// - Error and lifecycle callbacks
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Start a connection over an established transport session.
    ///
    /// `events` is the transport's inbound feed. When its sender side is
    /// dropped the connection closes.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: Receiver<ProtocolEvent>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        config.validate()?;

        let outbound = Arc::new(Outbound::new(transport, config.reconnect_buffer_size));
        let surface = Arc::new(
            EventSurface::start(&config.name).map_err(|e| ClientError::Thread(e.to_string()))?,
        );
        let stats = Arc::new(StatsCounters::default());
        let manager = Arc::new(SubscriptionManager::new(
            config.name.clone(),
            Arc::clone(&outbound),
            Arc::clone(&surface),
            config.max_pending_msgs,
            config.max_pending_bytes,
        ));
        let reconnect = ReconnectCoordinator::new(
            Arc::clone(&outbound),
            Arc::clone(&manager),
            Arc::clone(&surface),
            Arc::clone(&stats),
            config.allow_reconnect,
        );
        let core = Arc::new(Core {
            outbound,
            manager,
            events: surface,
            stats,
            reconnect,
            pongs: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });

        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let inbound = {
            let core = Arc::clone(&core);
            thread::Builder::new()
                .name(format!("{}-inbound", config.name))
                .spawn(move || run_inbound(core, events, shutdown_rx))
                .map_err(|e| ClientError::Thread(e.to_string()))?
        };
        let inbound_id = inbound.thread().id();

        debug!(name = %config.name, "connection started");
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                config,
                core,
                shutdown,
                inbound: Mutex::new(Some(inbound)),
                inbound_id,
            }),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    // --- Publishing ---

    pub fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        self.publish_inner(subject, None, payload)
    }

    /// Publish with a reply subject for the receiver to answer on.
    pub fn publish_request(&self, subject: &str, reply_to: &str, payload: &[u8]) -> Result<()> {
        validate_subject(reply_to)?;
        self.publish_inner(subject, Some(reply_to), payload)
    }

    fn publish_inner(&self, subject: &str, reply_to: Option<&str>, payload: &[u8]) -> Result<()> {
        validate_subject(subject)?;
        self.inner.core.outbound.publish(subject, reply_to, payload)?;
        self.inner.core.stats.record_out(payload.len());
        Ok(())
    }

    // --- Subscribing ---

    /// Subscribe with a handler, run on a dedicated thread for this
    /// subscription.
    pub fn subscribe<F>(&self, subject: &str, handler: F) -> Result<Subscription>
    where
        F: FnMut(Message) + Send + 'static,
    {
        self.subscribe_inner(subject, None, Some(Box::new(handler)))
    }

    /// Subscribe for pulling with [`Subscription::next_message`].
    pub fn subscribe_sync(&self, subject: &str) -> Result<Subscription> {
        self.subscribe_inner(subject, None, None)
    }

    /// Join queue group `queue_group` on `subject` with a handler.
    pub fn queue_subscribe<F>(&self, subject: &str, queue_group: &str, handler: F) -> Result<Subscription>
    where
        F: FnMut(Message) + Send + 'static,
    {
        self.subscribe_inner(subject, Some(queue_group), Some(Box::new(handler)))
    }

    pub fn queue_subscribe_sync(&self, subject: &str, queue_group: &str) -> Result<Subscription> {
        self.subscribe_inner(subject, Some(queue_group), None)
    }

    fn subscribe_inner(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        handler: Option<MessageHandler>,
    ) -> Result<Subscription> {
        self.inner.core.manager.subscribe(subject, queue_group, handler)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.core.manager.count()
    }

    // --- Request/reply ---

    /// A fresh, unique subject for replies.
    pub fn new_inbox(&self) -> String {
        let suffix: [u8; 12] = rand::random();
        format!("{}{}", INBOX_PREFIX, hex::encode(suffix))
    }

    /// Publish `payload` to `subject` and wait for the first reply.
    pub fn request(&self, subject: &str, payload: &[u8], timeout: Duration) -> Result<Message> {
        let inbox = self.new_inbox();
        let sub = self.subscribe_sync(&inbox)?;
        sub.auto_unsubscribe(1)?;

        let result = self
            .publish_request(subject, &inbox, payload)
            .and_then(|()| sub.next_message(timeout));

        if sub.is_valid() {
            let _ = sub.unsubscribe();
        }
        result
    }

    /// [`request`](Self::request) bounded by the configured `request_timeout_ms`.
    pub fn request_default(&self, subject: &str, payload: &[u8]) -> Result<Message> {
        self.request(subject, payload, self.inner.config.request_timeout())
    }

    // --- Flow control ---

    /// Round-trip to the server. When this returns `Ok`, every message the
    /// server sent before answering has been routed to its subscription.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let core = &self.inner.core;
        let (sender, receiver) = bounded(1);
        {
            let mut pongs = core.pongs.lock();
            core.outbound.ping()?;
            pongs.push_back(sender);
        }

        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::ConnectionClosed),
        }
    }

    /// [`flush`](Self::flush) bounded by the configured `flush_timeout_ms`.
    pub fn flush_default(&self) -> Result<()> {
        self.flush(self.inner.config.flush_timeout())
    }

    /// Block until the transport is back after a loss.
    pub fn wait_for_reconnect(&self, timeout: Duration) -> Result<()> {
        self.inner.core.outbound.wait_connected(timeout)
    }

    // --- Lifecycle ---

    /// Close the connection. Every subscription is drained and closed,
    /// blocked pulls and flushes are released, and no handler runs after a
    /// handler already in progress returns.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.core.outbound.status()
    }

    pub fn is_closed(&self) -> bool {
        self.status() == ConnectionStatus::Closed
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(
            self.status(),
            ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting
        )
    }

    pub fn stats(&self) -> Statistics {
        let core = &self.inner.core;
        let mut stats = core.stats.snapshot();
        let dispatch = core.manager.dispatch_stats();
        stats.threads_created = dispatch.threads_created();
        stats.threads_alive = dispatch.threads_alive();
        stats.buffered_bytes = core.outbound.buffered_bytes() as u64;
        stats
    }

    /// The most recent asynchronous error, if any.
    pub fn last_error(&self) -> Option<ClientError> {
        self.inner.core.events.last_error()
    }

    // --- Event handlers ---

    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(Option<&Subscription>, &ClientError) + Send + Sync + 'static,
    {
        self.inner.core.events.set_error_handler(Some(Arc::new(handler)));
    }

    pub fn clear_error_handler(&self) {
        self.inner.core.events.set_error_handler(None);
    }

    /// Called once per successful reconnect, after subscriptions are restored.
    pub fn set_reconnected_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .core
            .events
            .set_reconnected_handler(Some(Arc::new(handler)));
    }

    pub fn set_disconnected_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .core
            .events
            .set_disconnected_handler(Some(Arc::new(handler)));
    }

    pub fn set_closed_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.core.events.set_closed_handler(Some(Arc::new(handler)));
    }
}

fn run_inbound(core: Arc<Core>, events: Receiver<ProtocolEvent>, shutdown: Receiver<()>) {
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(event) => core.handle(event),
                Err(_) => {
                    debug!("transport feed ended");
                    core.close();
                    break;
                }
            },
            recv(shutdown) -> _ => break,
        }
        if core.closed.load(Ordering::SeqCst) {
            break;
        }
    }
}
