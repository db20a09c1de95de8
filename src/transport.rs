//! The seam between the engine and the wire-level transport.
//!
//! The transport owns framing, sockets and retry policy. It hands the engine
//! an implementation of [`Transport`] for outbound frames and a channel of
//! [`ProtocolEvent`]s for everything coming back.

use crate::error::{ClientError, Result};
use crate::types::{ConnectionStatus, Message, SubscriptionId};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outbound protocol operations.
pub trait Transport: Send + Sync {
    /// Register interest in `subject` under `sid`.
    fn send_subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        sid: SubscriptionId,
    ) -> Result<()>;

    /// Remove `sid`, immediately or after `max` more messages.
    fn send_unsubscribe(&self, sid: SubscriptionId, max: Option<u64>) -> Result<()>;

    fn send_publish(&self, subject: &str, reply_to: Option<&str>, payload: &[u8]) -> Result<()>;

    /// Ask the server for a [`ProtocolEvent::Pong`].
    fn send_ping(&self) -> Result<()>;
}

/// Inbound events fed to the engine.
#[derive(Clone, Debug)]
pub enum ProtocolEvent {
    Message(Message),
    /// Reply to a ping. Pongs arrive in the order pings were sent.
    Pong,
    ConnectionLost,
    ConnectionRestored,
    TransportError(String),
}

/// A publish held back while the transport is unavailable.
struct BufferedPublish {
    subject: String,
    reply_to: Option<String>,
    payload: Vec<u8>,
}

struct OutboundState {
    status: ConnectionStatus,
    buffered: Vec<BufferedPublish>,
    buffered_bytes: usize,
}

/// Status-aware wrapper around the transport.
///
/// Every outbound frame goes through here so that frames issued while the
/// connection is down are buffered or rejected instead of lost.
pub(crate) struct Outbound {
    transport: Arc<dyn Transport>,
    state: Mutex<OutboundState>,
    status_changed: Condvar,
    /// Max bytes of publishes buffered while disconnected; 0 disables buffering.
    buffer_limit: usize,
}

impl Outbound {
    pub fn new(transport: Arc<dyn Transport>, buffer_limit: usize) -> Self {
        Self {
            transport,
            state: Mutex::new(OutboundState {
                status: ConnectionStatus::Connected,
                buffered: Vec::new(),
                buffered_bytes: 0,
            }),
            status_changed: Condvar::new(),
            buffer_limit,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// Move to `status` unless already closed. Returns the previous status.
    pub fn set_status(&self, status: ConnectionStatus) -> ConnectionStatus {
        let mut state = self.state.lock();
        let previous = state.status;
        if previous != ConnectionStatus::Closed {
            state.status = status;
        }
        if status == ConnectionStatus::Closed {
            state.buffered.clear();
            state.buffered_bytes = 0;
        }
        drop(state);
        self.status_changed.notify_all();
        previous
    }

    pub fn publish(&self, subject: &str, reply_to: Option<&str>, payload: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        match state.status {
            ConnectionStatus::Closed => Err(ClientError::ConnectionClosed),
            ConnectionStatus::Connected => self.transport.send_publish(subject, reply_to, payload),
            ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting => {
                if self.buffer_limit == 0 {
                    return Err(ClientError::NotConnected);
                }
                if state.buffered_bytes + payload.len() > self.buffer_limit {
                    return Err(ClientError::ReconnectBufferExceeded);
                }
                state.buffered_bytes += payload.len();
                state.buffered.push(BufferedPublish {
                    subject: subject.to_string(),
                    reply_to: reply_to.map(str::to_string),
                    payload: payload.to_vec(),
                });
                Ok(())
            }
        }
    }

    /// Send a subscription control frame. While disconnected the frame is
    /// skipped; the registry is replayed on reconnect instead.
    pub fn control<F>(&self, send: F) -> Result<()>
    where
        F: FnOnce(&dyn Transport) -> Result<()>,
    {
        self.with_session(|transport| match transport {
            Some(transport) => send(transport),
            None => Ok(()),
        })
    }

    /// Run `f` with the status held still: `Some(transport)` when connected,
    /// `None` while disconnected. A reconnect replay cannot interleave, so
    /// registry changes made inside `f` are sent exactly once.
    pub fn with_session<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(Option<&dyn Transport>) -> Result<()>,
    {
        let state = self.state.lock();
        match state.status {
            ConnectionStatus::Closed => Err(ClientError::ConnectionClosed),
            ConnectionStatus::Connected => f(Some(self.transport.as_ref())),
            ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting => f(None),
        }
    }

    pub fn ping(&self) -> Result<()> {
        let state = self.state.lock();
        match state.status {
            ConnectionStatus::Closed => Err(ClientError::ConnectionClosed),
            ConnectionStatus::Connected => self.transport.send_ping(),
            ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting => {
                Err(ClientError::NotConnected)
            }
        }
    }

    /// Run `replay` against the fresh transport session, then flush buffered
    /// publishes and move to `Connected`.
    ///
    /// The state lock is held throughout so no frame can overtake the replay.
    pub fn reconnect<F>(&self, replay: F) -> Result<()>
    where
        F: FnOnce(&dyn Transport) -> Result<()>,
    {
        let mut state = self.state.lock();
        if state.status == ConnectionStatus::Closed {
            return Err(ClientError::ConnectionClosed);
        }
        state.status = ConnectionStatus::Reconnecting;

        let mut result = replay(self.transport.as_ref());
        if result.is_ok() {
            let buffered = std::mem::take(&mut state.buffered);
            let mut pending = buffered.into_iter();
            for publish in pending.by_ref() {
                if let Err(e) = self.transport.send_publish(
                    &publish.subject,
                    publish.reply_to.as_deref(),
                    &publish.payload,
                ) {
                    // keep the failed frame and everything after it for the next attempt
                    state.buffered.push(publish);
                    result = Err(e);
                    break;
                }
            }
            state.buffered.extend(pending);
        }

        state.buffered_bytes = state.buffered.iter().map(|p| p.payload.len()).sum();
        state.status = match result {
            Ok(()) => ConnectionStatus::Connected,
            Err(_) => ConnectionStatus::Disconnected,
        };
        drop(state);
        self.status_changed.notify_all();
        result
    }

    /// Block until connected, closed, or the timeout elapses.
    pub fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match state.status {
                ConnectionStatus::Connected => return Ok(()),
                ConnectionStatus::Closed => return Err(ClientError::ConnectionClosed),
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            self.status_changed.wait_until(&mut state, deadline);
        }
    }

    /// Bytes of publishes currently held back.
    pub fn buffered_bytes(&self) -> usize {
        self.state.lock().buffered_bytes
    }
}
