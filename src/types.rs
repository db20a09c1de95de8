//! Core types shared across the client engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a subscription, unique per connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received from (or published to) the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Subscription the server routed this message to.
    pub sid: SubscriptionId,
    pub subject: String,
    /// Subject the sender expects a reply on, if any.
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(sid: SubscriptionId, subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sid,
            subject: subject.into(),
            reply_to: None,
            payload: payload.into(),
        }
    }

    pub fn with_reply(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Size used for pending-bytes accounting.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Connection lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
}

/// Snapshot of connection statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub in_msgs: u64,
    pub in_bytes: u64,
    pub out_msgs: u64,
    pub out_bytes: u64,
    pub reconnects: u64,
    /// Dispatcher threads started over the connection's life.
    pub threads_created: u64,
    /// Dispatcher threads currently running.
    pub threads_alive: u64,
    /// Publish payload bytes held back while disconnected.
    pub buffered_bytes: u64,
}

/// Live counters owned by a connection.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub in_msgs: AtomicU64,
    pub in_bytes: AtomicU64,
    pub out_msgs: AtomicU64,
    pub out_bytes: AtomicU64,
    pub reconnects: AtomicU64,
}

impl StatsCounters {
    pub fn record_in(&self, bytes: usize) {
        self.in_msgs.fetch_add(1, Ordering::Relaxed);
        self.in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.out_msgs.fetch_add(1, Ordering::Relaxed);
        self.out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Statistics {
        Statistics {
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            threads_created: 0,
            threads_alive: 0,
            buffered_bytes: 0,
        }
    }
}

/// Checks that a subject is usable for publish or subscribe.
pub(crate) fn validate_subject(subject: &str) -> crate::Result<()> {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(crate::ClientError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}
