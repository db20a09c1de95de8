//! In-memory server and transport.
//!
//! [`LoopbackServer`] plays the remote side of the protocol inside the
//! process: it keeps per-client interest, matches published subjects
//! (including `*` and `>` wildcards), picks one member per queue group, and
//! honours server-side auto-unsubscribe counts. It can be shut down and
//! started again to exercise connection loss and reconnection.
//!
//! # Example
//!
//! ```ignore
//! let server = LoopbackServer::new();
//! let conn = server.connect(ConnectionConfig::default())?;
//! let sub = conn.subscribe_sync("greetings")?;
//! conn.publish("greetings", b"hello")?;
//! let msg = sub.next_message(Duration::from_secs(1))?;
//! ```

use crate::connection::{Connection, ConnectionConfig};
use crate::error::Result;
use crate::transport::{ProtocolEvent, Transport};
use crate::types::{Message, SubscriptionId};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Server-side view of one subscription.
struct Interest {
    subject: String,
    queue_group: Option<String>,
    delivered: u64,
    max: Option<u64>,
}

struct Client {
    events: Sender<ProtocolEvent>,
    interests: HashMap<SubscriptionId, Interest>,
    connected: bool,
}

#[derive(Default)]
struct ServerState {
    clients: HashMap<u64, Client>,
    next_client: u64,
    running: bool,
}

impl ServerState {
    /// Send an event to a client, forgetting it if its connection is gone.
    fn notify(&mut self, client: u64, event: ProtocolEvent) {
        let gone = match self.clients.get(&client) {
            Some(c) => c.events.send(event).is_err(),
            None => false,
        };
        if gone {
            trace!(client, "loopback client dropped");
            self.clients.remove(&client);
        }
    }

    fn route(&mut self, subject: &str, reply_to: Option<&str>, payload: &[u8]) {
        let mut direct = Vec::new();
        let mut groups: HashMap<(String, String), Vec<(u64, SubscriptionId)>> = HashMap::new();

        for (client_id, client) in &self.clients {
            if !client.connected {
                continue;
            }
            for (sid, interest) in &client.interests {
                if !subject_matches(&interest.subject, subject) {
                    continue;
                }
                match &interest.queue_group {
                    None => direct.push((*client_id, *sid)),
                    Some(group) => groups
                        .entry((interest.subject.clone(), group.clone()))
                        .or_default()
                        .push((*client_id, *sid)),
                }
            }
        }

        let mut rng = rand::thread_rng();
        for members in groups.values() {
            if let Some(member) = members.choose(&mut rng) {
                direct.push(*member);
            }
        }

        for (client_id, sid) in direct {
            let client = match self.clients.get_mut(&client_id) {
                Some(client) => client,
                None => continue,
            };
            let exhausted = match client.interests.get_mut(&sid) {
                Some(interest) => {
                    interest.delivered += 1;
                    interest.max.is_some_and(|max| interest.delivered >= max)
                }
                None => continue,
            };
            if exhausted {
                client.interests.remove(&sid);
            }

            let message = Message::new(sid, subject, payload.to_vec());
            let message = match reply_to {
                Some(reply_to) => message.with_reply(reply_to),
                None => message,
            };
            self.notify(client_id, ProtocolEvent::Message(message));
        }
    }
}

/// An in-process server for any number of connections.
#[derive(Clone)]
pub struct LoopbackServer {
    state: Arc<Mutex<ServerState>>,
}

impl LoopbackServer {
    /// Create a running server.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                running: true,
                ..Default::default()
            })),
        }
    }

    /// Open a new client connection to this server.
    pub fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        let (sender, receiver) = unbounded();
        let client = {
            let mut state = self.state.lock();
            let id = state.next_client;
            state.next_client += 1;
            let connected = state.running;
            state.clients.insert(
                id,
                Client {
                    events: sender,
                    interests: HashMap::new(),
                    connected,
                },
            );
            id
        };

        let transport = Arc::new(LoopbackTransport {
            client,
            state: Arc::clone(&self.state),
        });
        Connection::new(transport, receiver, config)
    }

    /// Stop the server: every client loses its connection and all
    /// server-side interest is forgotten.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.running = false;
        let ids: Vec<u64> = state.clients.keys().copied().collect();
        for id in ids {
            if let Some(client) = state.clients.get_mut(&id) {
                client.connected = false;
                client.interests.clear();
            }
            state.notify(id, ProtocolEvent::ConnectionLost);
        }
    }

    /// Start a stopped server; every client is told its transport is back.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.running {
            return;
        }
        state.running = true;
        let ids: Vec<u64> = state.clients.keys().copied().collect();
        for id in ids {
            if let Some(client) = state.clients.get_mut(&id) {
                client.connected = true;
            }
            state.notify(id, ProtocolEvent::ConnectionRestored);
        }
    }

    pub fn restart(&self) {
        self.shutdown();
        self.start();
    }

    /// Deliver a transport error to every client.
    pub fn inject_error(&self, cause: &str) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.clients.keys().copied().collect();
        for id in ids {
            state.notify(id, ProtocolEvent::TransportError(cause.to_string()));
        }
    }

    /// Server-side subscriptions across all clients.
    pub fn interest_count(&self) -> usize {
        self.state
            .lock()
            .clients
            .values()
            .map(|c| c.interests.len())
            .sum()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's session with a [`LoopbackServer`].
///
/// Frames written while the server is down are lost, as they would be on a
/// dead socket.
struct LoopbackTransport {
    client: u64,
    state: Arc<Mutex<ServerState>>,
}

impl LoopbackTransport {
    fn with_client<F>(&self, f: F)
    where
        F: FnOnce(&mut Client),
    {
        let mut state = self.state.lock();
        if let Some(client) = state.clients.get_mut(&self.client) {
            if client.connected {
                f(client);
            }
        }
    }
}

impl Transport for LoopbackTransport {
    fn send_subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        sid: SubscriptionId,
    ) -> Result<()> {
        self.with_client(|client| {
            client.interests.insert(
                sid,
                Interest {
                    subject: subject.to_string(),
                    queue_group: queue_group.map(str::to_string),
                    delivered: 0,
                    max: None,
                },
            );
        });
        Ok(())
    }

    fn send_unsubscribe(&self, sid: SubscriptionId, max: Option<u64>) -> Result<()> {
        self.with_client(|client| match max {
            None => {
                client.interests.remove(&sid);
            }
            Some(max) => {
                let exhausted = match client.interests.get_mut(&sid) {
                    Some(interest) => {
                        interest.max = Some(max);
                        interest.delivered >= max
                    }
                    None => false,
                };
                if exhausted {
                    client.interests.remove(&sid);
                }
            }
        });
        Ok(())
    }

    fn send_publish(&self, subject: &str, reply_to: Option<&str>, payload: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let connected = state
            .clients
            .get(&self.client)
            .is_some_and(|c| c.connected);
        if connected {
            state.route(subject, reply_to, payload);
        }
        Ok(())
    }

    fn send_ping(&self) -> Result<()> {
        let mut state = self.state.lock();
        let connected = state
            .clients
            .get(&self.client)
            .is_some_and(|c| c.connected);
        if connected {
            state.notify(self.client, ProtocolEvent::Pong);
        }
        Ok(())
    }
}

/// Match a subscription subject (which may contain `*` and `>`) against a
/// concrete published subject.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("foo", "foo"));
        assert!(!subject_matches("foo", "bar"));
        assert!(subject_matches("foo.*", "foo.bar"));
        assert!(!subject_matches("foo.*", "foo.bar.baz"));
        assert!(subject_matches("foo.>", "foo.bar.baz"));
        assert!(!subject_matches("foo.>", "foo"));
        assert!(subject_matches("*.bar", "foo.bar"));
        assert!(!subject_matches("foo.bar", "foo"));
    }

    #[test]
    fn test_server_side_max() {
        let server = LoopbackServer::new();
        let (sender, receiver) = unbounded();
        server.state.lock().clients.insert(
            0,
            Client {
                events: sender,
                interests: HashMap::new(),
                connected: true,
            },
        );
        let transport = LoopbackTransport {
            client: 0,
            state: Arc::clone(&server.state),
        };

        transport.send_subscribe("foo", None, SubscriptionId(1)).unwrap();
        transport.send_unsubscribe(SubscriptionId(1), Some(2)).unwrap();
        for _ in 0..5 {
            transport.send_publish("foo", None, b"x").unwrap();
        }

        let delivered = receiver
            .try_iter()
            .filter(|e| matches!(e, ProtocolEvent::Message(_)))
            .count();
        assert_eq!(delivered, 2);
        assert_eq!(server.interest_count(), 0);
    }

    #[test]
    fn test_reply_subject_carried() {
        let server = LoopbackServer::new();
        let (sender, receiver) = unbounded();
        server.state.lock().clients.insert(
            0,
            Client {
                events: sender,
                interests: HashMap::new(),
                connected: true,
            },
        );
        let transport = LoopbackTransport {
            client: 0,
            state: Arc::clone(&server.state),
        };

        transport.send_subscribe("svc", None, SubscriptionId(1)).unwrap();
        transport.send_publish("svc", Some("_INBOX.abc"), b"q").unwrap();
        transport.send_publish("svc", None, b"n").unwrap();

        let replies: Vec<_> = receiver
            .try_iter()
            .filter_map(|e| match e {
                ProtocolEvent::Message(m) => Some(m.reply_to),
                _ => None,
            })
            .collect();
        assert_eq!(replies, vec![Some("_INBOX.abc".to_string()), None]);
    }

    #[test]
    fn test_queue_group_picks_one() {
        let server = LoopbackServer::new();
        let (sender, receiver) = unbounded();
        server.state.lock().clients.insert(
            0,
            Client {
                events: sender,
                interests: HashMap::new(),
                connected: true,
            },
        );
        let transport = LoopbackTransport {
            client: 0,
            state: Arc::clone(&server.state),
        };

        transport.send_subscribe("jobs", Some("workers"), SubscriptionId(1)).unwrap();
        transport.send_subscribe("jobs", Some("workers"), SubscriptionId(2)).unwrap();
        transport.send_subscribe("jobs", None, SubscriptionId(3)).unwrap();
        for _ in 0..10 {
            transport.send_publish("jobs", None, b"x").unwrap();
        }

        let mut per_sid: HashMap<SubscriptionId, usize> = HashMap::new();
        for event in receiver.try_iter() {
            if let ProtocolEvent::Message(m) = event {
                *per_sid.entry(m.sid).or_default() += 1;
            }
        }
        assert_eq!(per_sid.get(&SubscriptionId(3)), Some(&10));
        let grouped = per_sid.get(&SubscriptionId(1)).unwrap_or(&0)
            + per_sid.get(&SubscriptionId(2)).unwrap_or(&0);
        assert_eq!(grouped, 10);
    }

    #[test]
    fn test_shutdown_drops_frames() {
        let server = LoopbackServer::new();
        let (sender, receiver) = unbounded();
        server.state.lock().clients.insert(
            0,
            Client {
                events: sender,
                interests: HashMap::new(),
                connected: true,
            },
        );
        let transport = LoopbackTransport {
            client: 0,
            state: Arc::clone(&server.state),
        };
        transport.send_subscribe("foo", None, SubscriptionId(1)).unwrap();

        server.shutdown();
        assert!(!server.is_running());
        assert_eq!(server.interest_count(), 0);
        transport.send_subscribe("foo", None, SubscriptionId(2)).unwrap();
        transport.send_ping().unwrap();
        server.start();

        let events: Vec<_> = receiver.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ProtocolEvent::ConnectionLost));
        assert!(matches!(events[1], ProtocolEvent::ConnectionRestored));
        assert_eq!(server.interest_count(), 0);
    }
}
