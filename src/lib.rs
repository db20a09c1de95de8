//! # Courier
//!
//! Client-side subscription engine for subject-based publish/subscribe
//! messaging. Wire framing and sockets live in a transport; this crate
//! manages everything above it.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: interest in a subject, optionally as a queue group
//!   member, delivered to a handler thread or pulled synchronously
//! - **Bounded queues**: per-subscription message and byte limits; overflow
//!   drops messages and reports a slow consumer instead of blocking
//! - **Auto-unsubscribe**: stop after N messages, honoured across reconnects
//! - **Reconnection**: subscriptions and queued messages survive transport
//!   loss and are re-registered when it comes back
//!
//! ## Example
//!
//! ```ignore
//! use courier::{ConnectionConfig, LoopbackServer};
//! use std::time::Duration;
//!
//! let server = LoopbackServer::new();
//! let conn = server.connect(ConnectionConfig::default())?;
//!
//! // Answer requests
//! let responder = conn.clone();
//! conn.subscribe("time", move |msg| {
//!     if let Some(reply) = msg.reply_to {
//!         let _ = responder.publish(&reply, b"noon");
//!     }
//! })?;
//!
//! let reply = conn.request("time", b"", Duration::from_secs(1))?;
//! assert_eq!(reply.payload, b"noon");
//! ```

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod loopback;
pub mod queue;
mod reconnect;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use connection::{Connection, ConnectionConfig, INBOX_PREFIX};
pub use dispatch::DispatchStats;
pub use error::{ClientError, Result};
pub use events::{ErrorHandler, LifecycleHandler};
pub use loopback::LoopbackServer;
pub use queue::{BoundedQueue, DequeueError};
pub use subscriptions::{
    CloseReason, MessageHandler, Subscription, SubscriptionManager, SubscriptionState,
};
pub use transport::{ProtocolEvent, Transport};
pub use types::*;
