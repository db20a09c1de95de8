//! Subscriptions: registration, routing and delivery accounting.
//!
//! A subscription is either:
//! - **asynchronous**: created with a handler, which runs on a dedicated
//!   thread for that subscription, one message at a time;
//! - **synchronous**: pulled by the application with
//!   [`Subscription::next_message`].
//!
//! Each subscription owns a bounded queue. Messages arriving while the queue
//! is full are dropped and reported once per overflow episode as a slow
//! consumer. An auto-unsubscribe quota caps the total number of messages
//! delivered, across reconnects.
//!
//! # Example
//!
//! ```ignore
//! let sub = conn.subscribe_sync("updates")?;
//! sub.auto_unsubscribe(10)?;
//!
//! loop {
//!     match sub.next_message(Duration::from_secs(1)) {
//!         Ok(msg) => println!("got {} bytes", msg.payload.len()),
//!         Err(ClientError::Timeout) => continue,
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub(crate) use types::Delivery;
pub use types::{CloseReason, MessageHandler, Subscription, SubscriptionState};
