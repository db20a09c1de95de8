//! Per-subscription delivery threads for asynchronous subscriptions.
//!
//! Every asynchronous subscription gets one named thread that pulls from its
//! queue and calls the handler. Handlers of one subscription therefore never
//! overlap, and a handler that blocks only stalls its own subscription.

use crate::error::ClientError;
use crate::events::EventSurface;
use crate::subscriptions::{Delivery, MessageHandler, Subscription};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, trace};

/// Dispatcher thread accounting, owned by one connection.
#[derive(Debug, Default)]
pub struct DispatchStats {
    created: AtomicU64,
    alive: AtomicU64,
}

impl DispatchStats {
    /// Threads started over the connection's life.
    pub fn threads_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Threads currently running.
    pub fn threads_alive(&self) -> u64 {
        self.alive.load(Ordering::Relaxed)
    }
}

/// Decrements the alive count when the thread exits, including by panic.
struct AliveGuard(Arc<DispatchStats>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.alive.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Start the delivery thread for `subscription`.
pub(crate) fn spawn(
    name: &str,
    subscription: Subscription,
    handler: MessageHandler,
    events: Arc<EventSurface>,
    stats: Arc<DispatchStats>,
) -> std::io::Result<()> {
    stats.created.fetch_add(1, Ordering::Relaxed);
    stats.alive.fetch_add(1, Ordering::Relaxed);
    let guard = AliveGuard(Arc::clone(&stats));

    let spawned = thread::Builder::new()
        .name(format!("{}-sub-{}", name, subscription.id()))
        .spawn(move || {
            let _guard = guard;
            run(subscription, handler, &events);
        });

    // On failure the closure (and the guard inside it) is dropped, which
    // already balanced the alive count.
    spawned.map(|_| ())
}

fn run(subscription: Subscription, mut handler: MessageHandler, events: &EventSurface) {
    let sid = subscription.id();
    trace!(sid = sid.0, "dispatcher started");

    while let Ok(message) = subscription.shared.queue.dequeue(None) {
        let last = match subscription.shared.begin_delivery() {
            Delivery::Deliver { last } => last,
            Delivery::Stop => break,
        };
        if last {
            subscription.expire();
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(message)));
        if let Err(payload) = outcome {
            let reason = panic_message(payload.as_ref());
            error!(sid = sid.0, reason = %reason, "message handler panicked");
            events.emit_error(Some(subscription.clone()), ClientError::HandlerPanicked(reason));
        }

        if last {
            break;
        }
    }

    trace!(sid = sid.0, "dispatcher stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
