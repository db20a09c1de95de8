//! Asynchronous error and lifecycle notifications.
//!
//! User callbacks never run on the inbound path. They are queued to a single
//! dedicated thread so a slow or blocking handler cannot stall routing.

use crate::error::ClientError;
use crate::subscriptions::Subscription;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::thread;

/// Callback for asynchronous faults. The subscription is set for faults that
/// belong to one, such as a slow consumer.
pub type ErrorHandler = Arc<dyn Fn(Option<&Subscription>, &ClientError) + Send + Sync>;

/// Callback for connection lifecycle changes.
pub type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;

type Job = Box<dyn FnOnce() + Send>;

#[derive(Clone, Default)]
struct Handlers {
    on_error: Option<ErrorHandler>,
    on_reconnected: Option<LifecycleHandler>,
    on_disconnected: Option<LifecycleHandler>,
    on_closed: Option<LifecycleHandler>,
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_error", &self.on_error.is_some())
            .field("on_reconnected", &self.on_reconnected.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .field("on_closed", &self.on_closed.is_some())
            .finish()
    }
}

/// Routes notifications to user handlers on the callback thread.
pub(crate) struct EventSurface {
    handlers: RwLock<Handlers>,
    jobs: Mutex<Option<Sender<Job>>>,
    last_error: Mutex<Option<ClientError>>,
}

impl EventSurface {
    /// Create the surface and start its callback thread.
    pub fn start(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        thread::Builder::new()
            .name(format!("{}-events", name))
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })?;

        Ok(Self {
            handlers: RwLock::new(Handlers::default()),
            jobs: Mutex::new(Some(sender)),
            last_error: Mutex::new(None),
        })
    }

    pub fn set_error_handler(&self, handler: Option<ErrorHandler>) {
        self.handlers.write().on_error = handler;
    }

    pub fn set_reconnected_handler(&self, handler: Option<LifecycleHandler>) {
        self.handlers.write().on_reconnected = handler;
    }

    pub fn set_disconnected_handler(&self, handler: Option<LifecycleHandler>) {
        self.handlers.write().on_disconnected = handler;
    }

    pub fn set_closed_handler(&self, handler: Option<LifecycleHandler>) {
        self.handlers.write().on_closed = handler;
    }

    pub fn last_error(&self) -> Option<ClientError> {
        self.last_error.lock().clone()
    }

    /// Record an asynchronous fault and notify the error handler.
    pub fn emit_error(&self, subscription: Option<Subscription>, error: ClientError) {
        *self.last_error.lock() = Some(error.clone());
        let handler = self.handlers.read().on_error.clone();
        if let Some(handler) = handler {
            self.submit(Box::new(move || handler(subscription.as_ref(), &error)));
        }
    }

    pub fn emit_reconnected(&self) {
        let handler = self.handlers.read().on_reconnected.clone();
        self.submit_lifecycle(handler);
    }

    pub fn emit_disconnected(&self) {
        let handler = self.handlers.read().on_disconnected.clone();
        self.submit_lifecycle(handler);
    }

    pub fn emit_closed(&self) {
        let handler = self.handlers.read().on_closed.clone();
        self.submit_lifecycle(handler);
    }

    /// Stop accepting callbacks. Jobs already queued still run.
    pub fn shutdown(&self) {
        self.jobs.lock().take();
    }

    fn submit_lifecycle(&self, handler: Option<LifecycleHandler>) {
        if let Some(handler) = handler {
            self.submit(Box::new(move || handler()));
        }
    }

    fn submit(&self, job: Job) {
        if let Some(sender) = self.jobs.lock().as_ref() {
            let _ = sender.send(job);
        }
    }
}
