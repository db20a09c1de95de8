//! Connection-loss and reconnection handling.
//!
//! Status moves `Connected -> Disconnected -> Reconnecting -> Connected`, with
//! `Closed` terminal from anywhere. While disconnected the registry and every
//! queue are kept as they are; publishes are buffered by the outbound path.
//! On restoration each still-valid subscription is registered again with
//! whatever remains of its auto-unsubscribe quota before buffered publishes
//! are flushed.

use crate::error::Result;
use crate::events::EventSurface;
use crate::subscriptions::SubscriptionManager;
use crate::transport::Outbound;
use crate::types::{ConnectionStatus, StatsCounters};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the connection should do after a transport loss.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LossOutcome {
    /// Waiting for the transport to come back.
    Suspended,
    /// Reconnect is disabled; the connection must close.
    Close,
    /// Already disconnected or closed.
    Ignored,
}

pub(crate) struct ReconnectCoordinator {
    outbound: Arc<Outbound>,
    manager: Arc<SubscriptionManager>,
    events: Arc<EventSurface>,
    stats: Arc<StatsCounters>,
    allow_reconnect: bool,
}

impl ReconnectCoordinator {
    pub fn new(
        outbound: Arc<Outbound>,
        manager: Arc<SubscriptionManager>,
        events: Arc<EventSurface>,
        stats: Arc<StatsCounters>,
        allow_reconnect: bool,
    ) -> Self {
        Self {
            outbound,
            manager,
            events,
            stats,
            allow_reconnect,
        }
    }

    pub fn connection_lost(&self) -> LossOutcome {
        if !self.allow_reconnect {
            return match self.outbound.status() {
                ConnectionStatus::Closed => LossOutcome::Ignored,
                _ => LossOutcome::Close,
            };
        }
        match self.outbound.set_status(ConnectionStatus::Disconnected) {
            ConnectionStatus::Connected | ConnectionStatus::Reconnecting => {
                info!(subscriptions = self.manager.count(), "connection lost, waiting for transport");
                self.events.emit_disconnected();
                LossOutcome::Suspended
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Closed => LossOutcome::Ignored,
        }
    }

    /// Replay the registry on the restored session and resume.
    pub fn connection_restored(&self) -> Result<()> {
        if self.outbound.status() != ConnectionStatus::Disconnected {
            debug!(status = ?self.outbound.status(), "ignoring restore outside of disconnect");
            return Ok(());
        }

        let mut replayed = 0;
        let result = self.outbound.reconnect(|transport| {
            replayed = self.manager.replay(transport)?;
            Ok(())
        });
        if let Err(e) = result {
            warn!(error = %e, "resubscribe after reconnect failed");
            return Err(e);
        }

        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        info!(replayed, "reconnected");
        self.events.emit_reconnected();
        Ok(())
    }
}
