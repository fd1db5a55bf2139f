//! Notifications for the UI layer.
//!
//! Gating outcomes and snapshot changes are published on a tokio broadcast
//! channel. Publishing never blocks and never fails; with no subscribers the
//! event is simply dropped, and slow subscribers observe `Lagged`.

use crate::cache::entitlement::EntitlementSnapshot;
use crate::policy::gate::{Action, GateDecision};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 64;

/// Something the UI may want to react to.
#[derive(Debug, Clone)]
pub enum EntitlementEvent {
    /// The gate decided on an action.
    Gated {
        /// Action that was checked.
        action: Action,
        /// The decision.
        decision: GateDecision,
    },
    /// The cached snapshot was replaced or reconciled.
    SnapshotChanged(EntitlementSnapshot),
    /// The cached snapshot was dropped (sign-out).
    SnapshotCleared,
    /// The session was cleared; the user must sign in again.
    SessionEnded,
}

/// Broadcast fan-out of [`EntitlementEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EntitlementEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Bus retaining up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver; sees events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EntitlementEvent> {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers.
    pub fn publish(&self, event: EntitlementEvent) {
        let _ = self.tx.send(event);
    }
}
