//! In-memory entitlement snapshot.
//!
//! Holds the last known credit balance and subscription status. A refresh
//! replaces the snapshot wholesale; local decrements after a ledger charge
//! mark it provisional until the next refresh.
//!
//! Each invalidation starts a new generation. A refresh that began in an
//! earlier generation, or that finishes after the session ended, is
//! discarded instead of stored.

use crate::client::http::{RequestOptions, Transport};
use crate::clock::Clock;
use crate::config::Endpoints;
use crate::events::{EntitlementEvent, EventBus};
use crate::protocol::models::{SubscriptionStatus, SubscriptionStatusResponse, UserProfile};
use crate::TollgateError;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Who the snapshot belongs to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountHolder {
    /// Display name.
    pub name: Option<String>,
    /// Email address.
    pub email: Option<String>,
}

/// Last known entitlements of the signed-in user.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitlementSnapshot {
    /// Credit balance; never negative once cached.
    pub credits: f64,
    /// Subscription state.
    pub subscription_status: SubscriptionStatus,
    /// When the backend last confirmed this snapshot.
    pub fetched_at: DateTime<Utc>,
    /// True after a local decrement not yet confirmed by a refresh.
    pub provisional: bool,
    /// Profile details.
    pub holder: AccountHolder,
}

impl EntitlementSnapshot {
    /// Snapshot as fetched from the backend.
    pub fn new(credits: f64, subscription_status: SubscriptionStatus, fetched_at: DateTime<Utc>) -> Self {
        Self {
            credits,
            subscription_status,
            fetched_at,
            provisional: false,
            holder: AccountHolder::default(),
        }
    }

    /// Attach profile details.
    pub fn with_holder(mut self, holder: AccountHolder) -> Self {
        self.holder = holder;
        self
    }

    /// Whether usage is covered by a subscription.
    pub fn has_active_subscription(&self) -> bool {
        self.subscription_status == SubscriptionStatus::Active
    }

    /// Older than `max_age` according to `clock`.
    pub fn is_stale(&self, max_age: Duration, clock: &dyn Clock) -> bool {
        clock.elapsed_since(self.fetched_at) > max_age
    }

    /// Not subscribed and below `threshold` credits.
    pub fn is_low_balance(&self, threshold: f64) -> bool {
        !self.has_active_subscription() && self.credits < threshold
    }

    /// Subscribed or holding a positive balance.
    pub fn can_use_features(&self) -> bool {
        self.has_active_subscription() || self.credits > 0.0
    }
}

/// Shared cache of the current [`EntitlementSnapshot`].
pub struct EntitlementCache {
    transport: Arc<Transport>,
    endpoints: Endpoints,
    clock: Arc<dyn Clock>,
    snapshot: RwLock<Option<EntitlementSnapshot>>,
    generation: AtomicU64,
    events: EventBus,
}

impl EntitlementCache {
    /// Empty cache; nothing fetched yet.
    pub fn new(
        transport: Arc<Transport>,
        endpoints: Endpoints,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            transport,
            endpoints,
            clock,
            snapshot: RwLock::new(None),
            generation: AtomicU64::new(0),
            events,
        }
    }

    /// Current snapshot, `None` until the first successful refresh.
    pub fn snapshot(&self) -> Option<EntitlementSnapshot> {
        self.read().clone()
    }

    /// Fetch profile and subscription status and replace the snapshot.
    ///
    /// On any failure the previous snapshot is kept and the error returned.
    /// Fails with `Authentication` and stores nothing when the cache was
    /// invalidated or the session ended while the fetch was in flight.
    pub async fn refresh(&self) -> Result<EntitlementSnapshot, TollgateError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let profile: UserProfile = self
            .transport
            .send(self.endpoints.user_profile, RequestOptions::get())
            .await?
            .json()?;
        let subscription: SubscriptionStatusResponse = self
            .transport
            .send(self.endpoints.subscription_status, RequestOptions::get())
            .await?
            .json()?;

        let snapshot = EntitlementSnapshot::new(
            profile.credits.max(0.0),
            subscription.effective_status(),
            self.clock.now_utc(),
        )
        .with_holder(AccountHolder {
            name: profile.name,
            email: profile.email,
        });

        if !self.commit(generation, snapshot.clone()) {
            debug!(generation, "session ended during refresh, discarding snapshot");
            return Err(TollgateError::Authentication(
                "Session ended while entitlements were loading".to_string(),
            ));
        }
        info!(
            credits = snapshot.credits,
            subscription = ?snapshot.subscription_status,
            "entitlements refreshed"
        );
        Ok(snapshot)
    }

    /// Lower the cached balance by `amount`, clamping at zero.
    ///
    /// No-op when nothing has been fetched yet.
    pub fn apply_optimistic_decrement(&self, amount: f64) -> Option<EntitlementSnapshot> {
        self.reconcile_consumption(amount, None)
    }

    /// Apply a confirmed ledger charge: decrement locally, then adopt the
    /// server-reported balance when one was returned.
    pub fn reconcile_consumption(
        &self,
        amount: f64,
        server_remaining: Option<f64>,
    ) -> Option<EntitlementSnapshot> {
        let updated = {
            let mut guard = self.write();
            let snapshot = guard.as_mut()?;
            snapshot.credits = clamp_credits(snapshot.credits - amount);
            if let Some(remaining) = server_remaining.filter(|r| r.is_finite()) {
                snapshot.credits = clamp_credits(remaining);
            }
            snapshot.provisional = true;
            snapshot.clone()
        };

        debug!(
            amount,
            credits = updated.credits,
            "cached balance reconciled after charge"
        );
        self.events
            .publish(EntitlementEvent::SnapshotChanged(updated.clone()));
        Some(updated)
    }

    /// Drop the snapshot (sign-out). Refreshes already in flight will not
    /// store their result.
    pub fn invalidate(&self) {
        let had_snapshot = {
            let mut guard = self.write();
            self.generation.fetch_add(1, Ordering::SeqCst);
            guard.take().is_some()
        };
        if had_snapshot {
            self.events.publish(EntitlementEvent::SnapshotCleared);
        }
    }

    /// Time since the snapshot was fetched.
    pub fn age(&self) -> Option<Duration> {
        self.read()
            .as_ref()
            .map(|s| self.clock.elapsed_since(s.fetched_at))
    }

    /// No snapshot, or one older than `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        match self.read().as_ref() {
            Some(snapshot) => snapshot.is_stale(max_age, self.clock.as_ref()),
            None => true,
        }
    }

    /// Store `snapshot` if no invalidation happened since `generation` and
    /// the session is still signed in.
    fn commit(&self, generation: u64, snapshot: EntitlementSnapshot) -> bool {
        {
            let mut guard = self.write();
            if self.generation.load(Ordering::SeqCst) != generation
                || !self.transport.session().is_authenticated()
            {
                return false;
            }
            *guard = Some(snapshot.clone());
        }
        self.events.publish(EntitlementEvent::SnapshotChanged(snapshot));
        true
    }

    #[cfg(test)]
    fn replace(&self, snapshot: EntitlementSnapshot) {
        *self.write() = Some(snapshot.clone());
        self.events.publish(EntitlementEvent::SnapshotChanged(snapshot));
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<EntitlementSnapshot>> {
        self.snapshot.read().unwrap_or_else(|e| {
            warn!("entitlement cache lock poisoned, recovering");
            e.into_inner()
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<EntitlementSnapshot>> {
        self.snapshot.write().unwrap_or_else(|e| {
            warn!("entitlement cache lock poisoned, recovering");
            e.into_inner()
        })
    }
}

fn clamp_credits(credits: f64) -> f64 {
    if credits.is_nan() {
        credits
    } else {
        credits.max(0.0)
    }
}
