//! Entitlement Manager - the main public API for Tollgate.
//!
//! The `EntitlementManager` owns the session store, transport, entitlement
//! cache, and ledger client, and wires them together:
//! - Gate paid actions and charge the ledger when credits are used
//! - Keep the entitlement snapshot fresh
//! - Sign-in, sign-out, checkout, and subscription management

use crate::cache::entitlement::{EntitlementCache, EntitlementSnapshot};
use crate::client::http::{RequestOptions, Transport};
use crate::client::refresh::SessionPhase;
use crate::clock::{Clock, SystemClock};
use crate::config::{IntegrationMode, TollgateConfig};
use crate::events::{EntitlementEvent, EventBus};
use crate::meter::ledger::{DeductionReceipt, LedgerClient};
use crate::policy::gate::{self, Action, GateDecision, GateReason};
use crate::protocol::models::{
    CancelResponse, CheckoutRequest, CheckoutResponse, CostReport, SignInRequest, SignInResponse,
    UsageAnalytics,
};
use crate::session::store::{token_fingerprint, SessionStore};
use crate::TollgateError;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of an authorized action.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumptionResult {
    /// The action that was authorized.
    pub action: Action,

    /// Which gate rule allowed it.
    pub reason: GateReason,

    /// Balance after the action, when known.
    pub remaining_credits: Option<f64>,

    /// Whether the ledger was charged.
    pub ledger_charged: bool,
}

impl ConsumptionResult {
    /// Covered by a subscription.
    pub fn via_subscription(&self) -> bool {
        self.reason == GateReason::ActiveSubscription
    }

    /// Allowed by one of the fail-open bypasses.
    pub fn via_bypass(&self) -> bool {
        self.reason.is_bypass()
    }
}

/// Main entry point for Tollgate.
///
/// Create one instance per add-in session and share it. Must be used from
/// within a tokio runtime; background refreshes are spawned on it.
pub struct EntitlementManager {
    config: TollgateConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<Transport>,
    cache: Arc<EntitlementCache>,
    ledger: LedgerClient,
    events: EventBus,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl EntitlementManager {
    /// Create a manager with the given configuration.
    ///
    /// The session is persisted under `session_namespace` when one is set,
    /// otherwise kept in memory.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Configuration validation fails
    /// - HTTP client creation fails
    /// - The session directory cannot be created or read
    pub fn new(config: TollgateConfig) -> Result<Self, TollgateError> {
        config.validate()?;
        let session = match config.session_namespace {
            Some(namespace) => SessionStore::with_namespace(namespace)?,
            None => SessionStore::in_memory(),
        };
        Self::build(config, session, Arc::new(SystemClock))
    }

    /// Create a manager around an existing session store.
    pub fn with_session(
        config: TollgateConfig,
        session: SessionStore,
    ) -> Result<Self, TollgateError> {
        config.validate()?;
        Self::build(config, session, Arc::new(SystemClock))
    }

    /// Create a manager with a custom clock (for testing).
    #[cfg(any(test, feature = "test-seams"))]
    pub fn new_with_clock(
        config: TollgateConfig,
        session: SessionStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TollgateError> {
        config.validate()?;
        Self::build(config, session, clock)
    }

    fn build(
        config: TollgateConfig,
        session: SessionStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TollgateError> {
        let events = EventBus::default();
        let transport = Arc::new(Transport::new(&config, Arc::new(session), events.clone())?);
        let cache = Arc::new(EntitlementCache::new(
            transport.clone(),
            config.endpoints.clone(),
            clock.clone(),
            events.clone(),
        ));
        let ledger = LedgerClient::new(transport.clone(), config.endpoints.clone());

        Ok(Self {
            config,
            clock,
            transport,
            cache,
            ledger,
            events,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Gate `action` and charge the ledger when it runs on credits.
    ///
    /// # Errors
    /// - `InsufficientCredits` - denied by the gate, or rejected by the ledger
    /// - Any transport error from the ledger call, unchanged
    pub async fn authorize(
        &self,
        action: impl Into<Action>,
    ) -> Result<ConsumptionResult, TollgateError> {
        let action = action.into();
        let decision = self.decide(&action);
        self.events.publish(EntitlementEvent::Gated {
            action: action.clone(),
            decision: decision.clone(),
        });

        if !decision.allowed {
            info!(action = %action, reason = %decision.reason, "action denied");
            return Err(TollgateError::InsufficientCredits {
                remaining: decision.remaining_credits.unwrap_or(0.0),
                message: None,
            });
        }

        if !decision.consumes_credit() {
            debug!(action = %action, reason = %decision.reason, "action allowed without charge");
            return Ok(ConsumptionResult {
                action,
                reason: decision.reason,
                remaining_credits: decision.remaining_credits,
                ledger_charged: false,
            });
        }

        let receipt = self.ledger.consume(&action).await?;
        let reconciled = self
            .cache
            .reconcile_consumption(1.0, receipt.remaining_credits);
        self.spawn_refresh();

        let remaining_credits = reconciled
            .map(|s| s.credits)
            .or(receipt.remaining_credits);
        info!(action = %action, remaining = ?remaining_credits, "credit used");
        Ok(ConsumptionResult {
            action,
            reason: decision.reason,
            remaining_credits,
            ledger_charged: true,
        })
    }

    /// Gate decision for `action` against the current snapshot. No side effects.
    pub fn decide(&self, action: &Action) -> GateDecision {
        gate::decide(action, self.cache.snapshot().as_ref(), self.config.integration)
    }

    /// Fetch the entitlement snapshot now.
    ///
    /// A failure keeps the previous snapshot.
    pub async fn refresh_entitlements(&self) -> Result<EntitlementSnapshot, TollgateError> {
        self.require_backend()?;
        self.cache.refresh().await
    }

    /// Refresh only when there is no snapshot or it is older than
    /// `snapshot_max_age`. Returns the snapshot in effect afterwards.
    pub async fn refresh_if_stale(&self) -> Result<Option<EntitlementSnapshot>, TollgateError> {
        if self.config.integration == IntegrationMode::Disabled {
            return Ok(None);
        }
        if !self.transport.session().is_authenticated() {
            return Ok(self.cache.snapshot());
        }
        if self.cache.is_stale(self.config.snapshot_max_age) {
            return self.cache.refresh().await.map(Some);
        }
        Ok(self.cache.snapshot())
    }

    /// Current snapshot, `None` before the first successful fetch.
    pub fn snapshot(&self) -> Option<EntitlementSnapshot> {
        self.cache.snapshot()
    }

    /// Receive gating outcomes and snapshot changes.
    pub fn subscribe(&self) -> broadcast::Receiver<EntitlementEvent> {
        self.events.subscribe()
    }

    /// Current session phase.
    pub fn phase(&self) -> SessionPhase {
        self.transport.phase()
    }

    /// The shared session store.
    pub fn session(&self) -> &Arc<SessionStore> {
        self.transport.session()
    }

    /// Exchange a Google identity token for a backend session.
    ///
    /// Starts loading entitlements in the background on success.
    pub async fn sign_in_with_google(&self, id_token: &str) -> Result<(), TollgateError> {
        self.require_backend()?;
        if id_token.is_empty() {
            return Err(TollgateError::Authentication(
                "No identity token provided".to_string(),
            ));
        }

        let options = RequestOptions::post()
            .json(&SignInRequest { token: id_token })?
            .anonymous();
        let response: SignInResponse = self
            .transport
            .send(self.config.endpoints.auth_google, options)
            .await?
            .json()?;

        let access_token = response.access_token.clone().ok_or_else(|| {
            TollgateError::Protocol("Sign-in response carried no access token".to_string())
        })?;
        self.session().set_credentials(
            access_token.clone(),
            response.refresh_token().map(str::to_string),
        )?;

        info!(token = %token_fingerprint(&access_token), "signed in");
        self.spawn_refresh();
        Ok(())
    }

    /// Forget the session and the cached entitlements.
    pub fn sign_out(&self) -> Result<(), TollgateError> {
        for handle in self.take_background() {
            handle.abort();
        }
        self.session().clear()?;
        self.cache.invalidate();
        self.events.publish(EntitlementEvent::SessionEnded);
        info!("signed out");
        Ok(())
    }

    /// Usage counts and recent activity of the signed-in user.
    pub async fn usage_analytics(&self) -> Result<UsageAnalytics, TollgateError> {
        self.require_backend()?;
        self.transport
            .send(self.config.endpoints.user_usage, RequestOptions::get())
            .await?
            .json()
    }

    /// Start a subscription checkout; returns the hosted checkout URL.
    pub async fn create_checkout_session(
        &self,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<String, TollgateError> {
        self.require_backend()?;
        let options = RequestOptions::post().json(&CheckoutRequest {
            success_url,
            cancel_url,
        })?;
        let response: CheckoutResponse = self
            .transport
            .send(self.config.endpoints.subscription_create, options)
            .await?
            .json()?;

        response.url.ok_or_else(|| {
            TollgateError::Protocol("Checkout response carried no URL".to_string())
        })
    }

    /// Checkout finished (or was abandoned); pick up the new subscription state.
    pub async fn on_checkout_completed(&self) -> Result<EntitlementSnapshot, TollgateError> {
        self.refresh_entitlements().await
    }

    /// Cancel the subscription, then refresh the snapshot.
    ///
    /// A failed follow-up refresh is logged, not returned.
    pub async fn cancel_subscription(&self) -> Result<CancelResponse, TollgateError> {
        self.require_backend()?;
        let response: CancelResponse = self
            .transport
            .send(self.config.endpoints.subscription_cancel, RequestOptions::post())
            .await?
            .json()?;

        if response.success {
            info!(cancel_at = ?response.cancel_at, "subscription cancelled");
            if let Err(e) = self.cache.refresh().await {
                warn!(error = %e, "refresh after cancellation failed");
            }
        }
        Ok(response)
    }

    /// Whether the backend answers. Never fails.
    pub async fn health_check(&self) -> bool {
        if self.config.integration == IntegrationMode::Disabled {
            return false;
        }
        let options = RequestOptions::get()
            .anonymous()
            .timeout(self.config.health_timeout);
        match self.transport.send(self.config.endpoints.health, options).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }

    /// Charge the credit equivalent of a provider API call.
    ///
    /// Returns `None` when integration is disabled and nothing is charged.
    pub async fn record_cost(
        &self,
        report: &CostReport,
    ) -> Result<Option<DeductionReceipt>, TollgateError> {
        if self.config.integration == IntegrationMode::Disabled {
            debug!(action = %report.action, cost = report.cost, "cost not metered");
            return Ok(None);
        }

        let receipt = self.ledger.deduct(report).await?;
        self.cache
            .reconcile_consumption(receipt.credit_cost, receipt.remaining_credits);
        self.spawn_refresh();
        Ok(Some(receipt))
    }

    /// Subscribed or holding a positive balance; no bypasses.
    pub fn can_use_features(&self) -> bool {
        gate::can_use_features(self.cache.snapshot().as_ref())
    }

    /// Not subscribed and below the configured low-credit threshold.
    pub fn is_low_balance(&self) -> bool {
        self.cache
            .snapshot()
            .is_some_and(|s| s.is_low_balance(self.config.low_credit_threshold))
    }

    /// Wait for every background refresh spawned so far.
    pub async fn wait_for_background_refresh(&self) {
        for handle in self.take_background() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "background refresh task failed");
                }
            }
        }
    }

    /// Get the current configuration.
    pub fn config(&self) -> &TollgateConfig {
        &self.config
    }

    /// The clock used for snapshot timestamps.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn require_backend(&self) -> Result<(), TollgateError> {
        match self.config.integration {
            IntegrationMode::Enabled => Ok(()),
            IntegrationMode::Disabled => Err(TollgateError::Config(
                "Backend integration is disabled".to_string(),
            )),
        }
    }

    fn spawn_refresh(&self) {
        if self.config.integration == IntegrationMode::Disabled {
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("no tokio runtime, skipping background refresh");
                return;
            }
        };

        let cache = self.cache.clone();
        let handle = runtime.spawn(async move {
            if let Err(e) = cache.refresh().await {
                warn!(error = %e, "background entitlement refresh failed");
            }
        });

        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    fn take_background(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.background.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Return URLs for a checkout started from `page_url`.
///
/// Any query or fragment on `page_url` is dropped; returns
/// `(success_url, cancel_url)`.
pub fn checkout_return_urls(page_url: &str) -> (String, String) {
    let base = page_url
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or(page_url);
    (
        format!("{}?checkout=success", base),
        format!("{}?checkout=cancelled", base),
    )
}
