//! Credit gate: decides whether an action may proceed.
//!
//! Rules, first match wins:
//! 1. Integration disabled - allowed (development bypass)
//! 2. Active subscription - allowed, no credit consumed
//! 3. Positive balance - allowed, one credit to be consumed
//! 4. No snapshot fetched yet - allowed (profile still loading)
//! 5. Otherwise - denied
//!
//! A fault while evaluating rules 1-4 allows the action (`ErrorBypass`).
//! The bypasses make this a usage meter, not an access-control boundary.

use crate::cache::entitlement::EntitlementSnapshot;
use crate::config::IntegrationMode;
use crate::protocol::models::SubscriptionStatus;
use std::fmt;
use thiserror::Error;

/// Identifier of a paid action (e.g. "build", "update").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Action(String);

impl Action {
    /// Any action label.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Building a model.
    pub fn build() -> Self {
        Self::new("build")
    }

    /// Updating a model.
    pub fn update() -> Self {
        Self::new("update")
    }

    /// The label.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Action {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Action {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Why the gate decided the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    /// No entitlement backend configured.
    DevelopmentBypass,
    /// Subscription covers the action.
    ActiveSubscription,
    /// Balance covers the action.
    SufficientCredits,
    /// Profile not loaded yet; temporary grace.
    ProfileUnloadedBypass,
    /// Evaluation failed; fail open.
    ErrorBypass,
    /// No subscription and no balance.
    InsufficientCredits,
}

impl GateReason {
    /// Stable label for logs and analytics.
    pub fn as_str(&self) -> &'static str {
        match self {
            GateReason::DevelopmentBypass => "development_bypass",
            GateReason::ActiveSubscription => "active_subscription",
            GateReason::SufficientCredits => "sufficient_credits",
            GateReason::ProfileUnloadedBypass => "profile_unloaded_bypass",
            GateReason::ErrorBypass => "error_bypass",
            GateReason::InsufficientCredits => "insufficient_credits",
        }
    }

    /// Allowed without touching the ledger for a reason other than a subscription.
    pub fn is_bypass(&self) -> bool {
        matches!(
            self,
            GateReason::DevelopmentBypass
                | GateReason::ProfileUnloadedBypass
                | GateReason::ErrorBypass
        )
    }
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one gate evaluation. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    /// Whether the action may proceed.
    pub allowed: bool,
    /// Which rule matched.
    pub reason: GateReason,
    /// Balance the decision was based on, for credit-based outcomes.
    pub remaining_credits: Option<f64>,
}

impl GateDecision {
    fn allow(reason: GateReason) -> Self {
        Self {
            allowed: true,
            reason,
            remaining_credits: None,
        }
    }

    /// Whether the ledger must be charged for this action.
    pub fn consumes_credit(&self) -> bool {
        self.allowed && self.reason == GateReason::SufficientCredits
    }
}

#[derive(Debug, Error)]
enum GateFault {
    #[error("cached balance is not a number")]
    UnreadableBalance,
}

/// Decide whether `action` may proceed. Pure; never fails.
pub fn decide(
    action: &Action,
    snapshot: Option<&EntitlementSnapshot>,
    mode: IntegrationMode,
) -> GateDecision {
    match evaluate(snapshot, mode) {
        Ok(decision) => {
            tracing::debug!(
                action = %action,
                allowed = decision.allowed,
                reason = %decision.reason,
                "gate decision"
            );
            decision
        }
        Err(fault) => {
            tracing::warn!(
                action = %action,
                error = %fault,
                "entitlement check failed, allowing action"
            );
            GateDecision::allow(GateReason::ErrorBypass)
        }
    }
}

fn evaluate(
    snapshot: Option<&EntitlementSnapshot>,
    mode: IntegrationMode,
) -> Result<GateDecision, GateFault> {
    if mode == IntegrationMode::Disabled {
        return Ok(GateDecision::allow(GateReason::DevelopmentBypass));
    }

    let Some(snapshot) = snapshot else {
        return Ok(GateDecision::allow(GateReason::ProfileUnloadedBypass));
    };

    if snapshot.subscription_status == SubscriptionStatus::Active {
        return Ok(GateDecision::allow(GateReason::ActiveSubscription));
    }

    if snapshot.credits.is_nan() {
        return Err(GateFault::UnreadableBalance);
    }

    if snapshot.credits > 0.0 {
        return Ok(GateDecision {
            allowed: true,
            reason: GateReason::SufficientCredits,
            remaining_credits: Some(snapshot.credits),
        });
    }

    Ok(GateDecision {
        allowed: false,
        reason: GateReason::InsufficientCredits,
        remaining_credits: Some(snapshot.credits),
    })
}

/// Strict check for UI enablement: subscribed or positive balance, no bypasses.
pub fn can_use_features(snapshot: Option<&EntitlementSnapshot>) -> bool {
    snapshot.is_some_and(|s| {
        s.subscription_status == SubscriptionStatus::Active || s.credits > 0.0
    })
}
