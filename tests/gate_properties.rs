//! Property-based tests for the credit gate
//!
//! These tests pin down the rule order:
//! - Development bypass beats everything
//! - An active subscription allows any balance without charging
//! - A positive balance allows and charges; zero denies
//! - The gate never fails, whatever the balance; only NaN takes the error bypass

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use tollgate::policy::gate::{can_use_features, decide};
use tollgate::{Action, EntitlementSnapshot, GateReason, IntegrationMode, SubscriptionStatus};

// ============================================================================
// Strategies
// ============================================================================

fn arb_status() -> impl Strategy<Value = SubscriptionStatus> {
    prop_oneof![
        Just(SubscriptionStatus::None),
        Just(SubscriptionStatus::Trialing),
        Just(SubscriptionStatus::Active),
        Just(SubscriptionStatus::Cancelled),
    ]
}

fn arb_inactive_status() -> impl Strategy<Value = SubscriptionStatus> {
    prop_oneof![
        Just(SubscriptionStatus::None),
        Just(SubscriptionStatus::Trialing),
        Just(SubscriptionStatus::Cancelled),
    ]
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::build()),
        Just(Action::update()),
        "[a-z_]{1,16}".prop_map(|name| Action::new(name)),
    ]
}

fn snapshot(credits: f64, status: SubscriptionStatus) -> EntitlementSnapshot {
    EntitlementSnapshot::new(
        credits,
        status,
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
    )
}

// ============================================================================
// Rule order
// ============================================================================

proptest! {
    /// Property: disabled integration always takes the development bypass
    #[test]
    fn prop_disabled_always_bypasses(
        action in arb_action(),
        credits in -100.0f64..100.0,
        status in arb_status(),
    ) {
        let s = snapshot(credits, status);
        let decision = decide(&action, Some(&s), IntegrationMode::Disabled);
        prop_assert!(decision.allowed);
        prop_assert_eq!(decision.reason, GateReason::DevelopmentBypass);
        prop_assert!(!decision.consumes_credit());
    }

    /// Property: an active subscription allows any balance without a charge
    #[test]
    fn prop_active_subscription_allows_any_balance(
        action in arb_action(),
        credits in prop_oneof![Just(0.0f64), -1000.0f64..1000.0],
    ) {
        let s = snapshot(credits, SubscriptionStatus::Active);
        let decision = decide(&action, Some(&s), IntegrationMode::Enabled);
        prop_assert!(decision.allowed);
        prop_assert_eq!(decision.reason, GateReason::ActiveSubscription);
        prop_assert!(!decision.consumes_credit());
    }

    /// Property: a positive balance allows and reports the balance
    #[test]
    fn prop_positive_balance_is_sufficient(
        action in arb_action(),
        credits in 0.0001f64..1000.0,
        status in arb_inactive_status(),
    ) {
        let s = snapshot(credits, status);
        let decision = decide(&action, Some(&s), IntegrationMode::Enabled);
        prop_assert!(decision.allowed);
        prop_assert_eq!(decision.reason, GateReason::SufficientCredits);
        prop_assert_eq!(decision.remaining_credits, Some(credits));
        prop_assert!(decision.consumes_credit());
    }

    /// Property: an empty balance without a subscription is denied
    #[test]
    fn prop_empty_balance_denied(action in arb_action(), status in arb_inactive_status()) {
        let s = snapshot(0.0, status);
        let decision = decide(&action, Some(&s), IntegrationMode::Enabled);
        prop_assert!(!decision.allowed);
        prop_assert_eq!(decision.reason, GateReason::InsufficientCredits);
        prop_assert_eq!(decision.remaining_credits, Some(0.0));
    }

    /// Property: the decision agrees with the strict feature check whenever
    /// a snapshot exists and no bypass applies
    #[test]
    fn prop_decision_matches_feature_check(
        action in arb_action(),
        credits in 0.0f64..10.0,
        status in arb_status(),
    ) {
        let s = snapshot(credits, status);
        let decision = decide(&action, Some(&s), IntegrationMode::Enabled);
        prop_assert!(!decision.reason.is_bypass());
        prop_assert_eq!(decision.allowed, can_use_features(Some(&s)));
    }

    /// Property: the gate never fails; only an unreadable balance takes the
    /// error bypass, infinities follow the ordinary balance rules
    #[test]
    fn prop_gate_is_total(action in arb_action(), credits in any::<f64>(), status in arb_status()) {
        let s = snapshot(credits, status);
        let decision = decide(&action, Some(&s), IntegrationMode::Enabled);
        if status == SubscriptionStatus::Active {
            prop_assert_eq!(decision.reason, GateReason::ActiveSubscription);
        } else if credits.is_nan() {
            prop_assert!(decision.allowed);
            prop_assert_eq!(decision.reason, GateReason::ErrorBypass);
        } else if credits > 0.0 {
            prop_assert_eq!(decision.reason, GateReason::SufficientCredits);
        } else {
            prop_assert_eq!(decision.reason, GateReason::InsufficientCredits);
        }
    }

    /// Property: an infinite balance is an ordinary balance, not a fault
    #[test]
    fn prop_infinite_balance_is_not_a_fault(
        action in arb_action(),
        status in arb_inactive_status(),
        positive in any::<bool>(),
    ) {
        let credits = if positive { f64::INFINITY } else { f64::NEG_INFINITY };
        let s = snapshot(credits, status);
        let decision = decide(&action, Some(&s), IntegrationMode::Enabled);
        prop_assert_ne!(decision.reason, GateReason::ErrorBypass);
        prop_assert_eq!(decision.allowed, positive);
    }
}
