//! Backend request/response bodies.

use crate::TollgateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of `POST auth/google`.
#[derive(Debug, Clone, Serialize)]
pub struct SignInRequest<'a> {
    /// Third-party identity token.
    pub token: &'a str,
}

/// Response of `POST auth/google`.
#[derive(Debug, Clone, Deserialize)]
pub struct SignInResponse {
    /// Issued access token.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Refresh token when returned at the top level.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Provider session, which may carry the refresh token instead.
    #[serde(default)]
    pub session: Option<SignInSession>,
}

/// Nested provider session.
#[derive(Debug, Clone, Deserialize)]
pub struct SignInSession {
    /// Refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl SignInResponse {
    /// Refresh token from either location, top level first.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token
            .as_deref()
            .or_else(|| self.session.as_ref()?.refresh_token.as_deref())
    }
}

/// Body of `POST auth/refresh`.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshRequest<'a> {
    /// Current refresh token.
    pub refresh_token: &'a str,
}

/// Response of `POST auth/refresh`.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
    /// New access token.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Rotated refresh token, if the server rotates.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Response of `GET user/profile`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Email address.
    #[serde(default)]
    pub email: Option<String>,
    /// Credit balance.
    #[serde(default)]
    pub credits: f64,
}

/// Subscription state as seen by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// No subscription.
    #[default]
    None,
    /// Trial period.
    Trialing,
    /// Paid and active; unlimited usage.
    Active,
    /// Cancelled.
    Cancelled,
}

impl SubscriptionStatus {
    /// Map a backend status string; unknown values count as no subscription.
    pub fn from_wire(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "cancelled" | "canceled" => SubscriptionStatus::Cancelled,
            _ => SubscriptionStatus::None,
        }
    }
}

/// Response of `GET subscription/status`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatusResponse {
    /// Raw status string.
    #[serde(default)]
    pub status: Option<String>,
    /// Backend's own verdict on whether the subscription is usable.
    #[serde(default)]
    pub has_active_subscription: Option<bool>,
}

impl SubscriptionStatusResponse {
    /// Effective status; the `hasActiveSubscription` flag wins over the string.
    pub fn effective_status(&self) -> SubscriptionStatus {
        let status = self
            .status
            .as_deref()
            .map(SubscriptionStatus::from_wire)
            .unwrap_or_default();
        match (self.has_active_subscription, status) {
            (Some(true), _) => SubscriptionStatus::Active,
            // Not usable according to the backend, whatever the string says.
            (Some(false), SubscriptionStatus::Active) => SubscriptionStatus::None,
            (_, status) => status,
        }
    }
}

/// Body of `POST credits/use`.
#[derive(Debug, Clone, Serialize)]
pub struct UseCreditRequest<'a> {
    /// Action being paid for.
    pub action: &'a str,
}

/// Response of `POST credits/use`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UseCreditResponse {
    /// Whether a credit was consumed.
    #[serde(default)]
    pub success: bool,
    /// Authoritative balance after consumption.
    #[serde(default)]
    pub remaining_credits: Option<f64>,
    /// Failure reason when `success` is false.
    #[serde(default)]
    pub error: Option<String>,
}

/// Body of `POST credits/deduct`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CostReport {
    /// Provider cost of the call in USD.
    pub cost: f64,
    /// Provider name, e.g. "openai".
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Token count of the call.
    pub tokens: u64,
    /// Action label; defaults to `<provider>_api_call`.
    pub action: String,
    /// Free-form caller tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
}

impl CostReport {
    /// Report for a provider call; the action defaults to `<provider>_api_call`.
    pub fn new(provider: impl Into<String>, model: impl Into<String>, tokens: u64, cost: f64) -> Self {
        let provider = provider.into();
        Self {
            action: format!("{}_api_call", provider),
            cost,
            provider,
            model: model.into(),
            tokens,
            caller: None,
        }
    }

    /// Override the action label.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    /// Tag the report with its caller.
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }
}

/// Response of `POST credits/deduct`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductResponse {
    /// Whether the deduction happened.
    #[serde(default)]
    pub success: bool,
    /// Credits charged.
    #[serde(default)]
    pub credit_cost: Option<f64>,
    /// Authoritative balance after deduction.
    #[serde(default)]
    pub remaining_credits: Option<f64>,
    /// Failure reason when `success` is false.
    #[serde(default)]
    pub error: Option<String>,
}

/// Response of `GET user/usage`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageAnalytics {
    /// Counts per action.
    #[serde(default)]
    pub summary: UsageSummary,
    /// Total actions performed.
    #[serde(default)]
    pub total_actions: u64,
    /// Most recent actions.
    #[serde(default)]
    pub recent_activity: Vec<UsageActivity>,
}

/// Per-action counts.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UsageSummary {
    /// Model builds.
    #[serde(default)]
    pub build: u64,
    /// Model updates.
    #[serde(default)]
    pub update: u64,
}

/// One past action.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageActivity {
    /// Action label.
    #[serde(default)]
    pub action: String,
    /// When it happened; `None` when missing or not RFC 3339.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc)))
}

/// Body of `POST subscription/create`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest<'a> {
    /// Redirect after payment.
    pub success_url: &'a str,
    /// Redirect after abandoning checkout.
    pub cancel_url: &'a str,
}

/// Response of `POST subscription/create`.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutResponse {
    /// Hosted checkout page.
    #[serde(default)]
    pub url: Option<String>,
}

/// Response of `POST subscription/cancel`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    /// Whether cancellation was accepted.
    #[serde(default)]
    pub success: bool,
    /// When the subscription actually ends.
    #[serde(default)]
    pub cancel_at: Option<DateTime<Utc>>,
}

/// Error body of any non-success response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    /// Short error string.
    #[serde(default)]
    pub error: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
    /// Balance, present on 402 responses.
    #[serde(default)]
    pub credits: Option<f64>,
}

impl ErrorBody {
    /// Parse an error body; anything unparseable yields an empty body.
    pub fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }

    /// `error` field first, then `message`.
    pub fn server_message(&self) -> Option<String> {
        self.error.clone().or_else(|| self.message.clone())
    }
}

/// Decode a JSON body into `T`.
pub fn parse_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, TollgateError> {
    serde_json::from_slice(body)
        .map_err(|e| TollgateError::Protocol(format!("Failed to parse response: {}", e)))
}
