//! Tollgate configuration.

use std::time::Duration;

/// Whether an entitlement backend is wired up at all.
///
/// With `Disabled`, every action is allowed as a development bypass and the
/// ledger is never called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationMode {
    /// No profile system deployed; allow everything.
    Disabled,
    /// Gate actions on subscription and credit balance.
    Enabled,
}

/// Relative paths of the backend endpoints.
#[derive(Debug, Clone)]
pub struct Endpoints {
    /// Identity token exchange.
    pub auth_google: &'static str,
    /// Access token refresh.
    pub auth_refresh: &'static str,
    /// Profile with credit balance.
    pub user_profile: &'static str,
    /// Usage analytics.
    pub user_usage: &'static str,
    /// Consume one credit.
    pub credits_use: &'static str,
    /// Cost-based credit deduction.
    pub credits_deduct: &'static str,
    /// Create a checkout session.
    pub subscription_create: &'static str,
    /// Subscription status.
    pub subscription_status: &'static str,
    /// Cancel the subscription.
    pub subscription_cancel: &'static str,
    /// Availability check.
    pub health: &'static str,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            auth_google: "auth/google",
            auth_refresh: "auth/refresh",
            user_profile: "user/profile",
            user_usage: "user/usage",
            credits_use: "credits/use",
            credits_deduct: "credits/deduct",
            subscription_create: "subscription/create",
            subscription_status: "subscription/status",
            subscription_cancel: "subscription/cancel",
            health: "health",
        }
    }
}

/// Configuration for the entitlement client.
#[derive(Debug, Clone)]
pub struct TollgateConfig {
    /// Application name (e.g., "ebitdai/1.4.0")
    pub app_name: &'static str,

    /// User-Agent product identifier (e.g., "ebitdai-addin")
    pub user_agent_product: &'static str,

    /// Backend base URL, e.g. `https://api.example.com/`.
    /// Endpoint paths are resolved relative to it.
    pub base_url: String,

    /// Endpoint paths.
    pub endpoints: Endpoints,

    /// Timeout applied to every backend call.
    pub timeout: Duration,

    /// Shorter timeout for the health check.
    pub health_timeout: Duration,

    /// Whether entitlement gating is active.
    pub integration: IntegrationMode,

    /// Directory name under the platform data dir where the session is persisted.
    /// `None` keeps the session in memory only.
    pub session_namespace: Option<&'static str>,

    /// Snapshots older than this are refreshed by `refresh_if_stale`.
    pub snapshot_max_age: Duration,

    /// Balance below which the UI should show a low-credit warning.
    pub low_credit_threshold: f64,
}

impl TollgateConfig {
    /// Configuration for a given backend with default endpoints and timeouts.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            app_name: "tollgate",
            user_agent_product: "tollgate",
            base_url: base_url.into(),
            endpoints: Endpoints::default(),
            timeout: Duration::from_secs(10),
            health_timeout: Duration::from_secs(5),
            integration: IntegrationMode::Enabled,
            session_namespace: None,
            snapshot_max_age: Duration::from_secs(30),
            low_credit_threshold: 2.0,
        }
    }

    /// Configuration with no backend; every action takes the development bypass.
    pub fn disabled() -> Self {
        Self {
            integration: IntegrationMode::Disabled,
            ..Self::new("http://localhost/")
        }
    }

    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), crate::TollgateError> {
        if self.integration == IntegrationMode::Enabled {
            if self.base_url.is_empty() {
                return Err(crate::TollgateError::Config(
                    "base_url cannot be empty".to_string(),
                ));
            }
            if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
                return Err(crate::TollgateError::Config(format!(
                    "base_url must be an http(s) URL, got {}",
                    self.base_url
                )));
            }
        }
        if self.timeout.is_zero() {
            return Err(crate::TollgateError::Config(
                "timeout must be non-zero".to_string(),
            ));
        }
        if self.session_namespace.is_some_and(str::is_empty) {
            return Err(crate::TollgateError::Config(
                "session_namespace cannot be empty".to_string(),
            ));
        }
        if !self.low_credit_threshold.is_finite() || self.low_credit_threshold < 0.0 {
            return Err(crate::TollgateError::Config(format!(
                "low_credit_threshold must be a non-negative number, got {}",
                self.low_credit_threshold
            )));
        }
        Ok(())
    }

    /// Absolute URL for an endpoint path.
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}
