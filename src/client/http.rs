//! Authenticated reqwest transport for the entitlement backend.
//!
//! Attaches the session's bearer token, refreshes it once on 401 (shared
//! across concurrent callers, see [`crate::client::refresh`]), and classifies
//! every failure into a [`TollgateError`]. Response bodies are handed back
//! raw; callers decode them.

use crate::client::refresh::{RefreshCoordinator, RefreshOutcome, SessionPhase};
use crate::config::TollgateConfig;
use crate::events::{EntitlementEvent, EventBus};
use crate::protocol::models::{parse_body, ErrorBody, RefreshRequest, RefreshResponse};
use crate::session::store::{token_fingerprint, SessionStore};
use crate::TollgateError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outbound request description.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    method: Method,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    timeout: Option<Duration>,
    anonymous: bool,
}

impl RequestOptions {
    /// A GET request.
    pub fn get() -> Self {
        Self::with_method(Method::GET)
    }

    /// A POST request.
    pub fn post() -> Self {
        Self::with_method(Method::POST)
    }

    fn with_method(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            anonymous: false,
        }
    }

    /// Attach a JSON body.
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, TollgateError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| TollgateError::Protocol(format!("Failed to serialize: {}", e)))?;
        self.body = Some(bytes);
        Ok(self)
    }

    /// Add a caller header. An `Authorization` header is ignored.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Override the configured timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Send without credentials and without refresh-on-401.
    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }
}

/// Successful (2xx) backend response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,

    /// Raw response body.
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Get the body as a UTF-8 string.
    pub fn body_str(&self) -> Result<&str, TollgateError> {
        std::str::from_utf8(&self.body)
            .map_err(|e| TollgateError::Protocol(format!("Invalid UTF-8 in body: {}", e)))
    }

    /// Decode the body as JSON.
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, TollgateError> {
        parse_body(&self.body)
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client bound to one session store.
pub struct Transport {
    backend: Backend,
    refresh: RefreshCoordinator,
}

/// Everything one backend round trip needs. Cheap to clone, so the token
/// refresh can run on a task of its own.
#[derive(Clone)]
struct Backend {
    client: Client,
    config: TollgateConfig,
    session: Arc<SessionStore>,
    events: EventBus,
}

impl Transport {
    /// Create a transport from config.
    pub fn new(
        config: &TollgateConfig,
        session: Arc<SessionStore>,
        events: EventBus,
    ) -> Result<Self, TollgateError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(build_user_agent(config))
            .build()
            .map_err(|e| TollgateError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            backend: Backend {
                client,
                config: config.clone(),
                session,
                events,
            },
            refresh: RefreshCoordinator::new(),
        })
    }

    /// The session store this transport reads credentials from.
    pub fn session(&self) -> &Arc<SessionStore> {
        &self.backend.session
    }

    /// Current session phase.
    pub fn phase(&self) -> SessionPhase {
        self.refresh.phase(&self.backend.session)
    }

    /// Number of token refreshes this transport has started.
    pub fn refresh_count(&self) -> u64 {
        self.refresh.refresh_count()
    }

    /// Send a request to `endpoint` (relative to the base URL).
    ///
    /// # Errors
    /// - `Network` - unreachable or timed out; not retried
    /// - `Authentication` - refresh rejected or retry still unauthorized; session cleared
    /// - `InsufficientCredits` - HTTP 402
    /// - `Request` - any other non-2xx
    pub async fn send(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse, TollgateError> {
        let backend = &self.backend;
        if options.anonymous {
            let response = backend.dispatch(endpoint, &options, None).await?;
            return classify(response);
        }

        let sent_token = backend.session.access_credential();
        let response = backend
            .dispatch(endpoint, &options, sent_token.as_deref())
            .await?;
        if response.status != 401 {
            return classify(response);
        }

        debug!(
            endpoint,
            token = %sent_token.as_deref().map(token_fingerprint).unwrap_or_default(),
            "access token rejected, refreshing"
        );
        let refresher = backend.clone();
        let fresh = self
            .refresh
            .refresh_after(&backend.session, sent_token.as_deref(), move || {
                refresher.exchange_refresh_token()
            })
            .await?;

        let retried = backend.dispatch(endpoint, &options, Some(&fresh)).await?;
        if retried.status == 401 {
            backend.end_session("request still unauthorized after token refresh");
            return Err(TollgateError::Authentication(
                "Request unauthorized after token refresh".to_string(),
            ));
        }
        classify(retried)
    }
}

impl Backend {
    /// One HTTP round trip; no status interpretation.
    async fn dispatch(
        &self,
        endpoint: &str,
        options: &RequestOptions,
        token: Option<&str>,
    ) -> Result<ApiResponse, TollgateError> {
        let url = self.config.endpoint_url(endpoint);

        let mut headers = options.headers.clone();
        headers.remove(AUTHORIZATION);
        headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static("application/json"));
        if options.body.is_some() {
            headers
                .entry(CONTENT_TYPE)
                .or_insert(HeaderValue::from_static("application/json"));
        }

        let mut request = self
            .client
            .request(options.method.clone(), &url)
            .headers(headers);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = &options.body {
            request = request.body(body.clone());
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| network_error(endpoint, e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| network_error(endpoint, e))?
            .to_vec();

        debug!(endpoint, method = %options.method, status, "backend call completed");
        Ok(ApiResponse { status, body })
    }

    /// Exchange the refresh token for a new access token.
    async fn exchange_refresh_token(self) -> RefreshOutcome {
        let Some(refresh_token) = self.session.refresh_credential() else {
            self.end_session("no refresh token available");
            return RefreshOutcome::Rejected("No refresh token available".to_string());
        };

        let options = match RequestOptions::post().json(&RefreshRequest {
            refresh_token: &refresh_token,
        }) {
            Ok(options) => options,
            Err(e) => return RefreshOutcome::Unreachable(e.to_string()),
        };

        let response = match self
            .dispatch(self.config.endpoints.auth_refresh, &options, None)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "token refresh unreachable");
                return RefreshOutcome::Unreachable(e.to_string());
            }
        };

        if !response.is_success() {
            self.end_session("refresh token rejected");
            return RefreshOutcome::Rejected(format!(
                "Token refresh rejected (HTTP {})",
                response.status
            ));
        }

        match response.json::<RefreshResponse>() {
            Ok(RefreshResponse {
                access_token: Some(access_token),
                refresh_token,
            }) => {
                if let Err(e) = self
                    .session
                    .set_credentials(access_token.clone(), refresh_token)
                {
                    warn!(error = %e, "refreshed session could not be persisted");
                }
                info!(token = %token_fingerprint(&access_token), "access token refreshed");
                RefreshOutcome::Refreshed(access_token)
            }
            _ => {
                self.end_session("refresh response carried no access token");
                RefreshOutcome::Rejected("Token refresh returned no access token".to_string())
            }
        }
    }

    fn end_session(&self, reason: &str) {
        warn!(reason, "ending session");
        if let Err(e) = self.session.clear() {
            warn!(error = %e, "failed to clear persisted session");
        }
        self.events.publish(EntitlementEvent::SessionEnded);
    }
}

/// Map a non-2xx response to its error class.
fn classify(response: ApiResponse) -> Result<ApiResponse, TollgateError> {
    if response.is_success() {
        return Ok(response);
    }

    let body = ErrorBody::parse(&response.body);
    match response.status {
        401 => Err(TollgateError::Authentication(
            body.server_message()
                .unwrap_or_else(|| "Unauthorized".to_string()),
        )),
        402 => Err(TollgateError::InsufficientCredits {
            remaining: body.credits.unwrap_or(0.0),
            message: body.message,
        }),
        status => Err(TollgateError::Request {
            status,
            message: body.server_message(),
        }),
    }
}

fn network_error(endpoint: &str, error: reqwest::Error) -> TollgateError {
    if error.is_timeout() {
        TollgateError::Network(format!("Request to {} timed out", endpoint))
    } else {
        TollgateError::Network(format!("Request to {} failed: {}", endpoint, error))
    }
}

/// Build a User-Agent string from config.
///
/// Format: `<product>/tollgate-<version> <app>`
/// Example: `ebitdai-addin/tollgate-0.1.0 ebitdai/1.4.0`
pub fn build_user_agent(config: &TollgateConfig) -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!(
        "{}/tollgate-{} {}",
        config.user_agent_product, version, config.app_name
    )
}
