//! Mock entitlement backend for integration testing
//!
//! Provides a wiremock server plus helpers for the profile and subscription
//! endpoints, and managers wired to it.

#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;
use tollgate::{EntitlementManager, SessionStore, TollgateConfig};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ACCESS_TOKEN: &str = "access-1";
pub const REFRESH_TOKEN: &str = "refresh-1";

/// Config pointing at the mock server.
pub fn config(server: &MockServer) -> TollgateConfig {
    let mut config = TollgateConfig::new(server.uri());
    config.app_name = "tollgate-tests/0.0.0";
    config
}

/// Session store already holding a token pair.
pub fn signed_in_store(access: &str) -> SessionStore {
    let store = SessionStore::in_memory();
    store
        .set_credentials(access, Some(REFRESH_TOKEN.to_string()))
        .unwrap();
    store
}

/// Manager with an authenticated in-memory session.
pub fn signed_in_manager(server: &MockServer) -> EntitlementManager {
    EntitlementManager::with_session(config(server), signed_in_store(ACCESS_TOKEN)).unwrap()
}

/// Session store shared with the test.
pub fn shared_store(access: &str) -> Arc<SessionStore> {
    Arc::new(signed_in_store(access))
}

/// `GET user/profile` answering with `credits`.
pub fn profile(credits: f64) -> Mock {
    Mock::given(method("GET"))
        .and(path("/user/profile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "Ada Lovelace",
            "email": "ada@example.com",
            "credits": credits,
        })))
}

/// `GET subscription/status` answering with `status`.
pub fn subscription(status: &str) -> Mock {
    Mock::given(method("GET"))
        .and(path("/subscription/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": status,
            "hasActiveSubscription": status == "active",
        })))
}

/// Mount profile and subscription mocks answering indefinitely.
pub async fn mount_entitlements(server: &MockServer, credits: f64, status: &str) {
    profile(credits).mount(server).await;
    subscription(status).mount(server).await;
}

/// Number of requests the server received for `path`.
pub async fn hits(server: &MockServer, request_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == request_path)
        .count()
}
