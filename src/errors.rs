//! Tollgate error types.

use thiserror::Error;

/// Errors that can occur while talking to the entitlement backend.
#[derive(Debug, Clone, Error)]
pub enum TollgateError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend unreachable or the call timed out. Never retried automatically.
    #[error("Network error: {0}")]
    Network(String),

    /// Refresh was rejected or a retried request was still unauthorized.
    /// The session has been cleared and the user must sign in again.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The caller has no credits left for a paid action.
    #[error("{}", .message.as_deref().unwrap_or("Insufficient credits"))]
    InsufficientCredits {
        /// Balance reported by the server (or the local cache when denied locally).
        remaining: f64,
        /// Server-provided message, if any.
        message: Option<String>,
    },

    /// Any other non-success response.
    #[error("{}", request_error_message(.status, .message.as_deref()))]
    Request {
        /// HTTP status code of the response.
        status: u16,
        /// Server-reported `error` or `message` field.
        message: Option<String>,
    },

    /// Response body could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Session persistence failed.
    #[error("Session I/O error: {0}")]
    SessionIO(String),
}

fn request_error_message(status: &u16, message: Option<&str>) -> String {
    match message {
        Some(message) => message.to_string(),
        None => format!("HTTP {}", status),
    }
}

/// What the UI should offer the user after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserPrompt {
    /// Offer a subscription upgrade.
    Upgrade,
    /// Ask the user to sign in again.
    Reauthenticate,
    /// Generic "something went wrong, try again".
    Retry,
}

impl TollgateError {
    /// Map this error to the prompt the UI layer should show.
    pub fn user_prompt(&self) -> UserPrompt {
        match self {
            TollgateError::InsufficientCredits { .. } => UserPrompt::Upgrade,
            TollgateError::Authentication(_) => UserPrompt::Reauthenticate,
            _ => UserPrompt::Retry,
        }
    }

    /// Whether the caller may retry the same call later.
    pub fn is_transient(&self) -> bool {
        matches!(self, TollgateError::Network(_))
    }
}
