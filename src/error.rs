//! Error types for the flow-monitor client

use std::time::Duration;
use thiserror::Error;

/// Client error types
///
/// Every HTTP failure is classified into exactly one of these kinds. Only
/// [`ClientError::AuthExpired`] is intercepted by the client itself; every
/// other kind reaches the caller unchanged.
#[derive(Error, Debug)]
pub enum ClientError {
    /// No response reached the client
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// 401 from an ordinary endpoint, eligible for a token refresh
    #[error("access token expired{}", fmt_message(.message))]
    AuthExpired { message: Option<String> },

    /// 401 from the login or refresh endpoint
    #[error("invalid credentials{}", fmt_message(.message))]
    AuthInvalid { message: Option<String> },

    #[error("forbidden{}", fmt_message(.message))]
    Forbidden { message: Option<String> },

    #[error("not found{}", fmt_message(.message))]
    NotFound { message: Option<String> },

    #[error("rate limited{}", fmt_message(.message))]
    RateLimited { message: Option<String> },

    #[error("server error {status}{}", fmt_message(.message))]
    ServerError { status: u16, message: Option<String> },

    /// Any other non-success status (400, 409, 422, ...)
    #[error("request rejected with status {status}{}", fmt_message(.message))]
    Rejected { status: u16, message: Option<String> },

    #[error("no refresh token available")]
    RefreshTokenMissing,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("not logged in")]
    NotLoggedIn,

    #[error("login failed: {0}")]
    LoginFailed(String),

    /// 2xx response whose envelope reported `success: false`
    #[error("request unsuccessful: {0}")]
    Unsuccessful(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

fn fmt_message(message: &Option<String>) -> String {
    match message {
        Some(message) => format!(": {message}"),
        None => String::new(),
    }
}

impl ClientError {
    /// Classify a transport-level failure (no HTTP response available)
    pub(crate) fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ClientError::Timeout(timeout)
        } else {
            ClientError::Network(err)
        }
    }

    /// The message supplied by the server, if any
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ClientError::AuthExpired { message }
            | ClientError::AuthInvalid { message }
            | ClientError::Forbidden { message }
            | ClientError::NotFound { message }
            | ClientError::RateLimited { message }
            | ClientError::ServerError { message, .. }
            | ClientError::Rejected { message, .. } => message.as_deref(),
            ClientError::Unsuccessful(message) | ClientError::LoginFailed(message) => Some(message),
            _ => None,
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, ClientError::AuthExpired { .. })
    }

    /// Whether this failure ended the session as a side effect
    pub fn terminates_session(&self) -> bool {
        matches!(self, ClientError::RefreshTokenMissing | ClientError::RefreshFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
