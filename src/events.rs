//! Session events broadcast to the UI layer.

use serde::{Deserialize, Serialize};

/// Generic notice shown when a server error carries no message of its own.
pub const SERVER_ERROR_NOTICE: &str = "Internal server error";

/// Events emitted by the client and session controller.
///
/// Subscribers are typically the UI shell: `Expired` is the cue to navigate to
/// the login entry point, `Notice` a message to toast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    LoggedIn,
    LoggedOut,
    /// A refresh cycle stored a new access token.
    TokenRefreshed,
    /// Credentials were cleared after an unrecoverable auth failure.
    Expired { reason: String },
    /// A user-visible message.
    Notice { message: String },
}

impl SessionEvent {
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }
}
