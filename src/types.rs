//! Type definitions for authentication and the backend response envelope

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque user profile record as returned by `/auth/me`
pub type UserProfile = Value;

/// Snapshot of everything the credential store holds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Persisted under `user` to stay readable by older dashboard builds
    #[serde(default, rename = "user")]
    pub profile: Option<UserProfile>,
}

impl Credential {
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.profile.is_none()
    }
}

/// Standard backend response envelope: `{ success, message, data }`
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// Message to surface when the envelope reports a logical failure
    pub fn failure_message(&self) -> String {
        self.message.clone().unwrap_or_else(|| "request was not successful".to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

/// `data` of a successful login
#[derive(Debug, Clone, Deserialize)]
pub struct LoginData {
    pub user: UserProfile,
    pub access_token: String,
    pub refresh_token: String,
}

/// `data` of a successful refresh
///
/// The backend only issues a new access token today; a rotated refresh token
/// is honoured when present.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshData {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_without_data() {
        let envelope: ApiEnvelope<RefreshData> =
            serde_json::from_str(r#"{"success": false, "message": "token revoked"}"#).unwrap();
        assert!(!envelope.success);
        assert!(envelope.data.is_none());
        assert_eq!(envelope.failure_message(), "token revoked");
    }

    #[test]
    fn test_credential_persisted_shape() {
        let credential = Credential {
            access_token: Some("a".to_string()),
            refresh_token: None,
            profile: Some(serde_json::json!({"username": "alice"})),
        };
        let json = serde_json::to_value(&credential).unwrap();
        assert_eq!(json["user"]["username"], "alice");
        assert!(json["refresh_token"].is_null());

        let back: Credential = serde_json::from_str("{}").unwrap();
        assert!(back.is_empty());
    }
}
