//! Session lifecycle: login, logout, bootstrap and profile refresh

use crate::api_client::{ApiClient, ApiRequest};
use crate::error::{ClientError, Result};
use crate::events::SessionEvent;
use crate::types::{
    ApiEnvelope, ChangePasswordRequest, Credential, LoginData, LoginRequest, RegisterRequest, UserProfile,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Unwrap a `{success, message, data}` envelope
fn into_data<T: DeserializeOwned>(payload: Value) -> Result<T> {
    let envelope: ApiEnvelope<T> = serde_json::from_value(payload)?;
    if !envelope.success {
        return Err(ClientError::Unsuccessful(envelope.failure_message()));
    }
    envelope
        .data
        .ok_or_else(|| ClientError::Unsuccessful("response carried no data".to_string()))
}

/// Reject envelopes reporting `success: false`, passing the payload through otherwise
fn ensure_success(payload: Value) -> Result<Value> {
    match payload.get("success").and_then(Value::as_bool) {
        Some(false) => {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request was not successful");
            Err(ClientError::Unsuccessful(message.to_string()))
        }
        _ => Ok(payload),
    }
}

/// User-facing session controller
///
/// Keeps the signed-in user's profile in memory on top of the client's token
/// store. When the client reports the session as expired the profile is dropped.
pub struct Session {
    client: ApiClient,
    user: RwLock<Option<UserProfile>>,
}

impl Session {
    /// Create a session controller
    ///
    /// Must be called from within a tokio runtime: a listener task is spawned
    /// that forgets the profile whenever the client ends the session.
    pub fn new(client: ApiClient) -> Arc<Self> {
        let session = Arc::new(Self {
            client,
            user: RwLock::new(None),
        });

        let events = session.client.subscribe();
        tokio::spawn(watch_expiry(Arc::downgrade(&session), events));

        session
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.user.read().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.user.read().is_some() && self.client.token_store().access_token().is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.user
            .read()
            .as_ref()
            .and_then(|user| user.get("role"))
            .and_then(Value::as_str)
            == Some("admin")
    }

    /// Log in and persist the returned tokens and profile
    ///
    /// The login endpoint never triggers a token refresh. A rejected login
    /// yields [`ClientError::LoginFailed`] carrying the server's message.
    pub async fn login(&self, credentials: &LoginRequest) -> Result<UserProfile> {
        let endpoints = &self.client.config().endpoints;
        let payload = match self.client.post(&endpoints.login, credentials).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(username = %credentials.username, error = %e, "Login failed");
                return Err(match e.server_message() {
                    Some(message) => ClientError::LoginFailed(message.to_string()),
                    None => e,
                });
            }
        };

        let data: LoginData = into_data(payload).map_err(|e| match e {
            ClientError::Unsuccessful(message) => ClientError::LoginFailed(message),
            other => other,
        })?;

        self.client.token_store().store(Credential {
            access_token: Some(data.access_token),
            refresh_token: Some(data.refresh_token),
            profile: Some(data.user.clone()),
        });
        *self.user.write() = Some(data.user.clone());

        info!(username = %credentials.username, "Logged in");
        self.client.emit(SessionEvent::LoggedIn);
        Ok(data.user)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<Value> {
        let endpoints = &self.client.config().endpoints;
        let payload = self.client.post(&endpoints.register, request).await?;
        ensure_success(payload)
    }

    /// End the session
    ///
    /// Remote invalidation is best-effort; local credentials are always
    /// cleared. Calling this without a session is a no-op that still succeeds.
    pub async fn logout(&self) {
        if self.client.token_store().access_token().is_some() {
            let endpoints = &self.client.config().endpoints;
            let request = ApiRequest::post(&endpoints.logout, serde_json::json!({}));
            if let Err(e) = self.client.execute(request).await {
                warn!(error = %e, "Logout request failed, clearing local session anyway");
            }
        }

        *self.user.write() = None;
        self.client.token_store().clear();
        debug!("Local session cleared");
        self.client.emit(SessionEvent::LoggedOut);
    }

    /// Reload the profile from `/auth/me`
    ///
    /// Expired access tokens are refreshed transparently by the client. If the
    /// call still fails the session is logged out.
    pub async fn fetch_user_info(&self) -> Result<UserProfile> {
        if self.client.token_store().access_token().is_none() {
            return Err(ClientError::NotLoggedIn);
        }

        let endpoints = &self.client.config().endpoints;
        let result = self
            .client
            .get(&endpoints.me, &[])
            .await
            .and_then(into_data::<UserProfile>);

        match result {
            Ok(profile) => {
                self.client.token_store().set_profile(profile.clone());
                *self.user.write() = Some(profile.clone());
                Ok(profile)
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch user info");
                self.logout().await;
                Err(e)
            }
        }
    }

    /// Restore the session from stored credentials and validate it
    ///
    /// Returns whether a valid session exists afterwards.
    pub async fn check_login_status(&self) -> bool {
        let credential = self.client.token_store().credential();
        let (Some(profile), Some(_)) = (credential.profile, credential.access_token) else {
            debug!("No complete stored session");
            self.logout().await;
            return false;
        };

        *self.user.write() = Some(profile);
        match self.fetch_user_info().await {
            Ok(_) => true,
            Err(e) => {
                // fetch_user_info already logged out
                debug!(error = %e, "Stored session is no longer valid");
                false
            }
        }
    }

    pub async fn update_user_info(&self, changes: &Value) -> Result<UserProfile> {
        let endpoints = &self.client.config().endpoints;
        let payload = self.client.put(&endpoints.me, changes).await?;
        let profile: UserProfile = into_data(payload)?;

        self.client.token_store().set_profile(profile.clone());
        *self.user.write() = Some(profile.clone());
        Ok(profile)
    }

    pub async fn change_password(&self, request: &ChangePasswordRequest) -> Result<Value> {
        let endpoints = &self.client.config().endpoints;
        let payload = self.client.post(&endpoints.change_password, request).await?;
        ensure_success(payload)
    }

    /// Delete the account server-side, then log out
    pub async fn delete_account(&self) -> Result<Value> {
        let endpoints = &self.client.config().endpoints;
        let payload = ensure_success(self.client.delete(&endpoints.delete_account).await?)?;
        self.logout().await;
        Ok(payload)
    }

    fn forget_user(&self) {
        *self.user.write() = None;
    }
}

async fn watch_expiry(session: Weak<Session>, mut events: tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Expired { reason }) => {
                let Some(session) = session.upgrade() else {
                    return;
                };
                info!(reason = %reason, "Session expired");
                session.forget_user();
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Session event listener lagged");
            }
            Err(RecvError::Closed) => return,
        }

        if session.strong_count() == 0 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_data() {
        let profile: Value = into_data(json!({"success": true, "data": {"id": 1}})).unwrap();
        assert_eq!(profile, json!({"id": 1}));

        let err = into_data::<Value>(json!({"success": false, "message": "用户不存在"})).unwrap_err();
        assert_eq!(err.server_message(), Some("用户不存在"));

        assert!(matches!(
            into_data::<Value>(json!({"success": true})),
            Err(ClientError::Unsuccessful(_))
        ));
    }

    #[test]
    fn test_ensure_success() {
        assert!(ensure_success(json!({"success": true, "message": "ok"})).is_ok());
        assert!(ensure_success(json!({"data": []})).is_ok());
        assert!(matches!(
            ensure_success(json!({"success": false, "message": "旧密码错误"})),
            Err(ClientError::Unsuccessful(message)) if message == "旧密码错误"
        ));
    }
}
