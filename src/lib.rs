//! Flow-monitor API client
//!
//! A Rust client for the flow-monitor dashboard backend, with bearer-token
//! authentication, single-flight token refresh with ordered replay of
//! concurrent requests, persisted credentials and session lifecycle helpers.

pub mod api_client;
pub mod config;
pub mod error;
pub mod events;
pub mod refresh;
pub mod session;
pub mod token_store;
pub mod types;

pub use api_client::{classify, ApiClient, ApiRequest};
pub use config::{AuthEndpoints, ClientConfig};
pub use error::{ClientError, Result};
pub use events::SessionEvent;
pub use refresh::RefreshState;
pub use session::Session;
pub use token_store::{CredentialKey, TokenStore};
pub use types::{ChangePasswordRequest, Credential, LoginRequest, RegisterRequest, UserProfile};
