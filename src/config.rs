//! Client configuration

use crate::error::{ClientError, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:5000/api";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const ENV_BASE_URL: &str = "FLOWMON_API_URL";
const ENV_TIMEOUT_SECS: &str = "FLOWMON_TIMEOUT_SECS";
const ENV_CREDENTIALS: &str = "FLOWMON_CREDENTIALS";

/// Paths of the authentication endpoints, relative to the base URL
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    pub login: String,
    pub refresh: String,
    pub logout: String,
    pub me: String,
    pub register: String,
    pub change_password: String,
    pub delete_account: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            login: "/auth/login".to_string(),
            refresh: "/auth/refresh".to_string(),
            logout: "/auth/logout".to_string(),
            me: "/auth/me".to_string(),
            register: "/auth/register".to_string(),
            change_password: "/auth/change-password".to_string(),
            delete_account: "/auth/delete-account".to_string(),
        }
    }
}

impl AuthEndpoints {
    /// Login and refresh answer 401 for bad credentials, never for an expired
    /// session, so they must not trigger a refresh.
    pub fn is_exempt(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        path == self.login || path == self.refresh
    }
}

/// Configuration for the API client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL every request path is appended to, e.g. `https://monitor.example/api`
    pub base_url: String,

    /// Default per-request timeout. Also bounds how long a request may wait
    /// in the refresh queue.
    /// Default: 30 seconds
    pub timeout: Duration,

    pub endpoints: AuthEndpoints,

    /// Where credentials are persisted between runs. `None` keeps them in memory.
    pub credentials_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            endpoints: AuthEndpoints::default(),
            credentials_path: None,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Build a configuration from `FLOWMON_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(base_url) = lookup(ENV_BASE_URL) {
            config.base_url = base_url;
        }

        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                ClientError::Configuration(format!("{ENV_TIMEOUT_SECS} must be a number of seconds, got {raw:?}"))
            })?;
            if secs == 0 {
                return Err(ClientError::Configuration(format!("{ENV_TIMEOUT_SECS} must be positive")));
            }
            config.timeout = Duration::from_secs(secs);
        }

        if let Some(path) = lookup(ENV_CREDENTIALS) {
            config.credentials_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ClientError::Configuration(format!(
                "base URL must start with http:// or https://, got {:?}",
                self.base_url
            )));
        }
        Ok(())
    }

    /// Join the base URL and a request path
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_url_joining() {
        let config = ClientConfig::new("http://localhost:5000/api/");
        assert_eq!(config.url("/flow/query/42"), "http://localhost:5000/api/flow/query/42");
        assert_eq!(config.url("auth/me"), "http://localhost:5000/api/auth/me");
    }

    #[test]
    fn test_exempt_paths() {
        let endpoints = AuthEndpoints::default();
        assert!(endpoints.is_exempt("/auth/login"));
        assert!(endpoints.is_exempt("/auth/refresh?x=1"));
        assert!(!endpoints.is_exempt("/auth/me"));
        assert!(!endpoints.is_exempt("/auth/logout"));
    }

    #[test]
    fn test_from_env() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ENV_BASE_URL, "https://monitor.example/api"),
            (ENV_TIMEOUT_SECS, "5"),
            (ENV_CREDENTIALS, "/tmp/flowmon.json"),
        ]))
        .unwrap();

        assert_eq!(config.base_url, "https://monitor.example/api");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.credentials_path, Some(PathBuf::from("/tmp/flowmon.json")));
    }

    #[test]
    fn test_from_env_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert!(config.credentials_path.is_none());
    }

    #[test]
    fn test_from_env_rejects_bad_values() {
        let err = ClientConfig::from_lookup(lookup(&[(ENV_TIMEOUT_SECS, "soon")])).unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));

        let err = ClientConfig::from_lookup(lookup(&[(ENV_BASE_URL, "localhost:5000")])).unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
    }
}
