//! Authenticated API client with transparent token refresh

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{SessionEvent, SERVER_ERROR_NOTICE};
use crate::refresh::{RefreshCoordinator, RefreshState};
use crate::token_store::TokenStore;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 64;

/// Description of a single API call, replayable after a token refresh
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
    pub(crate) timeout: Option<Duration>,
    /// Set once the request has been replayed after a refresh; a replayed
    /// request is never queued again.
    pub(crate) retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            timeout: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Override the client's default timeout for this call
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }
}

/// Classify a received response
///
/// `exempt` marks the login and refresh endpoints, whose 401 means bad
/// credentials rather than an expired session.
pub fn classify(status: StatusCode, body: Option<Value>, exempt: bool) -> Result<Value> {
    if status.is_success() {
        return Ok(body.unwrap_or(Value::Null));
    }

    let message = body
        .as_ref()
        .and_then(|body| body.get("message"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    Err(match status {
        StatusCode::UNAUTHORIZED if exempt => ClientError::AuthInvalid { message },
        StatusCode::UNAUTHORIZED => ClientError::AuthExpired { message },
        StatusCode::FORBIDDEN => ClientError::Forbidden { message },
        StatusCode::NOT_FOUND => ClientError::NotFound { message },
        StatusCode::TOO_MANY_REQUESTS => ClientError::RateLimited { message },
        status if status.is_server_error() => ClientError::ServerError {
            status: status.as_u16(),
            message,
        },
        status => ClientError::Rejected {
            status: status.as_u16(),
            message,
        },
    })
}

fn parse_body(bytes: &[u8]) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    Some(
        serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
    )
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) http: Client,
    pub(crate) token_store: TokenStore,
    pub(crate) coordinator: RefreshCoordinator,
    events: broadcast::Sender<SessionEvent>,
}

/// API client for the flow-monitor backend
///
/// Attaches the stored access token to every call. A 401 from an ordinary
/// endpoint triggers a single-flight token refresh, after which the request is
/// replayed once. Clones share the token store and refresh coordinator.
#[derive(Clone)]
pub struct ApiClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl ApiClient {
    /// Create a new API client
    ///
    /// Credentials are loaded from `config.credentials_path` when set,
    /// otherwise kept in memory.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let token_store = match &config.credentials_path {
            Some(path) => TokenStore::open(path),
            None => TokenStore::new(),
        };
        Self::with_store(config, token_store)
    }

    /// Create a client around an existing token store
    pub fn with_store(config: ClientConfig, token_store: TokenStore) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Configuration(format!("failed to build HTTP client: {e}")))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                http,
                token_store,
                coordinator: RefreshCoordinator::new(),
                events,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Get the token store (for advanced usage)
    pub fn token_store(&self) -> &TokenStore {
        &self.inner.token_store
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.inner.coordinator.state()
    }

    /// Subscribe to session events (expiry, notices, login/logout)
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Execute a request, refreshing the access token once if it has expired
    pub async fn execute(&self, request: ApiRequest) -> Result<Value> {
        let token = self.inner.token_store.access_token();
        let result = self.dispatch(&request, token.as_deref()).await;
        match result {
            Err(err) if err.is_auth_expired() && !request.retried => {
                debug!(method = %request.method, path = %request.path, "Access token rejected");
                self.recover(request, token).await
            }
            result => result,
        }
    }

    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let request = query
            .iter()
            .fold(ApiRequest::get(path), |request, (key, value)| request.query(*key, *value));
        self.execute(request).await
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        self.execute(ApiRequest::post(path, serde_json::to_value(body)?)).await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        self.execute(ApiRequest::put(path, serde_json::to_value(body)?)).await
    }

    pub async fn patch<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        self.execute(ApiRequest::patch(path, serde_json::to_value(body)?)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.execute(ApiRequest::delete(path)).await
    }

    /// Replay a request after a refresh, with whatever token is stored now
    pub(crate) async fn replay(&self, mut request: ApiRequest) -> Result<Value> {
        request.retried = true;
        let token = self.inner.token_store.access_token();
        self.dispatch(&request, token.as_deref()).await
    }

    /// Send one request and classify the response. Never refreshes.
    async fn dispatch(&self, request: &ApiRequest, token: Option<&str>) -> Result<Value> {
        let config = &self.inner.config;
        let timeout = request.timeout.unwrap_or(config.timeout);

        let mut builder = self
            .inner
            .http
            .request(request.method.clone(), config.url(&request.path));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::from_transport(e, timeout))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::from_transport(e, timeout))?;

        debug!(
            method = %request.method,
            path = %request.path,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            retried = request.retried,
            "API request completed"
        );

        let result = classify(
            status,
            parse_body(&bytes),
            config.endpoints.is_exempt(&request.path),
        );
        if let Err(ClientError::ServerError { message: None, .. }) = &result {
            self.emit(SessionEvent::Notice {
                message: SERVER_ERROR_NOTICE.to_string(),
            });
        }
        result
    }
}
