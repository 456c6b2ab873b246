//! Single-flight token refresh with ordered replay of waiting requests
//!
//! The first request to hit a qualifying 401 while the coordinator is idle
//! starts a refresh cycle. Requests that fail while the cycle runs are queued
//! and replayed in arrival order once a new access token is stored, each at
//! most once. If the refresh fails every waiter is rejected, credentials are
//! cleared and the session is reported as expired.

use crate::api_client::{ApiClient, ApiRequest};
use crate::error::{ClientError, Result};
use crate::events::SessionEvent;
use crate::token_store::TokenStore;
use crate::types::{ApiEnvelope, RefreshData};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Reject a refresh response with a non-success status
macro_rules! check_response {
    ($response:expr, $error_msg:expr) => {
        if !$response.status().is_success() {
            let status = $response.status();
            let text = $response.text().await.unwrap_or_default();
            return Err(ClientError::RefreshFailed(format!(
                "{} with status {}: {}",
                $error_msg, status, text
            )));
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

/// A request waiting on the outcome of a refresh cycle
pub(crate) struct PendingRequest {
    id: u64,
    request: ApiRequest,
    completion: oneshot::Sender<Result<Value>>,
}

impl PendingRequest {
    fn complete(self, result: Result<Value>) {
        if self.completion.send(result).is_err() {
            debug!(id = self.id, path = %self.request.path(), "Caller gone before completion");
        }
    }

    fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }
}

/// Outcome of offering a failed request to the coordinator
pub(crate) enum Admission {
    /// The caller started a cycle and must drive it
    Lead {
        origin: PendingRequest,
        receiver: oneshot::Receiver<Result<Value>>,
        refresh_token: String,
        generation: u64,
    },
    /// A cycle is already running; the caller waits its turn
    Queued {
        id: u64,
        receiver: oneshot::Receiver<Result<Value>>,
    },
    /// The token has been renewed since the request was sent
    Stale(ApiRequest),
    NoRefreshToken,
}

struct Shared {
    state: RefreshState,
    queue: VecDeque<PendingRequest>,
    next_id: u64,
}

/// Refresh state machine, one per client
///
/// State and queue live under one lock so that admission, draining and the
/// final transition back to idle are each atomic. The lock is never held
/// across an await.
pub(crate) struct RefreshCoordinator {
    shared: Mutex<Shared>,
}

impl RefreshCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            shared: Mutex::new(Shared {
                state: RefreshState::Idle,
                queue: VecDeque::new(),
                next_id: 0,
            }),
        }
    }

    pub(crate) fn state(&self) -> RefreshState {
        self.shared.lock().state
    }

    pub(crate) fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Admit a request that failed with a qualifying 401
    ///
    /// `sent_token` is the access token the request was dispatched with.
    pub(crate) fn admit(&self, request: ApiRequest, sent_token: Option<&str>, store: &TokenStore) -> Admission {
        let mut shared = self.shared.lock();
        let id = shared.next_id;
        shared.next_id += 1;

        match shared.state {
            RefreshState::Refreshing => {
                let (completion, receiver) = oneshot::channel();
                shared.queue.push_back(PendingRequest { id, request, completion });
                Admission::Queued { id, receiver }
            }
            RefreshState::Idle => {
                let current = store.access_token();
                if current.is_some() && current.as_deref() != sent_token {
                    return Admission::Stale(request);
                }

                let generation = store.generation();
                let Some(refresh_token) = store.refresh_token() else {
                    return Admission::NoRefreshToken;
                };

                shared.state = RefreshState::Refreshing;
                let (completion, receiver) = oneshot::channel();
                Admission::Lead {
                    origin: PendingRequest { id, request, completion },
                    receiver,
                    refresh_token,
                    generation,
                }
            }
        }
    }

    /// Pop the next queued request, or return to idle when the queue is empty
    fn next_or_idle(&self) -> Option<PendingRequest> {
        let mut shared = self.shared.lock();
        let next = shared.queue.pop_front();
        if next.is_none() {
            shared.state = RefreshState::Idle;
        }
        next
    }

    /// Take every queued request and return to idle
    fn abort(&self) -> VecDeque<PendingRequest> {
        let mut shared = self.shared.lock();
        shared.state = RefreshState::Idle;
        std::mem::take(&mut shared.queue)
    }

    /// Reject the originating request and everything queued, returning to idle
    fn reject_all(&self, origin: Option<PendingRequest>, reason: &str) -> usize {
        let queued = self.abort();
        let rejected = queued.len() + usize::from(origin.is_some());
        for pending in origin.into_iter().chain(queued) {
            pending.complete(Err(ClientError::RefreshFailed(reason.to_string())));
        }
        rejected
    }

    /// Drop a queued request whose caller stopped waiting
    fn withdraw(&self, id: u64) -> bool {
        let mut shared = self.shared.lock();
        let before = shared.queue.len();
        shared.queue.retain(|pending| pending.id != id);
        shared.queue.len() != before
    }
}

/// Returns the coordinator to idle if a refresh cycle unwinds before finishing
struct CycleGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    armed: bool,
}

impl<'a> CycleGuard<'a> {
    fn new(coordinator: &'a RefreshCoordinator) -> Self {
        Self {
            coordinator,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let rejected = self.coordinator.reject_all(None, "refresh cycle aborted");
            warn!(rejected, "Refresh cycle ended abnormally, coordinator reset");
        }
    }
}

impl ApiClient {
    /// Recover from a qualifying 401 on `request`
    pub(crate) async fn recover(&self, request: ApiRequest, sent_token: Option<String>) -> Result<Value> {
        let inner = &self.inner;
        let timeout = request.timeout.unwrap_or(inner.config.timeout);

        match inner
            .coordinator
            .admit(request, sent_token.as_deref(), &inner.token_store)
        {
            Admission::Lead {
                origin,
                receiver,
                refresh_token,
                generation,
            } => {
                debug!(path = %origin.request.path(), "Starting token refresh");
                // The cycle runs detached so a caller that gives up cannot
                // leave the coordinator stuck in Refreshing.
                tokio::spawn(self.clone().run_refresh_cycle(origin, refresh_token, generation));
                receiver.await.unwrap_or_else(|_| {
                    Err(ClientError::RefreshFailed("refresh cycle ended without a result".to_string()))
                })
            }
            Admission::Queued { id, receiver } => {
                debug!(id, queued = inner.coordinator.queued(), "Waiting for in-flight token refresh");
                match tokio::time::timeout(timeout, receiver).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(ClientError::RefreshFailed(
                        "refresh cycle ended without a result".to_string(),
                    )),
                    Err(_) => {
                        inner.coordinator.withdraw(id);
                        warn!(id, timeout_ms = timeout.as_millis() as u64, "Gave up waiting for token refresh");
                        Err(ClientError::Timeout(timeout))
                    }
                }
            }
            Admission::Stale(request) => {
                debug!(path = %request.path(), "Access token already renewed, replaying");
                self.replay(request).await
            }
            Admission::NoRefreshToken => {
                // Only the request that actually ends the session reports it
                if inner.token_store.clear() {
                    warn!("Access token rejected and no refresh token stored, ending session");
                    self.emit(SessionEvent::Expired {
                        reason: ClientError::RefreshTokenMissing.to_string(),
                    });
                }
                Err(ClientError::RefreshTokenMissing)
            }
        }
    }

    /// Refresh once, then replay the originating request and drain the queue,
    /// or reject everything if the refresh fails.
    ///
    /// `generation` is the credential session the refresh was started for. If
    /// the user logs out or back in meanwhile, the outcome is discarded.
    async fn run_refresh_cycle(self, origin: PendingRequest, refresh_token: String, generation: u64) {
        let inner = &self.inner;
        let guard = CycleGuard::new(&inner.coordinator);

        let refreshed = self.request_refresh(&refresh_token).await.and_then(|data| {
            if inner
                .token_store
                .apply_refresh(generation, data.access_token, data.refresh_token)
            {
                Ok(())
            } else {
                Err(ClientError::RefreshFailed("session ended during token refresh".to_string()))
            }
        });

        match refreshed {
            Ok(()) => {
                info!("Access token refreshed successfully");
                self.emit(SessionEvent::TokenRefreshed);

                let mut replayed = 0usize;
                let mut pending = Some(origin);
                while let Some(next) = pending {
                    if next.is_abandoned() {
                        debug!(id = next.id, "Skipping abandoned request");
                    } else {
                        let result = self.replay(next.request.clone()).await;
                        next.complete(result);
                        replayed += 1;
                    }
                    pending = inner.coordinator.next_or_idle();
                }
                debug!(replayed, "Refresh cycle finished");
            }
            Err(e) => {
                let reason = match e {
                    ClientError::RefreshFailed(reason) => reason,
                    other => other.to_string(),
                };
                warn!(error = %reason, "Token refresh failed");

                // A session replaced since the refresh started is left alone
                let ended = inner.token_store.clear_generation(generation);
                let rejected = inner.coordinator.reject_all(Some(origin), &reason);
                if ended {
                    self.emit(SessionEvent::Expired { reason });
                }
                debug!(rejected, ended, "Rejected requests waiting on refresh");
            }
        }

        guard.disarm();
    }

    /// Call the refresh endpoint directly, bypassing interception so that its
    /// own 401 can never re-enter the coordinator.
    async fn request_refresh(&self, refresh_token: &str) -> Result<RefreshData> {
        let config = &self.inner.config;
        let url = config.url(&config.endpoints.refresh);

        let response = self
            .inner
            .http
            .post(&url)
            .bearer_auth(refresh_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| ClientError::RefreshFailed(e.to_string()))?;

        check_response!(response, "Refresh request failed");

        let envelope: ApiEnvelope<RefreshData> = response
            .json()
            .await
            .map_err(|e| ClientError::RefreshFailed(format!("invalid refresh response: {e}")))?;

        if !envelope.success {
            return Err(ClientError::RefreshFailed(envelope.failure_message()));
        }
        envelope
            .data
            .ok_or_else(|| ClientError::RefreshFailed("refresh response carried no access token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(access: Option<&str>, refresh: Option<&str>) -> TokenStore {
        let store = TokenStore::new();
        if let Some(token) = access {
            store.set_access_token(token);
        }
        if let Some(token) = refresh {
            store.set_refresh_token(token);
        }
        store
    }

    #[test]
    fn test_first_failure_leads() {
        let coordinator = RefreshCoordinator::new();
        let store = store_with(Some("old"), Some("r1"));

        match coordinator.admit(ApiRequest::get("/a"), Some("old"), &store) {
            Admission::Lead { refresh_token, origin, .. } => {
                assert_eq!(refresh_token, "r1");
                assert_eq!(origin.request.path(), "/a");
            }
            _ => panic!("expected to lead"),
        }
        assert_eq!(coordinator.state(), RefreshState::Refreshing);
        assert_eq!(coordinator.queued(), 0);
    }

    #[test]
    fn test_failures_during_refresh_are_queued_in_order() {
        let coordinator = RefreshCoordinator::new();
        let store = store_with(Some("old"), Some("r1"));

        let _lead = coordinator.admit(ApiRequest::get("/a"), Some("old"), &store);
        for path in ["/b", "/c"] {
            assert!(matches!(
                coordinator.admit(ApiRequest::get(path), Some("old"), &store),
                Admission::Queued { .. }
            ));
        }
        assert_eq!(coordinator.queued(), 2);

        assert_eq!(coordinator.next_or_idle().unwrap().request.path(), "/b");
        assert_eq!(coordinator.next_or_idle().unwrap().request.path(), "/c");
        assert_eq!(coordinator.state(), RefreshState::Refreshing);
        assert!(coordinator.next_or_idle().is_none());
        assert_eq!(coordinator.state(), RefreshState::Idle);
    }

    #[test]
    fn test_missing_refresh_token_stays_idle() {
        let coordinator = RefreshCoordinator::new();
        let store = store_with(Some("old"), None);

        assert!(matches!(
            coordinator.admit(ApiRequest::get("/a"), Some("old"), &store),
            Admission::NoRefreshToken
        ));
        assert_eq!(coordinator.state(), RefreshState::Idle);
    }

    #[test]
    fn test_stale_token_skips_refresh() {
        let coordinator = RefreshCoordinator::new();
        let store = store_with(Some("new"), Some("r1"));

        assert!(matches!(
            coordinator.admit(ApiRequest::get("/a"), Some("old"), &store),
            Admission::Stale(_)
        ));
        assert_eq!(coordinator.state(), RefreshState::Idle);
    }

    #[test]
    fn test_abort_takes_queue_and_goes_idle() {
        let coordinator = RefreshCoordinator::new();
        let store = store_with(Some("old"), Some("r1"));

        let _lead = coordinator.admit(ApiRequest::get("/a"), Some("old"), &store);
        let _b = coordinator.admit(ApiRequest::get("/b"), Some("old"), &store);
        let _c = coordinator.admit(ApiRequest::get("/c"), Some("old"), &store);

        let queued = coordinator.abort();
        assert_eq!(queued.len(), 2);
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert_eq!(coordinator.queued(), 0);
    }

    #[test]
    fn test_withdraw_removes_only_that_request() {
        let coordinator = RefreshCoordinator::new();
        let store = store_with(Some("old"), Some("r1"));

        let _lead = coordinator.admit(ApiRequest::get("/a"), Some("old"), &store);
        let id = match coordinator.admit(ApiRequest::get("/b"), Some("old"), &store) {
            Admission::Queued { id, .. } => id,
            _ => panic!("expected to queue"),
        };
        let _c = coordinator.admit(ApiRequest::get("/c"), Some("old"), &store);

        assert!(coordinator.withdraw(id));
        assert!(!coordinator.withdraw(id));
        assert_eq!(coordinator.next_or_idle().unwrap().request.path(), "/c");
    }

    #[test]
    fn test_lead_records_session_generation() {
        let coordinator = RefreshCoordinator::new();
        let store = store_with(Some("old"), Some("r1"));
        store.clear();
        store.set_access_token("old");
        store.set_refresh_token("r1");

        match coordinator.admit(ApiRequest::get("/a"), Some("old"), &store) {
            Admission::Lead { generation, .. } => assert_eq!(generation, store.generation()),
            _ => panic!("expected to lead"),
        }
    }

    #[test]
    fn test_reject_all_fails_every_waiter() {
        let coordinator = RefreshCoordinator::new();
        let store = store_with(Some("old"), Some("r1"));

        let Admission::Lead { origin, mut receiver, .. } =
            coordinator.admit(ApiRequest::get("/a"), Some("old"), &store)
        else {
            panic!("expected to lead");
        };
        let Admission::Queued { receiver: mut queued, .. } =
            coordinator.admit(ApiRequest::get("/b"), Some("old"), &store)
        else {
            panic!("expected to queue");
        };

        assert_eq!(coordinator.reject_all(Some(origin), "revoked"), 2);
        assert_eq!(coordinator.state(), RefreshState::Idle);
        for result in [receiver.try_recv().unwrap(), queued.try_recv().unwrap()] {
            assert!(matches!(result, Err(ClientError::RefreshFailed(reason)) if reason == "revoked"));
        }
    }

    #[test]
    fn test_unfinished_cycle_returns_to_idle() {
        let coordinator = RefreshCoordinator::new();
        let store = store_with(Some("old"), Some("r1"));

        let _lead = coordinator.admit(ApiRequest::get("/a"), Some("old"), &store);
        let Admission::Queued { mut receiver, .. } =
            coordinator.admit(ApiRequest::get("/b"), Some("old"), &store)
        else {
            panic!("expected to queue");
        };

        // Dropped while still armed, as when the cycle panics mid-drain
        drop(CycleGuard::new(&coordinator));

        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert_eq!(coordinator.queued(), 0);
        assert!(matches!(receiver.try_recv().unwrap(), Err(ClientError::RefreshFailed(_))));
    }

    #[test]
    fn test_finished_cycle_leaves_coordinator_alone() {
        let coordinator = RefreshCoordinator::new();
        let store = store_with(Some("old"), Some("r1"));

        let _lead = coordinator.admit(ApiRequest::get("/a"), Some("old"), &store);
        CycleGuard::new(&coordinator).disarm();

        assert_eq!(coordinator.state(), RefreshState::Refreshing);
    }

    #[test]
    fn test_dropped_receiver_marks_abandoned() {
        let coordinator = RefreshCoordinator::new();
        let store = store_with(Some("old"), Some("r1"));

        let _lead = coordinator.admit(ApiRequest::get("/a"), Some("old"), &store);
        let queued = coordinator.admit(ApiRequest::get("/b"), Some("old"), &store);
        drop(queued);

        assert!(coordinator.next_or_idle().unwrap().is_abandoned());
    }
}
