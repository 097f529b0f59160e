//! Authenticated request pipeline
//!
//! Every call goes out with the current bearer token. A response the policy
//! classifies as an authorization failure sends the caller through the
//! refresh coordinator, then the request is replayed once with whatever
//! token the store holds at replay time. The attempt number is passed
//! explicitly, so a replay can never loop back into the coordinator.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderValue};
use session_auth::{AccessToken, CredentialStore, SessionApi};
use tracing::{debug, info, warn};
use transport::{RawResponse, RequestDescriptor, Transport, TransportError};

use crate::coordinator::{RefreshCoordinator, RefreshOutcome};
use crate::error::{ClientError, Result};
use crate::policy::AuthPolicy;
use crate::telemetry;

/// Which dispatch of a request this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Initial,
    Replay,
}

/// Tunables for `AuthClient`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on one `SessionApi::refresh` call.
    pub refresh_timeout: Duration,
    pub policy: AuthPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            refresh_timeout: Duration::from_secs(10),
            policy: AuthPolicy::default(),
        }
    }
}

/// HTTP client that transparently refreshes the access token.
pub struct AuthClient {
    transport: Arc<dyn Transport>,
    coordinator: RefreshCoordinator,
    policy: AuthPolicy,
}

impl AuthClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        session: Arc<dyn SessionApi>,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            coordinator: RefreshCoordinator::new(store, session, config.refresh_timeout),
            policy: config.policy,
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.coordinator.store()
    }

    /// Send a request, refreshing and replaying once on authorization failure.
    ///
    /// Non-authorization error statuses come back as `Ok` responses.
    pub async fn send(&self, request: RequestDescriptor) -> Result<RawResponse> {
        let token = self.store().get().await;
        match self.dispatch(&request, token.as_ref(), Attempt::Initial).await {
            Err(ClientError::AuthExpired { status }) => {
                debug!(%status, path = %request.path, "authorization rejected, refreshing");
                match self.coordinator.refresh(token.as_ref()).await {
                    RefreshOutcome::Refreshed => {}
                    RefreshOutcome::Failed(reason) => {
                        return Err(ClientError::RefreshFailed(reason));
                    }
                    RefreshOutcome::Cancelled => return Err(ClientError::Cancelled),
                }

                let token = self.store().get().await;
                let result = self.dispatch(&request, token.as_ref(), Attempt::Replay).await;
                telemetry::record_retry(match &result {
                    Ok(_) => "success",
                    Err(ClientError::RetryExhausted { .. }) => "rejected",
                    Err(_) => "error",
                });
                if let Err(ClientError::RetryExhausted { status }) = &result {
                    warn!(%status, path = %request.path, "request rejected after token refresh");
                }
                result
            }
            other => other,
        }
    }

    /// End the session: cancel parked requests, drop the token, and tell the
    /// server. A server-side logout failure is logged, not returned.
    pub async fn logout(&self) {
        let cancelled = self.coordinator.end_session().await;
        if let Err(e) = self.coordinator.session().logout().await {
            warn!(error = %e, "server-side logout failed");
        }
        info!(cancelled, "session logged out");
    }

    async fn dispatch(
        &self,
        request: &RequestDescriptor,
        token: Option<&AccessToken>,
        attempt: Attempt,
    ) -> Result<RawResponse> {
        let outgoing = authorize(request, token)?;
        let response = self.transport.send(&outgoing).await?;

        if self.policy.is_auth_failure(response.status) {
            return Err(match attempt {
                Attempt::Initial => ClientError::AuthExpired {
                    status: response.status,
                },
                Attempt::Replay => ClientError::RetryExhausted {
                    status: response.status,
                },
            });
        }
        Ok(response)
    }
}

/// Copy of `request` carrying `Authorization: Bearer <token>`.
///
/// Without a token the request goes out as the caller built it.
fn authorize(request: &RequestDescriptor, token: Option<&AccessToken>) -> Result<RequestDescriptor> {
    let mut outgoing = request.clone();
    if let Some(token) = token {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose())).map_err(|_| {
            TransportError::InvalidRequest("access token is not a valid header value".into())
        })?;
        value.set_sensitive(true);
        outgoing.headers.insert(AUTHORIZATION, value);
    }
    Ok(outgoing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RefreshState;
    use crate::testing::{FakeApi, FakeSession, Refresh, wait_for_queued};
    use reqwest::StatusCode;

    fn client(api: Arc<FakeApi>, session: Arc<FakeSession>, token: Option<&str>) -> AuthClient {
        let store = match token {
            Some(t) => CredentialStore::with_token(AccessToken::new(t)),
            None => CredentialStore::new(),
        };
        AuthClient::new(api, Arc::new(store), session, ClientConfig::default())
    }

    fn bearer(token: &str) -> Option<String> {
        Some(format!("Bearer {token}"))
    }

    #[tokio::test]
    async fn attaches_current_token() {
        let api = Arc::new(FakeApi::accepting(Some("token-1")));
        let session = Arc::new(FakeSession::new([]));
        let c = client(api.clone(), session.clone(), Some("token-1"));

        let response = c.send(RequestDescriptor::get("/rules")).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(api.seen(), vec![bearer("token-1")]);
        assert_eq!(session.refreshes(), 0);
    }

    #[tokio::test]
    async fn no_token_sends_without_authorization() {
        let api = Arc::new(FakeApi::accepting(None));
        let session = Arc::new(FakeSession::new([]));
        let c = client(api.clone(), session, None);

        let response = c.send(RequestDescriptor::get("/public")).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(api.seen(), vec![None]);
    }

    #[tokio::test]
    async fn token_replaces_caller_authorization_header() {
        let api = Arc::new(FakeApi::accepting(Some("token-1")));
        let session = Arc::new(FakeSession::new([]));
        let c = client(api.clone(), session, Some("token-1"));

        let request = RequestDescriptor::get("/rules")
            .with_header(AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        c.send(request).await.unwrap();

        assert_eq!(api.seen(), vec![bearer("token-1")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn five_expired_requests_share_one_refresh() {
        let api = Arc::new(FakeApi::accepting(Some("token-2")));
        let session = Arc::new(FakeSession::gated([Refresh::Token("token-2")]));
        let c = Arc::new(client(api.clone(), session.clone(), Some("token-1")));

        let mut handles = Vec::new();
        for i in 0..5 {
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                c.send(RequestDescriptor::get(format!("/rules/{i}"))).await
            }));
        }

        wait_for_queued(c.coordinator(), 4).await;
        session.release();

        for h in handles {
            let response = h.await.unwrap().unwrap();
            assert_eq!(response.status, StatusCode::OK);
            assert_eq!(response.text(), "Bearer token-2");
        }

        assert_eq!(session.refreshes(), 1, "single refresh for all five");
        let seen = api.seen();
        assert_eq!(seen.len(), 10, "five initial attempts plus five replays");
        assert_eq!(seen.iter().filter(|s| **s == bearer("token-1")).count(), 5);
        assert_eq!(seen.iter().filter(|s| **s == bearer("token-2")).count(), 5);
        assert_eq!(c.coordinator().state().await, RefreshState::Idle);
        assert_eq!(c.coordinator().queued().await, 0);
        assert_eq!(c.store().get().await.unwrap().expose(), "token-2");
    }

    #[tokio::test]
    async fn replay_rejected_is_retry_exhausted() {
        // API never accepts anything, even the refreshed token
        let api = Arc::new(FakeApi::accepting(None));
        let session = Arc::new(FakeSession::new([Refresh::Token("token-2")]));
        let c = client(api.clone(), session.clone(), Some("token-1"));

        let err = c.send(RequestDescriptor::get("/rules")).await.unwrap_err();

        assert!(
            matches!(err, ClientError::RetryExhausted { status } if status == StatusCode::UNAUTHORIZED),
            "got: {err:?}"
        );
        assert_eq!(api.calls(), 2, "one initial attempt, one replay");
        assert_eq!(session.refreshes(), 1, "replay must not re-enter the coordinator");
        assert_eq!(session.logouts(), 0);
    }

    #[tokio::test]
    async fn refresh_failure_reaches_every_caller_and_logs_out_once() {
        let api = Arc::new(FakeApi::accepting(Some("token-2")));
        let session = Arc::new(FakeSession::gated([Refresh::Fail]));
        let c = Arc::new(client(api.clone(), session.clone(), Some("token-1")));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                c.send(RequestDescriptor::get("/projects")).await
            }));
        }
        wait_for_queued(c.coordinator(), 3).await;
        session.release();

        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(matches!(err, ClientError::RefreshFailed(_)), "got: {err:?}");
        }
        assert_eq!(session.logouts(), 1);
        assert_eq!(api.calls(), 4, "no replays after a failed refresh");
        assert!(c.store().get().await.is_none());
    }

    #[tokio::test]
    async fn replay_reads_token_at_replay_time() {
        let api = Arc::new(FakeApi::accepting(Some("token-2")));
        let session = Arc::new(FakeSession::gated([Refresh::Token("token-2")]));
        let c = Arc::new(client(api.clone(), session.clone(), Some("token-1")));

        let leader = {
            let c = c.clone();
            tokio::spawn(async move { c.send(RequestDescriptor::get("/a")).await })
        };
        let follower = {
            let c = c.clone();
            tokio::spawn(async move { c.send(RequestDescriptor::get("/b")).await })
        };
        wait_for_queued(c.coordinator(), 1).await;

        // Both requests were parked holding token-1
        assert_eq!(api.seen(), vec![bearer("token-1"), bearer("token-1")]);
        session.release();

        assert_eq!(leader.await.unwrap().unwrap().text(), "Bearer token-2");
        assert_eq!(follower.await.unwrap().unwrap().text(), "Bearer token-2");
    }

    #[tokio::test]
    async fn later_rejection_starts_a_new_cycle() {
        let api = Arc::new(FakeApi::accepting(Some("token-2")));
        let session = Arc::new(FakeSession::new([Refresh::Token("token-2")]));
        let c = client(api.clone(), session.clone(), Some("token-1"));

        c.send(RequestDescriptor::get("/rules")).await.unwrap();
        assert_eq!(session.refreshes(), 1);

        // Server revokes token-2
        api.accept(Some("token-3"));
        session.push(Refresh::Token("token-3"));
        let response = c.send(RequestDescriptor::get("/rules")).await.unwrap();

        assert_eq!(response.text(), "Bearer token-3");
        assert_eq!(session.refreshes(), 2, "exactly one new refresh");
        assert_eq!(c.coordinator().state().await, RefreshState::Idle);
    }

    #[tokio::test]
    async fn transport_errors_bypass_coordinator() {
        let api = Arc::new(FakeApi::accepting(Some("token-1")));
        let session = Arc::new(FakeSession::new([]));
        let c = client(api.clone(), session.clone(), Some("token-1"));

        let err = c
            .send(RequestDescriptor::get("/network-down"))
            .await
            .unwrap_err();

        assert!(
            matches!(err, ClientError::Transport(TransportError::Connect(_))),
            "got: {err:?}"
        );
        assert_eq!(session.refreshes(), 0);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn server_errors_are_returned_as_responses() {
        let api = Arc::new(FakeApi::accepting(Some("token-1")));
        let session = Arc::new(FakeSession::new([]));
        let c = client(api.clone(), session.clone(), Some("token-1"));

        let response = c.send(RequestDescriptor::get("/boom")).await.unwrap();

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(session.refreshes(), 0);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn statuses_outside_policy_are_plain_responses() {
        let api = Arc::new(FakeApi::accepting(Some("token-2")));
        let session = Arc::new(FakeSession::new([Refresh::Token("token-2")]));
        let config = ClientConfig {
            policy: AuthPolicy::new([403]),
            ..ClientConfig::default()
        };
        let c = AuthClient::new(
            api.clone(),
            Arc::new(CredentialStore::with_token(AccessToken::new("token-1"))),
            session.clone(),
            config,
        );

        let response = c.send(RequestDescriptor::get("/rules")).await.unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(session.refreshes(), 0);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn logout_cancels_parked_requests() {
        let api = Arc::new(FakeApi::accepting(Some("token-2")));
        let session = Arc::new(FakeSession::gated([Refresh::Token("token-2")]));
        let c = Arc::new(client(api.clone(), session.clone(), Some("token-1")));

        let leader = {
            let c = c.clone();
            tokio::spawn(async move { c.send(RequestDescriptor::get("/a")).await })
        };
        let follower = {
            let c = c.clone();
            tokio::spawn(async move { c.send(RequestDescriptor::get("/b")).await })
        };
        wait_for_queued(c.coordinator(), 1).await;

        c.logout().await;
        let err = follower.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Cancelled), "got: {err:?}");

        session.release();
        let err = leader.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Cancelled), "got: {err:?}");

        assert!(c.store().get().await.is_none());
        assert_eq!(session.logouts(), 1, "only the explicit logout");
        assert_eq!(api.calls(), 2, "cancelled requests are not replayed");
    }

    async fn wait_for_calls(api: &FakeApi, n: usize) {
        for _ in 0..2000 {
            if api.calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {n} transport calls, have {}", api.calls());
    }

    #[tokio::test]
    async fn late_rejection_from_failed_wave_does_not_refresh_again() {
        let api = Arc::new(FakeApi::accepting(Some("token-2")));
        let session = Arc::new(FakeSession::new([Refresh::Fail, Refresh::Fail]));
        let c = Arc::new(client(api.clone(), session.clone(), Some("token-1")));

        let fast = {
            let c = c.clone();
            tokio::spawn(async move { c.send(RequestDescriptor::get("/rules")).await })
        };
        let slow = {
            let c = c.clone();
            tokio::spawn(async move { c.send(RequestDescriptor::get("/late/rules")).await })
        };

        let fast = fast.await.unwrap().unwrap_err();
        let slow = slow.await.unwrap().unwrap_err();

        assert!(matches!(fast, ClientError::RefreshFailed(_)), "got: {fast:?}");
        assert!(matches!(slow, ClientError::RefreshFailed(_)), "got: {slow:?}");
        assert_eq!(session.refreshes(), 1, "one refresh for the whole wave");
        assert_eq!(session.logouts(), 1, "one logout for the whole wave");
        assert_eq!(api.seen(), vec![bearer("token-1"), bearer("token-1")]);
    }

    #[tokio::test]
    async fn late_rejection_after_logout_does_not_revive_session() {
        let api = Arc::new(FakeApi::accepting(Some("token-2")));
        let session = Arc::new(FakeSession::new([Refresh::Token("token-2")]));
        let c = Arc::new(client(api.clone(), session.clone(), Some("token-1")));

        let pending = {
            let c = c.clone();
            tokio::spawn(async move { c.send(RequestDescriptor::get("/late/rules")).await })
        };
        wait_for_calls(&api, 1).await;
        c.logout().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Cancelled), "got: {err:?}");
        assert_eq!(session.refreshes(), 0);
        assert_eq!(session.logouts(), 1);
        assert!(c.store().get().await.is_none());
    }

    #[test]
    fn authorize_marks_header_sensitive() {
        let token = AccessToken::new("token-1");
        let outgoing = authorize(&RequestDescriptor::get("/rules"), Some(&token)).unwrap();
        let value = outgoing.headers.get(AUTHORIZATION).unwrap();
        assert!(value.is_sensitive());
        assert!(!format!("{:?}", outgoing.headers).contains("token-1"));
    }

    #[test]
    fn authorize_rejects_unencodable_token() {
        let token = AccessToken::new("bad\ntoken");
        let err = authorize(&RequestDescriptor::get("/rules"), Some(&token)).unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }
}
