//! In-memory fakes for the session and transport collaborators.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use session_auth::{AccessToken, SessionApi};
use tokio::sync::Semaphore;
use transport::{RawResponse, RequestDescriptor, Transport, TransportError};

use crate::coordinator::{RefreshCoordinator, RefreshState};

/// Scripted result of one `refresh()` call.
#[derive(Debug, Clone)]
pub(crate) enum Refresh {
    Token(&'static str),
    Empty,
    Fail,
    Hang,
}

/// Session whose refresh results are scripted and optionally gated.
pub(crate) struct FakeSession {
    script: Mutex<VecDeque<Refresh>>,
    gate: Option<Semaphore>,
    pub refresh_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
}

impl FakeSession {
    pub fn new(script: impl IntoIterator<Item = Refresh>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            gate: None,
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
        }
    }

    /// Refresh calls block until `release` is called.
    pub fn gated(script: impl IntoIterator<Item = Refresh>) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(script)
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn push(&self, next: Refresh) {
        self.script.lock().unwrap().push_back(next);
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }
}

impl SessionApi for FakeSession {
    fn refresh(
        &self,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<Option<AccessToken>>> + Send + '_>> {
        Box::pin(async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Refresh::Fail);
            match next {
                Refresh::Token(t) => Ok(Some(AccessToken::new(t))),
                Refresh::Empty => Ok(None),
                Refresh::Fail => Err(session_auth::Error::InvalidSession(
                    "refresh rejected (401)".into(),
                )),
                Refresh::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(None)
                }
            }
        })
    }

    fn logout(&self) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.logout_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// API that accepts exactly one bearer token and records every
/// Authorization header it sees.
///
/// Special paths: `/public` always 200, `/boom` always 500,
/// `/network-down` fails with a connection error. Paths under `/late/`
/// answer after 200ms.
pub(crate) struct FakeApi {
    accepted: Mutex<Option<String>>,
    seen: Mutex<Vec<Option<String>>>,
    pub calls: AtomicUsize,
}

impl FakeApi {
    pub fn accepting(token: Option<&str>) -> Self {
        Self {
            accepted: Mutex::new(token.map(str::to_owned)),
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn accept(&self, token: Option<&str>) {
        *self.accepted.lock().unwrap() = token.map(str::to_owned);
    }

    pub fn seen(&self) -> Vec<Option<String>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for FakeApi {
    fn send<'a>(
        &'a self,
        request: &'a RequestDescriptor,
    ) -> Pin<Box<dyn Future<Output = transport::Result<RawResponse>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let auth = request
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            self.seen.lock().unwrap().push(auth.clone());

            if request.path.starts_with("/late/") {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            match request.path.as_str() {
                "/network-down" => return Err(TransportError::Connect("refused".into())),
                "/boom" => return Ok(RawResponse::new(StatusCode::INTERNAL_SERVER_ERROR)),
                "/public" => return Ok(RawResponse::new(StatusCode::OK)),
                _ => {}
            }

            let expected = self
                .accepted
                .lock()
                .unwrap()
                .as_ref()
                .map(|t| format!("Bearer {t}"));
            if expected.is_some() && auth == expected {
                let mut response = RawResponse::new(StatusCode::OK);
                response.body = auth.unwrap_or_default().into_bytes().into();
                Ok(response)
            } else {
                Ok(RawResponse::new(StatusCode::UNAUTHORIZED))
            }
        })
    }
}

/// Poll until `n` followers are parked on the coordinator.
pub(crate) async fn wait_for_queued(coordinator: &RefreshCoordinator, n: usize) {
    for _ in 0..2000 {
        if coordinator.queued().await >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("expected {n} queued followers, have {}", coordinator.queued().await);
}

/// Poll until the coordinator reaches `state`.
pub(crate) async fn wait_for_state(coordinator: &RefreshCoordinator, state: RefreshState) {
    for _ in 0..2000 {
        if coordinator.state().await == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("coordinator never reached {state:?}");
}
