//! Single-flight token refresh
//!
//! The coordinator owns the `Idle`/`Refreshing` flag and the queue of parked
//! callers. Both live behind one mutex, so "check state, then become leader
//! or enqueue" is a single critical section even on a multi-threaded runtime.
//!
//! Transitions:
//! - Idle → Refreshing: first caller to report a rejected token (the leader)
//! - Refreshing → Idle: the leader's refresh resolves, success or failure
//!
//! The refresh call runs on its own task. If the leader's future is dropped
//! the refresh still completes and followers are still resolved.
//!
//! A logout bumps the session epoch: queued followers are resolved with
//! `Cancelled` at once, and a refresh that returns afterwards is discarded.
//!
//! A cycle that ends without a token (failure or logout) is remembered
//! together with the token it gave up on. A late rejection of that same
//! token gets the remembered outcome instead of starting another refresh.

use std::sync::Arc;
use std::time::Duration;

use session_auth::{AccessToken, CredentialStore, SessionApi};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use crate::telemetry;

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

impl RefreshState {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            RefreshState::Idle => "idle",
            RefreshState::Refreshing => "refreshing",
        }
    }
}

/// What every caller of one refresh cycle observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new token is in the credential store; replay reads it from there.
    Refreshed,
    /// The refresh failed; the session has been torn down.
    Failed(String),
    /// The session was logged out while the caller was waiting.
    Cancelled,
}

enum Role {
    Leader {
        epoch: u64,
        rejected: Option<AccessToken>,
    },
    Follower(oneshot::Receiver<RefreshOutcome>),
}

/// Last cycle that ended without a new token.
struct Ended {
    rejected: Option<AccessToken>,
    outcome: RefreshOutcome,
}

struct Inner {
    state: RefreshState,
    /// Parked followers in arrival order.
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    /// Incremented on logout; a refresh started under an older epoch is stale.
    epoch: u64,
    /// Cleared by the next successful refresh.
    ended: Option<Ended>,
}

struct Shared {
    inner: Mutex<Inner>,
    store: Arc<CredentialStore>,
    session: Arc<dyn SessionApi>,
    refresh_timeout: Duration,
}

/// Serializes concurrent refresh attempts into one call to `SessionApi::refresh`.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        session: Arc<dyn SessionApi>,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: RefreshState::Idle,
                    waiters: Vec::new(),
                    epoch: 0,
                    ended: None,
                }),
                store,
                session,
                refresh_timeout,
            }),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.shared.store
    }

    pub fn session(&self) -> &Arc<dyn SessionApi> {
        &self.shared.session
    }

    pub async fn state(&self) -> RefreshState {
        self.shared.inner.lock().await.state
    }

    /// Number of followers parked on the in-flight refresh.
    pub async fn queued(&self) -> usize {
        self.shared.inner.lock().await.waiters.len()
    }

    /// Obtain a token newer than `rejected`, the one the API just refused.
    ///
    /// While Idle, if the store already holds a different token (another
    /// cycle finished after this request was sent), returns `Refreshed`
    /// without calling the session API. If `rejected` is the token the last
    /// failed or cancelled cycle gave up on, returns that cycle's outcome.
    /// Otherwise the caller becomes the leader. While Refreshing, the caller
    /// is queued as a follower.
    pub async fn refresh(&self, rejected: Option<&AccessToken>) -> RefreshOutcome {
        let role = {
            let mut inner = self.shared.inner.lock().await;
            match inner.state {
                RefreshState::Refreshing => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);
                    debug!(queued = inner.waiters.len(), "refresh in flight, parked as follower");
                    Role::Follower(rx)
                }
                RefreshState::Idle => {
                    if let Some(current) = self.shared.store.get().await
                        && rejected != Some(&current)
                    {
                        debug!("token already replaced since request was sent");
                        return RefreshOutcome::Refreshed;
                    }
                    if let Some(ended) = &inner.ended
                        && ended.rejected.is_some()
                        && ended.rejected.as_ref() == rejected
                    {
                        debug!("token already given up on by an earlier cycle");
                        return ended.outcome.clone();
                    }
                    inner.state = RefreshState::Refreshing;
                    Role::Leader {
                        epoch: inner.epoch,
                        rejected: rejected.cloned(),
                    }
                }
            }
        };

        match role {
            // A dropped sender only happens if the refresh task died mid-flight
            Role::Follower(rx) => rx.await.unwrap_or(RefreshOutcome::Cancelled),
            Role::Leader { epoch, rejected } => {
                let shared = self.shared.clone();
                let given = rejected.clone();
                let task = tokio::spawn(async move { shared.run(epoch, given).await });
                match task.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let reason = format!("refresh task aborted: {e}");
                        self.shared.finish(epoch, rejected, Err(reason)).await
                    }
                }
            }
        }
    }

    /// End the session locally: drop the token, resolve every parked
    /// follower with `Cancelled` and return to Idle.
    ///
    /// Called on logout. Any refresh still in flight is orphaned: its result
    /// is discarded when it lands. Late rejections of the dropped token are
    /// answered with `Cancelled`. Returns how many followers were cancelled.
    pub async fn end_session(&self) -> usize {
        let mut inner = self.shared.inner.lock().await;
        inner.epoch += 1;
        inner.state = RefreshState::Idle;
        let rejected = self.shared.store.get().await;
        self.shared.store.clear().await;
        inner.ended = Some(Ended {
            rejected,
            outcome: RefreshOutcome::Cancelled,
        });
        let waiters = std::mem::take(&mut inner.waiters);
        let cancelled = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(RefreshOutcome::Cancelled);
        }
        if cancelled > 0 {
            info!(cancelled, "cancelled requests waiting on refresh");
        }
        cancelled
    }
}

impl Shared {
    /// Leader body: one call to the session API, bounded by `refresh_timeout`.
    async fn run(&self, epoch: u64, rejected: Option<AccessToken>) -> RefreshOutcome {
        info!("refreshing access token");
        let result = match tokio::time::timeout(self.refresh_timeout, self.session.refresh()).await
        {
            Ok(Ok(Some(token))) => Ok(token),
            Ok(Ok(None)) => Err("refresh returned no access token".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "refresh timed out after {}ms",
                self.refresh_timeout.as_millis()
            )),
        };
        self.finish(epoch, rejected, result).await
    }

    /// Publish a refresh result to the store and every follower.
    ///
    /// The token is stored before any follower is woken, followers are woken
    /// in arrival order, and the state returns to Idle in the same critical
    /// section. On failure the token is cleared here and `logout` is called
    /// once, after the lock is released.
    async fn finish(
        &self,
        epoch: u64,
        rejected: Option<AccessToken>,
        result: Result<AccessToken, String>,
    ) -> RefreshOutcome {
        let outcome = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                info!("session ended during refresh, discarding result");
                telemetry::record_refresh("cancelled");
                return RefreshOutcome::Cancelled;
            }

            let outcome = match result {
                Ok(token) => {
                    self.store.set(Some(token)).await;
                    inner.ended = None;
                    telemetry::record_refresh("success");
                    RefreshOutcome::Refreshed
                }
                Err(reason) => {
                    self.store.clear().await;
                    telemetry::record_refresh("failure");
                    let outcome = RefreshOutcome::Failed(reason);
                    inner.ended = Some(Ended {
                        rejected,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            };

            let waiters = std::mem::take(&mut inner.waiters);
            let followers = waiters.len();
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
            inner.state = RefreshState::Idle;

            match &outcome {
                RefreshOutcome::Failed(reason) => {
                    warn!(error = %reason, followers, "token refresh failed")
                }
                _ => info!(followers, "token refresh succeeded"),
            }
            outcome
        };

        if matches!(outcome, RefreshOutcome::Failed(_)) {
            if let Err(e) = self.session.logout().await {
                warn!(error = %e, "logout after failed refresh did not complete");
            }
        }
        outcome
    }
}
