//! In-memory access token storage
//!
//! The store holds at most one access token for the application session.
//! Every read goes through the lock, so a token written by a refresh is
//! visible to the very next dispatch, including requests that were parked
//! while the refresh was running.

use common::Secret;
use tokio::sync::RwLock;
use tracing::debug;

/// Opaque bearer credential.
///
/// The client never inspects it: there is no expiry metadata, and it is
/// replaced wholesale on every successful refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken(Secret<String>);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Secret::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose()
    }
}

impl From<Secret<String>> for AccessToken {
    fn from(secret: Secret<String>) -> Self {
        Self(secret)
    }
}

/// Holder of the current access token.
#[derive(Debug, Default)]
pub struct CredentialStore {
    token: RwLock<Option<AccessToken>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with a token obtained outside the client (e.g. at login).
    pub fn with_token(token: AccessToken) -> Self {
        Self {
            token: RwLock::new(Some(token)),
        }
    }

    pub async fn get(&self) -> Option<AccessToken> {
        self.token.read().await.clone()
    }

    /// Replace the current token. `None` clears it.
    pub async fn set(&self, token: Option<AccessToken>) {
        let mut current = self.token.write().await;
        debug!(present = token.is_some(), "access token updated");
        *current = token;
    }

    pub async fn clear(&self) {
        self.set(None).await;
    }

    pub async fn has_token(&self) -> bool {
        self.token.read().await.is_some()
    }
}
