//! Refresh and logout against the session endpoints
//!
//! The long-lived session artifact is an httpOnly-style cookie. It is seeded
//! into a reqwest cookie jar once and sent implicitly on every session call;
//! `Set-Cookie` rotations from the server land in the same jar.
//!
//! A missing token in an otherwise successful refresh response is reported
//! as `Ok(None)`. The coordinator treats that the same as an error.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::credentials::AccessToken;
use crate::error::{Error, Result};

/// The two session capabilities the authenticated client consumes.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn SessionApi>`).
pub trait SessionApi: Send + Sync {
    /// Exchange the session artifact for a new access token.
    fn refresh(&self) -> Pin<Box<dyn Future<Output = Result<Option<AccessToken>>> + Send + '_>>;

    /// Invalidate the session server-side.
    fn logout(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Body of a successful refresh response.
///
/// Accepts the snake_case and camelCase spellings the API has used.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default, alias = "accessToken", alias = "token")]
    access_token: Option<String>,
}

/// `SessionApi` over HTTP.
pub struct HttpSessionApi {
    client: reqwest::Client,
    refresh_url: String,
    logout_url: String,
}

impl HttpSessionApi {
    pub fn new(
        client: reqwest::Client,
        refresh_url: impl Into<String>,
        logout_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            refresh_url: refresh_url.into(),
            logout_url: logout_url.into(),
        }
    }

    /// Build a client whose cookie jar holds the session cookie for `base_url`.
    ///
    /// `session_cookie` uses `Set-Cookie` syntax (`name=value; Path=/`). When
    /// absent, the jar starts empty and only cookies the server sets are sent.
    pub fn connect(
        base_url: &str,
        refresh_path: &str,
        logout_path: &str,
        session_cookie: Option<&Secret<String>>,
        timeout: Duration,
    ) -> Result<Self> {
        let url = reqwest::Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid base URL {base_url}: {e}")))?;

        let jar = Arc::new(reqwest::cookie::Jar::default());
        if let Some(cookie) = session_cookie {
            jar.add_cookie_str(cookie.expose(), &url);
            debug!(host = url.host_str().unwrap_or(""), "seeded session cookie");
        }

        let client = reqwest::Client::builder()
            .cookie_provider(jar)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("building session client: {e}")))?;

        let base = base_url.trim_end_matches('/');
        Ok(Self::new(
            client,
            format!("{base}{refresh_path}"),
            format!("{base}{logout_path}"),
        ))
    }

    async fn refresh_inner(&self) -> Result<Option<AccessToken>> {
        let response = self
            .client
            .post(&self.refresh_url)
            .send()
            .await
            .map_err(|e| Error::Http(format!("refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 401/403 means the session cookie is missing, expired or revoked
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::InvalidSession(format!(
                    "refresh rejected ({status}): {body}"
                )));
            }

            return Err(Error::TokenExchange(format!(
                "refresh endpoint returned {status}: {body}"
            )));
        }

        let parsed = response
            .json::<RefreshResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;

        Ok(parsed
            .access_token
            .filter(|t| !t.is_empty())
            .map(AccessToken::new))
    }

    async fn logout_inner(&self) -> Result<()> {
        let response = self
            .client
            .post(&self.logout_url)
            .send()
            .await
            .map_err(|e| Error::Http(format!("logout request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "logout endpoint returned non-success");
            return Err(Error::Logout(format!("logout endpoint returned {status}")));
        }
        info!("session logged out");
        Ok(())
    }
}

impl SessionApi for HttpSessionApi {
    fn refresh(&self) -> Pin<Box<dyn Future<Output = Result<Option<AccessToken>>> + Send + '_>> {
        Box::pin(self.refresh_inner())
    }

    fn logout(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.logout_inner())
    }
}
