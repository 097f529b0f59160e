//! reqwest-backed transport
//!
//! Joins the descriptor path onto the configured base URL, injects the
//! static headers from config and forwards everything else verbatim. The
//! Authorization header is owned by the authenticated client, so a static
//! injection can never overwrite it.

use crate::{RawResponse, RequestDescriptor, Result, Transport, TransportError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Header injection rule (name + value pair from config).
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

/// Transport that sends requests to `base_url` with a per-request timeout.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    headers: Vec<HeaderInjection>,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
            headers: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<HeaderInjection>) -> Self {
        self.headers = headers;
        self
    }

    /// Absolute URL for a descriptor path.
    pub fn url_for(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.is_empty() {
            return base.to_string();
        }
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    fn apply_injections(&self, headers: &mut HeaderMap) {
        for injection in &self.headers {
            let name = match HeaderName::from_str(&injection.name) {
                Ok(n) => n,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header name");
                    continue;
                }
            };
            if name == reqwest::header::AUTHORIZATION {
                warn!(header = %injection.name, "refusing to overwrite authorization header");
                continue;
            }
            let value = match HeaderValue::from_str(&injection.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header value");
                    continue;
                }
            };
            headers.insert(name, value);
        }
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(
        &'a self,
        request: &'a RequestDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.url_for(&request.path);
            let mut headers = request.headers.clone();
            self.apply_injections(&mut headers);

            debug!(method = %request.method, %url, "dispatching request");

            let response = self
                .client
                .request(request.method.clone(), &url)
                .headers(headers)
                .timeout(self.timeout)
                .body(request.body.clone())
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        TransportError::Timeout(format!(
                            "{url} after {}s: {e}",
                            self.timeout.as_secs()
                        ))
                    } else if e.is_connect() {
                        TransportError::Connect(format!("{url}: {e}"))
                    } else {
                        TransportError::Http(format!("{url}: {e}"))
                    }
                })?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(format!("reading body from {url}: {e}"))
                } else {
                    TransportError::Http(format!("reading body from {url}: {e}"))
                }
            })?;

            Ok(RawResponse {
                status,
                headers,
                body,
            })
        })
    }
}
