//! HTTP forwarding through the authenticated client
//!
//! Receives inbound requests, strips hop-by-hop headers and any client
//! supplied Authorization, and sends them upstream via `AuthClient`. The
//! upstream response is returned verbatim (including error status codes);
//! only failures the client could not resolve become gateway error bodies.

use auth_client::{AuthClient, ClientError};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use transport::{RequestDescriptor, TransportError};

use crate::metrics;
use crate::service::ServiceMetrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: Arc<AuthClient>,
    pub metrics: ServiceMetrics,
}

/// JSON error body: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, error_type: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Status and error type reported to the caller for a failed request.
fn classify(err: &ClientError) -> (StatusCode, &'static str) {
    match err {
        ClientError::RefreshFailed(_) => (StatusCode::UNAUTHORIZED, "session_expired"),
        ClientError::Cancelled => (StatusCode::UNAUTHORIZED, "session_logged_out"),
        ClientError::RetryExhausted { .. } | ClientError::AuthExpired { .. } => {
            (StatusCode::UNAUTHORIZED, "authorization_rejected")
        }
        ClientError::Transport(TransportError::Timeout(_)) => {
            (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout")
        }
        ClientError::Transport(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
    }
}

/// Forward an inbound request upstream through the authenticated client.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let _in_flight = state.metrics.track();
    let started = Instant::now();
    let method = request.method().clone();

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut descriptor = RequestDescriptor::new(method.clone(), path);
    descriptor.headers = forwardable_headers(request.headers());

    descriptor.body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            let response = error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
            );
            metrics::record_request(400, method.as_str(), started.elapsed().as_secs_f64());
            return response;
        }
    };

    let response = match state.client.send(descriptor).await {
        Ok(upstream) => {
            let mut response = Response::builder().status(upstream.status);
            for (name, value) in &upstream.headers {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            response
                .body(axum::body::Body::from(upstream.body))
                .unwrap_or_else(|e| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "gateway_error",
                        &format!("response build error: {e}"),
                        &request_id,
                    )
                })
        }
        Err(e) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            metrics::record_client_error(e.kind());
            let (status, error_type) = classify(&e);
            if e.is_session_lost() {
                info!(error = %e, "session no longer authenticated");
            } else {
                warn!(error = %e, "upstream request failed");
            }
            error_response(status, error_type, &e.to_string(), &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Inbound headers minus hop-by-hop, Host and Authorization.
///
/// Host is recomputed by the outbound client for the upstream URL. The
/// bearer token is owned by `AuthClient`, so a caller cannot smuggle its own.
fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str()) || name == header::HOST || name == header::AUTHORIZATION {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
