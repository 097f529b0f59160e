//! Rules API Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads the session cookie (and optionally a seed access token)
//! 2. Listens for dashboard requests on a local address
//! 3. Attaches the current bearer token to each request
//! 4. Refreshes the token once per expiry wave and replays rejected calls
//! 5. Proxies to the rules API and returns its responses verbatim

mod config;
mod metrics;
mod proxy;
mod service;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth_client::{AuthClient, AuthPolicy, ClientConfig};
use metrics_exporter_prometheus::PrometheusHandle;
use session_auth::{AccessToken, CredentialStore, HttpSessionApi};
use transport::ReqwestTransport;

use crate::config::Config;
use crate::proxy::ProxyState;
use crate::service::{DRAIN_TIMEOUT, ServiceMetrics};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` caps concurrently processed requests; excess requests
/// queue in the concurrency limit layer.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/session/logout", post(logout_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Wire transport, session endpoints and credential store into one client.
fn build_client(config: &Config) -> Result<AuthClient> {
    let api = &config.api;

    let transport = ReqwestTransport::new(
        reqwest::Client::new(),
        api.base_url.clone(),
        Duration::from_secs(api.timeout_secs),
    )
    .with_headers(config.headers.clone());

    let session = HttpSessionApi::connect(
        &api.base_url,
        &api.refresh_path,
        &api.logout_path,
        api.session_cookie.as_ref(),
        Duration::from_secs(api.timeout_secs),
    )
    .context("failed to build session client")?;

    let store = match &api.access_token {
        Some(token) => CredentialStore::with_token(AccessToken::from(token.clone())),
        None => CredentialStore::new(),
    };

    Ok(AuthClient::new(
        Arc::new(transport),
        Arc::new(store),
        Arc::new(session),
        ClientConfig {
            refresh_timeout: Duration::from_secs(api.refresh_timeout_secs),
            policy: AuthPolicy::new(api.auth_failure_statuses.iter().copied()),
        },
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting rules-api-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.gateway.listen_addr,
        base_url = %config.api.base_url,
        has_session_cookie = config.api.session_cookie.is_some(),
        has_access_token = config.api.access_token.is_some(),
        auth_failure_statuses = ?config.api.auth_failure_statuses,
        headers = config.headers.len(),
        "configuration loaded"
    );

    if config.api.session_cookie.is_none() {
        warn!("no session cookie configured; token refresh will fail until the server sets one");
    }

    let client = Arc::new(build_client(&config)?);
    let metrics = ServiceMetrics::new();

    let app_state = AppState {
        proxy: ProxyState {
            client,
            metrics: metrics.clone(),
        },
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.gateway.max_connections);

    let listen_addr = config.gateway.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    let in_flight = metrics.in_flight.clone();

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify the server to drain, then race it against the timer.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: gateway uptime plus the refresh coordinator's view of
/// the session.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = &state.proxy.metrics;
    let coordinator = state.proxy.client.coordinator();

    let body = serde_json::json!({
        "status": "healthy",
        "refresh_state": coordinator.state().await.label(),
        "queued_requests": coordinator.queued().await,
        "has_token": state.proxy.client.store().has_token().await,
        "uptime_seconds": metrics.started_at.elapsed().as_secs(),
        "requests_served": metrics.requests_total.load(Ordering::Relaxed),
        "errors_total": metrics.errors_total.load(Ordering::Relaxed),
    });

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// End the session: parked requests fail with a logged-out error, the token
/// is dropped and the server-side session is invalidated.
async fn logout_handler(State(state): State<AppState>) -> StatusCode {
    state.proxy.client.logout().await;
    StatusCode::NO_CONTENT
}

/// Catch-all handler that forwards every other request upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
