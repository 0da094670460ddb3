//! HTTP surface: metrics exposition and health probes.
//!
//! Three endpoints, nothing else: `/metrics` for the scraper, `/healthz`
//! for liveness, `/readyz` for readiness (503 until the secret cache has
//! synced, so a scrape target is only advertised once the exported series
//! mean something).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::sync::watch;
use tracing::{error, info};

struct AppState {
    registry: Registry,
    ready: watch::Receiver<bool>,
}

/// Build the router; split out from [`serve`] for tests.
pub fn router(registry: Registry, ready: watch::Receiver<bool>) -> Router {
    let state = Arc::new(AppState { registry, ready });
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Serve until `shutdown` flips to `true`.
pub async fn serve(
    listen: SocketAddr,
    registry: Registry,
    ready: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(addr = %listen, "metrics server listening");

    axum::serve(listener, router(registry, ready))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("serving metrics endpoint")
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let encoder = TextEncoder::new();
    let families = state.registry.gather();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&families, &mut buffer) {
        error!(error = %err, "encoding metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type())], buffer).into_response()
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    if *state.ready.borrow() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "secret cache not synced").into_response()
    }
}
