//! Inbound GitHub webhook listener.
//!
//! Serves three routes on a standalone axum server:
//! - `GET /` reports which host answered.
//! - `GET|HEAD /health` is a fixed liveness probe.
//! - `POST /webhook/github` verifies the HMAC-SHA256 signature, filters the
//!   delivery, and queues a deploy marker without waiting for it.

use crate::config::{Config, WebhookSecret};
use crate::deploy::{self, DeployRunner, JobScheduler};
use crate::dispatch::{DispatchOutcome, Dispatcher, PayloadError};
use crate::signature::SignatureVerifier;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

const EVENT_HEADER: &str = "x-github-event";
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

// ── Shared state ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WebhookState {
    verifier: SignatureVerifier,
    dispatcher: Dispatcher,
    identity: String,
}

impl WebhookState {
    pub fn new(verifier: SignatureVerifier, scheduler: Arc<dyn JobScheduler>, identity: String) -> Self {
        Self {
            verifier,
            dispatcher: Dispatcher::new(scheduler),
            identity,
        }
    }
}

/// Text served on `GET /`: the hostname, optionally behind an environment banner.
pub fn host_identity(banner: Option<&str>) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|e| {
            tracing::warn!("webhook: cannot read hostname: {e}");
            "unknown".to_string()
        });
    match banner {
        Some(banner) => format!("{banner} - {host}"),
        None => host,
    }
}

// ── Route handlers ────────────────────────────────────────────────────────────

/// GET /: identify the instance that served the request.
async fn handle_root(State(state): State<Arc<WebhookState>>) -> String {
    state.identity.clone()
}

/// GET|HEAD /health: always healthy while the process is serving.
async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

/// POST /webhook/github: receive GitHub push events.
async fn handle_github(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let sig = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    if let Err(e) = state.verifier.verify(&body, sig) {
        tracing::warn!(
            sig_present = sig.is_some(),
            body_len = body.len(),
            "github webhook: {e}"
        );
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": e.to_string() }))).into_response();
    }

    let event = headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok());

    match state.dispatcher.handle(event, &body) {
        Ok(DispatchOutcome::Queued(_)) => Json(json!({ "ok": true, "queued": true })).into_response(),
        Ok(DispatchOutcome::Ignored(reason)) => {
            Json(json!({ "ok": true, "ignored": reason.as_str() })).into_response()
        }
        Err(e) => {
            let PayloadError::InvalidJson(ref cause) = e;
            tracing::warn!("github webhook: {e}: {cause}");
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

// ── Request logging ───────────────────────────────────────────────────────────

/// One log line per request. Health probes are skipped to keep the log quiet.
async fn log_requests(req: Request, next: Next) -> Response {
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    tracing::info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "http request"
    );
    response
}

// ── Server startup ────────────────────────────────────────────────────────────

/// Build the router with its body-size and timeout limits.
pub fn router(state: WebhookState, max_body_bytes: usize, timeout: Duration) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/webhook/github", post(handle_github))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(log_requests))
                .layer(RequestBodyLimitLayer::new(max_body_bytes))
                .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout))
                // The extractor default (2 MiB) would otherwise cap larger limits.
                .layer(DefaultBodyLimit::max(max_body_bytes)),
        )
        .with_state(Arc::new(state))
}

/// Start the webhook HTTP listener. Runs until Ctrl-C or SIGTERM.
pub async fn run(config: &Config, secret: WebhookSecret) -> Result<()> {
    deploy::prepare_job_root(&config.job_root)?;

    let runner = DeployRunner::new(&config.job_root, config.max_concurrent_deploys);
    let state = WebhookState::new(
        SignatureVerifier::new(secret),
        Arc::new(runner),
        host_identity(config.banner.as_deref()),
    );
    let app = router(
        state,
        config.max_body_bytes,
        Duration::from_secs(config.request_timeout_secs),
    );

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("webhook: cannot bind {}", config.bind))?;
    tracing::info!(
        job_root = %config.job_root.display(),
        "webhook: listening on {}",
        config.bind
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("webhook: shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("webhook: cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("webhook: cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("webhook: shutdown signal received");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
