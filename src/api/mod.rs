use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    error_handling::HandleErrorLayer,
    extract::{DefaultBodyLimit, Request},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower::{BoxError, ServiceBuilder};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub mod command;
pub mod webhook;

/// Slack caps message payloads well below this.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the relay router: webhook relay, slash commands, health and metrics.
pub fn router(state: Arc<AppState>) -> Router {
    let timeout = state.config.request_timeout;

    Router::new()
        .route("/p/*path", post(webhook::relay))
        .route("/slash/", post(command::slash_command))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_404)
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .timeout(timeout),
        )
        .layer(TraceLayer::new_for_http().make_span_with(|req: &Request| {
            tracing::debug_span!(
                "request",
                method = %req.method(),
                path = %webhook::mask_path(req.uri().path())
            )
        }))
        .layer(middleware::from_fn(access_log))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "message": "ok" }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::encode_metrics(),
    )
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Dropping the handler future on deadline also drops any in-flight store or
/// Slack call it was awaiting.
async fn handle_timeout_error(err: BoxError) -> (StatusCode, String) {
    if err.is::<tower::timeout::error::Elapsed>() {
        tracing::warn!("request deadline exceeded");
        (StatusCode::REQUEST_TIMEOUT, "Request timed out.\n".to_string())
    } else {
        tracing::error!(error = %err, "unhandled middleware error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error.\n".to_string(),
        )
    }
}

/// Middleware: one line per request. Webhook tokens are masked.
async fn access_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = webhook::mask_path(req.uri().path());
    let started = Instant::now();

    let resp = next.run(req).await;

    let latency: Duration = started.elapsed();
    tracing::info!(
        %method,
        path = %path,
        status = resp.status().as_u16(),
        latency_ms = latency.as_millis() as u64,
        "request handled"
    );
    resp
}

const REQUEST_ID: &str = "x-request-id";

/// Middleware: echoes the caller's X-Request-Id, or mints a UUID v4 when absent.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = req
        .headers()
        .get(REQUEST_ID)
        .filter(|v| !v.is_empty())
        .cloned()
        .or_else(|| HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).ok());
    let mut resp = next.run(req).await;
    if let Some(val) = req_id {
        resp.headers_mut().insert(REQUEST_ID, val);
    }
    resp
}

/// Middleware: responses carry tokens and webhook URLs and must never be cached.
async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    resp
}
