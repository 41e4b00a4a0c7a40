//! Axum REST API: router, shared state and request plumbing.
//!
//! Every handler follows the same shape: resolve the caller once into an
//! [`AuthContext`], decode a typed request, call into the domain modules and
//! wrap the result in a `{status: "ok", …}` envelope. Agent callers get
//! `X-AI-RateLimit-*` headers on every response, errors included.

pub mod admin;
pub mod orders;
pub mod tasks;
pub mod webhooks;

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{FromRequest, Request},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Form, Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, AgentCredentials, AuthContext};
use crate::config::Config;
use crate::errors::{AppError, Result};
use crate::payments::provider::SettlementProvider;

pub struct ApiState {
    pub pool: SqlitePool,
    pub config: Config,
    pub provider: Arc<dyn SettlementProvider>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        // Tasks
        .route("/api/tasks", post(tasks::create).get(tasks::list))
        .route("/api/tasks/:id", get(tasks::show).delete(tasks::remove))
        .route("/api/tasks/:id/accept", post(tasks::accept))
        .route("/api/tasks/:id/skip", post(tasks::skip))
        .route("/api/tasks/:id/submit", post(tasks::submit))
        .route("/api/tasks/:id/approve", post(tasks::approve))
        .route("/api/tasks/:id/cancel", post(tasks::cancel))
        .route(
            "/api/humans/me/payout-destination",
            post(tasks::set_payout_destination),
        )
        // Orders
        .route("/api/orders", post(orders::create))
        .route("/api/orders/:id", get(orders::show))
        .route("/api/orders/:id/checkout", post(orders::checkout))
        .route("/api/orders/:id/confirm", post(orders::confirm))
        .route("/api/orders/:id/refunds", post(orders::refund))
        .route("/api/webhooks/settlement", post(orders::provider_webhook))
        // Agent webhooks
        .route("/api/ai/webhooks", post(webhooks::register).get(webhooks::list))
        .route("/api/ai/webhooks/:id", delete(webhooks::disable))
        .route("/api/ai/webhooks/:id/deliveries", get(webhooks::deliveries))
        // Admin
        .route("/api/admin/ai-accounts", post(admin::create_account))
        .route("/api/admin/tasks/:id/restore", post(admin::restore_task))
        .route("/api/admin/tasks/:id/payout", post(admin::settle_payout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `{status: "ok"}` merged with the fields of `fields`.
pub fn envelope(fields: Value) -> Value {
    let mut body = json!({ "status": "ok" });
    if let (Value::Object(target), Value::Object(extra)) = (&mut body, fields) {
        target.extend(extra);
    }
    body
}

pub fn reply(status: StatusCode, fields: Value) -> Response {
    (status, Json(envelope(fields))).into_response()
}

// ─────────────────────────────────────────────────────────
// Request plumbing
// ─────────────────────────────────────────────────────────

fn is_form(headers: &HeaderMap) -> bool {
    auth::header_str(headers, header::CONTENT_TYPE.as_str())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Decode a JSON or form-encoded body into `T`. An empty body decodes as `{}`.
pub async fn parse_body<T: DeserializeOwned>(headers: &HeaderMap, body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return serde_json::from_str("{}").map_err(|e| AppError::invalid_field("body", e.to_string()));
    }
    if is_form(headers) {
        let request = Request::builder()
            .method(Method::POST)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.clone()))
            .map_err(AppError::internal)?;
        let Form(value) = Form::<T>::from_request(request, &())
            .await
            .map_err(|e| AppError::invalid_field("body", e.body_text()))?;
        return Ok(value);
    }
    serde_json::from_slice(body).map_err(|e| AppError::invalid_field("body", e.to_string()))
}

/// Resolve the caller from headers plus credentials in the body or query.
pub async fn authenticate(
    state: &ApiState,
    headers: &HeaderMap,
    query: AgentCredentials,
    body: &Bytes,
) -> Result<AuthContext> {
    let from_body = parse_body::<AgentCredentials>(headers, body)
        .await
        .unwrap_or_default();
    auth::resolve(state, headers, from_body.or(query)).await
}

/// Authenticate, run `op`, and stamp quota headers on whatever comes back.
pub async fn with_auth<F, Fut>(
    state: &ApiState,
    headers: &HeaderMap,
    query: AgentCredentials,
    body: &Bytes,
    op: F,
) -> Response
where
    F: FnOnce(AuthContext) -> Fut,
    Fut: Future<Output = Result<Response>>,
{
    let auth = match authenticate(state, headers, query, body).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    let mut response = match op(auth.clone()).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    auth.apply_quota_headers(response.headers_mut());
    response
}

#[cfg(test)]
pub(crate) async fn test_state() -> Arc<ApiState> {
    use crate::payments::provider::fake::FakeProvider;
    test_state_with(Arc::new(FakeProvider::default())).await
}

#[cfg(test)]
pub(crate) async fn test_state_with(provider: Arc<dyn SettlementProvider>) -> Arc<ApiState> {
    Arc::new(ApiState {
        pool: crate::db::test_pool().await,
        config: Config::for_tests(),
        provider,
    })
}
