//! Payment order handlers and the settlement provider webhook.
//!
//! Order routes are open to the requester of the order's task and to admins.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{envelope, parse_body, reply, with_auth, ApiState};
use crate::auth::{header_str, AgentCredentials, AuthContext};
use crate::db;
use crate::errors::{AppError, Result};
use crate::idempotency::{self, IDEMPOTENCY_HEADER};
use crate::payments::intake::{self, SIGNATURE_HEADER};
use crate::payments::orders::{self, NewOrder, Order, RefundOrder};
use crate::payments::provider::RefundReason;
use crate::tasks::fetch_task;

async fn authorize_task(state: &ApiState, auth: &AuthContext, task_id: &str) -> Result<()> {
    if auth.is_admin() {
        return Ok(());
    }
    auth.require_requester()?;
    let task = fetch_task(&state.pool, task_id)
        .await?
        .filter(|t| t.deleted_at.is_none())
        .ok_or(AppError::NotFound("task_not_found"))?;
    if task.is_requested_by(auth) {
        Ok(())
    } else {
        Err(AppError::Forbidden("not_requester"))
    }
}

async fn authorized_order(
    state: &ApiState,
    auth: &AuthContext,
    id: &str,
    version: Option<i64>,
) -> Result<Order> {
    let order = orders::fetch_order(&state.pool, id, version)
        .await?
        .ok_or(AppError::NotFound("order_not_found"))?;
    authorize_task(state, auth, &order.task_id).await?;
    Ok(order)
}

#[derive(Debug, Default, Deserialize)]
pub struct VersionQuery {
    pub version: Option<i64>,
}

/// `POST /api/orders`
pub async fn create(
    State(state): State<Arc<ApiState>>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    let (headers, body) = (&headers, &body);
    with_auth(st, headers, creds, body, |auth| async move {
        let scope = auth.tenant_scope();
        let key = header_str(headers, IDEMPOTENCY_HEADER);
        idempotency::guard(&st.pool, "POST /api/orders", key, &scope, body, || async move {
            let request: NewOrder = parse_body(headers, body).await?;
            authorize_task(st, &auth, &request.task_id).await?;
            let (order, created) =
                orders::create_order(&st.pool, &st.config, request, db::now()).await?;
            let status = if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            Ok((status, envelope(json!({ "order": order, "created": created }))))
        })
        .await
    })
    .await
}

/// `GET /api/orders/:id?version=`
pub async fn show(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(creds): Query<AgentCredentials>,
    Query(query): Query<VersionQuery>,
    headers: HeaderMap,
) -> Response {
    let st = &*state;
    with_auth(st, &headers, creds, &Bytes::new(), |auth| async move {
        let order = authorized_order(st, &auth, &id, query.version).await?;
        Ok(reply(StatusCode::OK, json!({ "order": order })))
    })
    .await
}

/// `POST /api/orders/:id/checkout`
pub async fn checkout(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    let (headers, body) = (&headers, &body);
    with_auth(st, headers, creds, body, |auth| async move {
        let request: VersionQuery = parse_body(headers, body).await?;
        let order = authorized_order(st, &auth, &id, request.version).await?;
        let order = orders::create_checkout(
            &st.pool,
            st.provider.as_ref(),
            &st.config,
            &order.id,
            Some(order.version),
            db::now(),
        )
        .await?;
        Ok(reply(
            StatusCode::OK,
            json!({ "checkout_url": order.checkout_url, "order": order }),
        ))
    })
    .await
}

/// `POST /api/orders/:id/confirm`
pub async fn confirm(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    let (headers, body) = (&headers, &body);
    with_auth(st, headers, creds, body, |auth| async move {
        let request: VersionQuery = parse_body(headers, body).await?;
        let order = authorized_order(st, &auth, &id, request.version).await?;
        let order = orders::sync_checkout(
            &st.pool,
            st.provider.as_ref(),
            &order.id,
            Some(order.version),
            db::now(),
        )
        .await?;
        Ok(reply(StatusCode::OK, json!({ "order": order })))
    })
    .await
}

#[derive(Debug, Default, Deserialize)]
struct RefundBody {
    version: Option<i64>,
    amount: Option<i64>,
    reason: Option<RefundReason>,
}

/// `POST /api/orders/:id/refunds`
pub async fn refund(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    let (headers, body) = (&headers, &body);
    with_auth(st, headers, creds, body, |auth| async move {
        let request: RefundBody = parse_body(headers, body).await?;
        let order = authorized_order(st, &auth, &id, request.version).await?;
        let order = orders::refund_order(
            &st.pool,
            st.provider.as_ref(),
            &order.id,
            Some(order.version),
            RefundOrder {
                amount: request.amount,
                reason: request.reason,
            },
            db::now(),
        )
        .await?;
        Ok(reply(StatusCode::OK, json!({ "order": order })))
    })
    .await
}

/// `POST /api/webhooks/settlement`
///
/// Acknowledged with 200 unless the event could not be stored, so the
/// provider only retries what was actually lost.
pub async fn provider_webhook(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let outcome = intake::receive(
        &state.pool,
        state.config.provider.webhook_secret.as_deref(),
        header_str(&headers, SIGNATURE_HEADER),
        &body,
        db::now(),
    )
    .await;
    match outcome {
        Ok(outcome) => {
            debug!(?outcome, "Provider webhook handled");
            Json(json!({ "received": true })).into_response()
        }
        Err(e) => e.into_response(),
    }
}
