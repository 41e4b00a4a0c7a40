//! Task lifecycle handlers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use super::{parse_body, reply, with_auth, ApiState};
use crate::auth::{header_str, AgentCredentials};
use crate::db;
use crate::errors::AppError;
use crate::idempotency::{self, IDEMPOTENCY_HEADER};
use crate::tasks::filter::{list_tasks, ListQuery};
use crate::tasks::machine::{self, Deliverable, NewTask};
use crate::tasks::{fetch_human, set_payout_destination as store_payout_destination};

/// `POST /api/tasks`
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
        idempotency::guard(&st.pool, "POST /api/tasks", key, &scope, body, || async move {
            let request: NewTask = parse_body(headers, body).await?;
            let task = machine::create_task(&st.pool, &auth, request, db::now()).await?;
            Ok((
                StatusCode::CREATED,
                super::envelope(json!({ "task_id": task.id, "task": task })),
            ))
        })
        .await
    })
    .await
}

/// `GET /api/tasks`
pub async fn list(
    State(state): State<Arc<ApiState>>,
    Query(creds): Query<AgentCredentials>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Response {
    let st = &*state;
    with_auth(st, &headers, creds, &Bytes::new(), |_auth| async move {
        let (filters, limit) = query.into_filters()?;
        let tasks = list_tasks(&st.pool, &filters, limit, db::now()).await?;
        Ok(reply(StatusCode::OK, json!({ "count": tasks.len(), "tasks": tasks })))
    })
    .await
}

/// `GET /api/tasks/:id`
pub async fn show(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
) -> Response {
    let st = &*state;
    with_auth(st, &headers, creds, &Bytes::new(), |_auth| async move {
        let task = machine::load_task(&st.pool, &id, db::now()).await?;
        Ok(reply(StatusCode::OK, json!({ "task": task })))
    })
    .await
}

/// `POST /api/tasks/:id/accept`
pub async fn accept(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    with_auth(st, &headers, creds, &body, |auth| async move {
        let task = machine::accept(&st.pool, &auth, &id, db::now()).await?;
        Ok(reply(StatusCode::OK, json!({ "task": task })))
    })
    .await
}

/// `POST /api/tasks/:id/skip`
pub async fn skip(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    with_auth(st, &headers, creds, &body, |auth| async move {
        let task = machine::skip(&st.pool, &auth, &id, db::now()).await?;
        Ok(reply(StatusCode::OK, json!({ "task": task })))
    })
    .await
}

/// `POST /api/tasks/:id/submit`
pub async fn submit(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    let (headers, body) = (&headers, &body);
    with_auth(st, headers, creds, body, |auth| async move {
        let deliverable: Deliverable = parse_body(headers, body).await?;
        let task =
            machine::submit(&st.pool, &auth, &id, deliverable, &st.config.fees, db::now()).await?;
        Ok(reply(StatusCode::OK, json!({ "task": task })))
    })
    .await
}

/// `POST /api/tasks/:id/approve`
pub async fn approve(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    with_auth(st, &headers, creds, &body, |auth| async move {
        let task = machine::approve_review(&st.pool, &auth, &id, &st.config.fees, db::now()).await?;
        Ok(reply(StatusCode::OK, json!({ "task": task })))
    })
    .await
}

/// `POST /api/tasks/:id/cancel`
pub async fn cancel(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    with_auth(st, &headers, creds, &body, |auth| async move {
        let task = machine::cancel(&st.pool, &auth, &id, db::now()).await?;
        Ok(reply(StatusCode::OK, json!({ "task": task })))
    })
    .await
}

/// `DELETE /api/tasks/:id`
pub async fn remove(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    with_auth(st, &headers, creds, &body, |auth| async move {
        machine::soft_delete(&st.pool, &auth, &id, db::now()).await?;
        Ok(reply(StatusCode::OK, json!({ "task_id": id, "deleted": true })))
    })
    .await
}

#[derive(Debug, Default, Deserialize)]
struct PayoutDestination {
    destination_account: Option<String>,
    country: Option<String>,
}

/// `POST /api/humans/me/payout-destination`
pub async fn set_payout_destination(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    let (headers, body) = (&headers, &body);
    with_auth(st, headers, AgentCredentials::default(), body, |auth| async move {
        let human_id = auth.human_id()?;
        let request: PayoutDestination = parse_body(headers, body).await?;
        let destination = request
            .destination_account
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or(AppError::Validation("missing_destination_account"))?;
        let country = match request.country.as_deref().map(str::trim) {
            Some(c) if c.len() == 2 && c.chars().all(|ch| ch.is_ascii_alphabetic()) => {
                Some(c.to_ascii_uppercase())
            }
            Some("") | None => None,
            Some(_) => return Err(AppError::invalid_field("country", "must be an ISO-3166 alpha-2 code")),
        };
        store_payout_destination(&st.pool, human_id, destination, country.as_deref()).await?;
        let human = fetch_human(&st.pool, human_id)
            .await?
            .ok_or(AppError::NotFound("human_not_found"))?;
        Ok(reply(StatusCode::OK, json!({ "human": human })))
    })
    .await
}
