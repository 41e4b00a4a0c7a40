//! Agent webhook endpoint management. Every route is scoped to the calling
//! agent tenant.

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
use crate::auth::AgentCredentials;
use crate::db;
use crate::webhooks::{self, RegisterEndpoint};

/// `POST /api/ai/webhooks`
pub async fn register(
    State(state): State<Arc<ApiState>>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    let (headers, body) = (&headers, &body);
    with_auth(st, headers, creds, body, |auth| async move {
        let account_id = auth.account_id()?;
        let request: RegisterEndpoint = parse_body(headers, body).await?;
        let registered = webhooks::register(&st.pool, account_id, request, db::now()).await?;
        Ok(reply(StatusCode::CREATED, json!({ "endpoint": registered })))
    })
    .await
}

/// `GET /api/ai/webhooks`
pub async fn list(
    State(state): State<Arc<ApiState>>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
) -> Response {
    let st = &*state;
    with_auth(st, &headers, creds, &Bytes::new(), |auth| async move {
        let endpoints = webhooks::list(&st.pool, auth.account_id()?).await?;
        Ok(reply(StatusCode::OK, json!({ "endpoints": endpoints })))
    })
    .await
}

/// `DELETE /api/ai/webhooks/:id`
pub async fn disable(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(creds): Query<AgentCredentials>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    with_auth(st, &headers, creds, &body, |auth| async move {
        let endpoint = webhooks::disable(&st.pool, auth.account_id()?, &id).await?;
        Ok(reply(StatusCode::OK, json!({ "endpoint": endpoint })))
    })
    .await
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliveryPage {
    pub limit: Option<i64>,
}

/// `GET /api/ai/webhooks/:id/deliveries`
pub async fn deliveries(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(creds): Query<AgentCredentials>,
    Query(page): Query<DeliveryPage>,
    headers: HeaderMap,
) -> Response {
    let st = &*state;
    with_auth(st, &headers, creds, &Bytes::new(), |auth| async move {
        let deliveries =
            webhooks::deliveries(&st.pool, auth.account_id()?, &id, page.limit).await?;
        Ok(reply(StatusCode::OK, json!({ "deliveries": deliveries })))
    })
    .await
}
