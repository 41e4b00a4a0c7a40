//! Operator endpoints, gated on `X-Admin-Token`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use super::{parse_body, reply, with_auth, ApiState};
use crate::auth::AgentCredentials;
use crate::db;
use crate::errors::AppError;
use crate::quota;
use crate::tasks::machine;

#[derive(Debug, Default, Deserialize)]
struct NewAccount {
    name: Option<String>,
    monthly_limit: Option<i64>,
    minute_limit: Option<i64>,
}

/// `POST /api/admin/ai-accounts`. The raw API key is returned once.
pub async fn create_account(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    let (headers, body) = (&headers, &body);
    with_auth(st, headers, AgentCredentials::default(), body, |auth| async move {
        auth.require_admin()?;
        let request: NewAccount = parse_body(headers, body).await?;
        let name = request
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(AppError::Validation("missing_name"))?;
        for (field, limit) in [
            ("monthly_limit", request.monthly_limit),
            ("minute_limit", request.minute_limit),
        ] {
            if matches!(limit, Some(l) if l <= 0) {
                return Err(AppError::invalid_field(field, "must be positive"));
            }
        }
        let (account_id, api_key) =
            quota::create_account(&st.pool, name, request.monthly_limit, request.minute_limit)
                .await?;
        Ok(reply(
            StatusCode::CREATED,
            json!({ "ai_account_id": account_id, "ai_api_key": api_key }),
        ))
    })
    .await
}

#[derive(Debug, Default, Deserialize)]
struct RestoreRequest {
    deadline_minutes: Option<i64>,
}

/// `POST /api/admin/tasks/:id/restore`
pub async fn restore_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    let (headers, body) = (&headers, &body);
    with_auth(st, headers, AgentCredentials::default(), body, |auth| async move {
        auth.require_admin()?;
        let request: RestoreRequest = parse_body(headers, body).await?;
        let task =
            machine::admin_restore(&st.pool, &auth, &id, request.deadline_minutes, db::now())
                .await?;
        Ok(reply(StatusCode::OK, json!({ "task": task })))
    })
    .await
}

#[derive(Debug, Default, Deserialize)]
struct PayoutRequest {
    processor_fee: Option<f64>,
    #[serde(default)]
    failed: bool,
}

/// `POST /api/admin/tasks/:id/payout`
pub async fn settle_payout(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let st = &*state;
    let (headers, body) = (&headers, &body);
    with_auth(st, headers, AgentCredentials::default(), body, |auth| async move {
        auth.require_admin()?;
        let request: PayoutRequest = parse_body(headers, body).await?;
        let processor_fee = request
            .processor_fee
            .ok_or(AppError::Validation("missing_processor_fee"))?;
        let task = machine::settle_payout(
            &st.pool,
            &auth,
            &id,
            processor_fee,
            request.failed,
            &st.config.fees,
            db::now(),
        )
        .await?;
        Ok(reply(StatusCode::OK, json!({ "task": task })))
    })
    .await
}

#[cfg(test)]
mod tests {
    use axum::http::Method;
    use serde_json::json;

    use super::*;
    use crate::api::test_state;
    use crate::api::tests::{call, json_request};

    const ADMIN: [(&str, &str); 1] = [("x-admin-token", "admin-secret")];

    #[tokio::test]
    async fn issued_key_authenticates() {
        let state = test_state().await;
        let (status, _, body) = call(
            &state,
            json_request(
                Method::POST,
                "/api/admin/ai-accounts",
                &ADMIN,
                json!({ "name": "scout", "minute_limit": 2 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let account_id = body["ai_account_id"].as_str().unwrap();
        let api_key = body["ai_api_key"].as_str().unwrap();

        let request = axum::http::Request::builder()
            .uri(format!("/api/tasks?ai_account_id={account_id}&ai_api_key={api_key}"))
            .body(axum::body::Body::empty())
            .unwrap();
        let (status, headers, _) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-ai-ratelimit-limit-minute").unwrap(), "2");
    }

    #[tokio::test]
    async fn admin_routes_require_the_token() {
        let state = test_state().await;
        let (status, _, body) = call(
            &state,
            json_request(
                Method::POST,
                "/api/admin/ai-accounts",
                &[("x-human-id", "human_1")],
                json!({ "name": "scout" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["reason"], "admin_required");
    }

    #[tokio::test]
    async fn restore_of_missing_task_is_not_found() {
        let state = test_state().await;
        let (status, _, body) = call(
            &state,
            json_request(
                Method::POST,
                "/api/admin/tasks/task_missing/restore",
                &ADMIN,
                json!({ "deadline_minutes": 30 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["reason"], "not_found");
    }
}
