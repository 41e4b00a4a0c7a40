//! Request-scoped idempotency ledger.
//!
//! A mutation carrying an `Idempotency-Key` claims a placeholder row keyed by
//! `(route, key, tenant scope)` with an insert-if-absent. The winner runs the
//! operation and stores the final status and serialized body; everyone else
//! either replays that response byte for byte, is told the original is still
//! running, or gets a conflict when the body hash differs.
//!
//! A placeholder is leased for [`PENDING_LEASE_SECS`]. If its owner never
//! completes or releases it, a retry after the lease takes the key over and
//! the old owner's late writes no longer match.

use std::future::Future;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, warn};

use crate::errors::{AppError, Result};
use crate::signing::sha256_hex;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

const MAX_KEY_LEN: usize = 255;

/// How long an unfinished placeholder blocks retries.
pub const PENDING_LEASE_SECS: i64 = 120;

/// Placeholder claimed by the first caller.
#[derive(Debug, Clone)]
pub struct Ticket {
    route: String,
    key: String,
    scope: String,
    claimed_at: i64,
}

/// A finished response recorded under a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub body: String,
}

#[derive(Debug)]
pub enum Gate {
    /// No key supplied; the call is best-effort and not deduplicated.
    Bypass,
    Proceed(Ticket),
    Replay(StoredResponse),
}

#[derive(Debug, FromRow)]
struct RecordRow {
    request_hash: String,
    created_at: i64,
    status_code: Option<i64>,
    response_body: Option<String>,
}

pub async fn begin(
    pool: &SqlitePool,
    route: &str,
    key: Option<&str>,
    scope: &str,
    body: &[u8],
    now: i64,
) -> Result<Gate> {
    let Some(key) = key else {
        return Ok(Gate::Bypass);
    };
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(AppError::Validation("invalid_idempotency_key"));
    }
    let request_hash = sha256_hex(body);

    let inserted = sqlx::query(
        r#"
        INSERT INTO idempotency_records (route, idem_key, scope, request_hash, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(route, idem_key, scope) DO NOTHING
        "#,
    )
    .bind(route)
    .bind(key)
    .bind(scope)
    .bind(&request_hash)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();

    let ticket = || Ticket {
        route: route.to_string(),
        key: key.to_string(),
        scope: scope.to_string(),
        claimed_at: now,
    };
    if inserted == 1 {
        return Ok(Gate::Proceed(ticket()));
    }

    let existing = sqlx::query_as::<_, RecordRow>(
        r#"
        SELECT request_hash, created_at, status_code, response_body
        FROM   idempotency_records
        WHERE  route = ?1 AND idem_key = ?2 AND scope = ?3
        "#,
    )
    .bind(route)
    .bind(key)
    .bind(scope)
    .fetch_optional(pool)
    .await?;

    // A vanished row means the first attempt failed server-side and was
    // released between our insert and this read; the caller may retry.
    let Some(existing) = existing else {
        return Err(AppError::Conflict("request_in_progress"));
    };

    if existing.request_hash != request_hash {
        warn!(route, scope, "Idempotency key reused with a different body");
        return Err(AppError::Conflict("idempotency_key_conflict"));
    }

    match (existing.status_code, existing.response_body) {
        (Some(code), Some(body)) => {
            let status = u16::try_from(code)
                .ok()
                .and_then(|c| StatusCode::from_u16(c).ok())
                .ok_or_else(|| AppError::Internal(format!("stored status {code} is invalid")))?;
            debug!(route, scope, "Replaying idempotent response");
            Ok(Gate::Replay(StoredResponse { status, body }))
        }
        _ if now - existing.created_at >= PENDING_LEASE_SECS => {
            let taken = sqlx::query(
                r#"
                UPDATE idempotency_records
                SET    created_at = ?1
                WHERE  route = ?2 AND idem_key = ?3 AND scope = ?4
                  AND  status_code IS NULL AND created_at = ?5
                "#,
            )
            .bind(now)
            .bind(route)
            .bind(key)
            .bind(scope)
            .bind(existing.created_at)
            .execute(pool)
            .await?
            .rows_affected();
            if taken == 0 {
                return Err(AppError::Conflict("request_in_progress"));
            }
            warn!(
                route,
                scope,
                claimed_at = existing.created_at,
                "Taking over abandoned idempotency key"
            );
            Ok(Gate::Proceed(ticket()))
        }
        _ => Err(AppError::Conflict("request_in_progress")),
    }
}

/// Record the final outcome so later retries replay it. A no-op once the
/// placeholder has been taken over.
pub async fn complete(pool: &SqlitePool, ticket: &Ticket, stored: &StoredResponse, now: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE idempotency_records
        SET    status_code = ?1, response_body = ?2, completed_at = ?3
        WHERE  route = ?4 AND idem_key = ?5 AND scope = ?6
          AND  status_code IS NULL AND created_at = ?7
        "#,
    )
    .bind(i64::from(stored.status.as_u16()))
    .bind(&stored.body)
    .bind(now)
    .bind(&ticket.route)
    .bind(&ticket.key)
    .bind(&ticket.scope)
    .bind(ticket.claimed_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Release a placeholder whose operation failed server-side.
pub async fn release(pool: &SqlitePool, ticket: &Ticket) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM idempotency_records
        WHERE  route = ?1 AND idem_key = ?2 AND scope = ?3
          AND  status_code IS NULL AND created_at = ?4
        "#,
    )
    .bind(&ticket.route)
    .bind(&ticket.key)
    .bind(&ticket.scope)
    .bind(ticket.claimed_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Run `op` behind the gate and turn its outcome into a response.
///
/// 2xx and 4xx outcomes are recorded and replayed; 5xx outcomes release the
/// key so the caller can try again.
pub async fn guard<F, Fut>(
    pool: &SqlitePool,
    route: &str,
    key: Option<&str>,
    scope: &str,
    body: &[u8],
    op: F,
) -> Result<Response>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(StatusCode, Value)>>,
{
    let now = crate::db::now();
    let ticket = match begin(pool, route, key, scope, body, now).await? {
        Gate::Replay(stored) => {
            let mut response = stored.into_response();
            response
                .headers_mut()
                .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
            return Ok(response);
        }
        Gate::Bypass => None,
        Gate::Proceed(ticket) => Some(ticket),
    };

    let outcome = op().await;
    let Some(ticket) = ticket else {
        return outcome.map(|(status, value)| json_response(status, value.to_string()));
    };

    let (stored, error) = match outcome {
        Ok((status, value)) => (
            StoredResponse {
                status,
                body: serde_json::to_string(&value)?,
            },
            None,
        ),
        Err(err) => (
            StoredResponse {
                status: err.status_code(),
                body: serde_json::to_string(&err.body())?,
            },
            Some(err),
        ),
    };

    if stored.status.is_server_error() {
        release(pool, &ticket).await?;
        // Surfaces through AppError so the detail gets logged.
        return Err(error.unwrap_or_else(|| AppError::Internal("operation failed".into())));
    }

    complete(pool, &ticket, &stored, crate::db::now()).await?;
    Ok(stored.into_response())
}

fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response()
}

impl IntoResponse for StoredResponse {
    fn into_response(self) -> Response {
        json_response(self.status, self.body)
    }
}
