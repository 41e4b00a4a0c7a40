//! Agent webhook endpoints: registration, listing, disabling and the
//! append-only delivery log. Delivery itself lives in [`dispatch`]; the
//! durable queue feeding it lives in [`outbox`].

pub mod dispatch;
pub mod outbox;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::info;

use crate::db;
use crate::errors::{AppError, Result};
use crate::events::TaskEventKind;
use crate::signing::generate_secret;

const MAX_DELIVERY_PAGE: i64 = 200;

#[derive(Debug, Clone, FromRow)]
pub struct EndpointRow {
    pub id: String,
    pub ai_account_id: String,
    pub url: String,
    pub secret: String,
    /// JSON array of event names; `NULL` subscribes to everything.
    pub events: Option<String>,
    pub status: String,
    pub created_at: i64,
}

impl EndpointRow {
    fn subscriptions(&self) -> Option<Vec<TaskEventKind>> {
        let raw = self.events.as_deref()?;
        let names: Vec<String> = serde_json::from_str(raw).ok()?;
        let kinds: Vec<_> = names.iter().filter_map(|n| TaskEventKind::parse(n)).collect();
        if kinds.is_empty() {
            None
        } else {
            Some(kinds)
        }
    }

    /// An endpoint without an explicit list receives every event.
    pub fn subscribes_to(&self, kind: TaskEventKind) -> bool {
        self.subscriptions()
            .map(|kinds| kinds.contains(&kind))
            .unwrap_or(true)
    }
}

/// Public view of an endpoint. Never carries the secret.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Endpoint {
    pub id: String,
    pub url: String,
    pub events: Option<Vec<TaskEventKind>>,
    pub status: String,
    pub created_at: i64,
}

impl From<EndpointRow> for Endpoint {
    fn from(row: EndpointRow) -> Self {
        Self {
            events: row.subscriptions(),
            id: row.id,
            url: row.url,
            status: row.status,
            created_at: row.created_at,
        }
    }
}

/// Returned once, at registration.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredEndpoint {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub secret: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterEndpoint {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
}

fn validate_url(raw: Option<&str>) -> Result<String> {
    let raw = raw
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or(AppError::Validation("missing_url"))?;
    let url = Url::parse(raw).map_err(|e| AppError::invalid_field("url", e.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url.to_string()),
        _ => Err(AppError::invalid_field("url", "must be an http(s) URL")),
    }
}

fn validate_events(raw: Option<Vec<String>>) -> Result<Option<Vec<TaskEventKind>>> {
    let Some(names) = raw else {
        return Ok(None);
    };
    let mut kinds = Vec::with_capacity(names.len());
    for name in &names {
        let kind = TaskEventKind::parse(name.trim())
            .ok_or_else(|| AppError::invalid_field("events", format!("unknown event {name}")))?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(if kinds.is_empty() { None } else { Some(kinds) })
}

pub async fn register(
    pool: &SqlitePool,
    account_id: &str,
    request: RegisterEndpoint,
    now: i64,
) -> Result<RegisteredEndpoint> {
    let url = validate_url(request.url.as_deref())?;
    let events = validate_events(request.events)?;
    let events_json = events
        .as_ref()
        .map(|kinds| {
            let names: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
            serde_json::to_string(&names)
        })
        .transpose()?;
    let id = db::new_id("whe");
    let secret = generate_secret("whsec");

    sqlx::query(
        r#"
        INSERT INTO webhook_endpoints (id, ai_account_id, url, secret, events, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6)
        "#,
    )
    .bind(&id)
    .bind(account_id)
    .bind(&url)
    .bind(&secret)
    .bind(&events_json)
    .bind(now)
    .execute(pool)
    .await?;

    info!(endpoint_id = %id, account_id, %url, "Webhook endpoint registered");
    Ok(RegisteredEndpoint {
        endpoint: Endpoint {
            id,
            url,
            events,
            status: "active".to_string(),
            created_at: now,
        },
        secret,
    })
}

pub async fn list(pool: &SqlitePool, account_id: &str) -> Result<Vec<Endpoint>> {
    let rows = sqlx::query_as::<_, EndpointRow>(
        r#"
        SELECT id, ai_account_id, url, secret, events, status, created_at
        FROM   webhook_endpoints
        WHERE  ai_account_id = ?1
        ORDER  BY created_at DESC, id
        "#,
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Endpoint::from).collect())
}

async fn owned_endpoint(pool: &SqlitePool, account_id: &str, endpoint_id: &str) -> Result<EndpointRow> {
    sqlx::query_as::<_, EndpointRow>(
        r#"
        SELECT id, ai_account_id, url, secret, events, status, created_at
        FROM   webhook_endpoints
        WHERE  id = ?1 AND ai_account_id = ?2
        "#,
    )
    .bind(endpoint_id)
    .bind(account_id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound("endpoint_not_found"))
}

/// Disabling is idempotent.
pub async fn disable(pool: &SqlitePool, account_id: &str, endpoint_id: &str) -> Result<Endpoint> {
    owned_endpoint(pool, account_id, endpoint_id).await?;
    sqlx::query("UPDATE webhook_endpoints SET status = 'disabled' WHERE id = ?1 AND ai_account_id = ?2")
        .bind(endpoint_id)
        .bind(account_id)
        .execute(pool)
        .await?;
    info!(endpoint_id, account_id, "Webhook endpoint disabled");
    Ok(owned_endpoint(pool, account_id, endpoint_id).await?.into())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Delivery {
    pub id: String,
    pub endpoint_id: String,
    pub event_id: String,
    pub event_type: String,
    pub status_code: Option<i64>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
}

pub async fn deliveries(
    pool: &SqlitePool,
    account_id: &str,
    endpoint_id: &str,
    limit: Option<i64>,
) -> Result<Vec<Delivery>> {
    owned_endpoint(pool, account_id, endpoint_id).await?;
    let limit = limit.unwrap_or(50).clamp(1, MAX_DELIVERY_PAGE);
    let rows = sqlx::query_as::<_, Delivery>(
        r#"
        SELECT id, endpoint_id, event_id, event_type, status_code, response_body, error, created_at
        FROM   webhook_deliveries
        WHERE  endpoint_id = ?1
        ORDER  BY created_at DESC, id
        LIMIT  ?2
        "#,
    )
    .bind(endpoint_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
