//! Signed fan-out of one task event to the owning tenant's endpoints.
//!
//! The envelope is serialized once; each endpoint gets its own HMAC over
//! those exact bytes. Deliveries run concurrently with a bounded deadline
//! and every attempt lands in `webhook_deliveries`, success or not.

use std::time::Duration;

use reqwest::Client;
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::db;
use crate::errors::Result;
use crate::events::TaskEventKind;
use crate::signing::hmac_sha256_hex;
use crate::webhooks::EndpointRow;

pub const EVENT_HEADER: &str = "x-toolcall-event";
pub const DELIVERY_HEADER: &str = "x-toolcall-delivery";
pub const SIGNATURE_HEADER: &str = "x-toolcall-signature";

/// Stored response bodies are cut to this many bytes.
pub const MAX_STORED_BODY: usize = 2048;

/// One queued event, as read back from the outbox.
#[derive(Debug, Clone)]
pub struct OutgoingEvent {
    pub event_id: String,
    pub kind: TaskEventKind,
    pub task_id: String,
    /// Serialized envelope; signed and sent byte for byte.
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub delivery_id: String,
    pub endpoint_id: String,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.status_code.map(|c| (200..300).contains(&c)).unwrap_or(false)
    }
}

pub fn signature(secret: &str, payload: &[u8]) -> String {
    format!("sha256={}", hmac_sha256_hex(secret.as_bytes(), payload))
}

/// Longest prefix of `body` within `max` bytes that ends on a char boundary.
pub fn truncate_body(body: &str, max: usize) -> &str {
    if body.len() <= max {
        return body;
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

async fn subscribed_endpoints(pool: &SqlitePool, event: &OutgoingEvent) -> Result<Vec<EndpointRow>> {
    let owner: Option<(Option<String>,)> =
        sqlx::query_as("SELECT ai_account_id FROM tasks WHERE id = ?1")
            .bind(&event.task_id)
            .fetch_optional(pool)
            .await?;
    let Some(account_id) = owner.and_then(|(account,)| account) else {
        debug!(task_id = %event.task_id, "Task has no agent tenant; nothing to deliver");
        return Ok(Vec::new());
    };

    let endpoints = sqlx::query_as::<_, EndpointRow>(
        r#"
        SELECT id, ai_account_id, url, secret, events, status, created_at
        FROM   webhook_endpoints
        WHERE  ai_account_id = ?1 AND status = 'active'
        "#,
    )
    .bind(&account_id)
    .fetch_all(pool)
    .await?;
    Ok(endpoints
        .into_iter()
        .filter(|e| e.subscribes_to(event.kind))
        .collect())
}

async fn deliver_one(
    client: Client,
    endpoint: EndpointRow,
    event: OutgoingEvent,
    timeout: Duration,
) -> DeliveryOutcome {
    let delivery_id = db::new_id("dlv");
    let result = client
        .post(&endpoint.url)
        .timeout(timeout)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(EVENT_HEADER, event.kind.as_str())
        .header(DELIVERY_HEADER, &delivery_id)
        .header(SIGNATURE_HEADER, signature(&endpoint.secret, event.payload.as_bytes()))
        .body(event.payload)
        .send()
        .await;

    match result {
        Ok(response) => {
            let status = response.status().as_u16();
            let (body, error) = match response.text().await {
                Ok(text) => (Some(truncate_body(&text, MAX_STORED_BODY).to_string()), None),
                Err(e) => (None, Some(format!("failed to read response body: {e}"))),
            };
            DeliveryOutcome {
                delivery_id,
                endpoint_id: endpoint.id,
                status_code: Some(status),
                response_body: body,
                error,
            }
        }
        Err(e) => DeliveryOutcome {
            delivery_id,
            endpoint_id: endpoint.id,
            status_code: None,
            response_body: None,
            error: Some(e.to_string()),
        },
    }
}

/// Deliver `event` to every subscribed endpoint and record each attempt.
///
/// Endpoint failures are recorded, not returned. Only store errors propagate.
pub async fn dispatch(
    pool: &SqlitePool,
    client: &Client,
    timeout: Duration,
    event: &OutgoingEvent,
    now: i64,
) -> Result<Vec<DeliveryOutcome>> {
    let endpoints = subscribed_endpoints(pool, event).await?;
    if endpoints.is_empty() {
        return Ok(Vec::new());
    }

    let mut inflight = JoinSet::new();
    for endpoint in endpoints {
        inflight.spawn(deliver_one(client.clone(), endpoint, event.clone(), timeout));
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = inflight.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => warn!(event_id = %event.event_id, "Delivery task aborted: {e}"),
        }
    }

    for outcome in &outcomes {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (
                id, endpoint_id, event_id, event_type, status_code, response_body, error, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&outcome.delivery_id)
        .bind(&outcome.endpoint_id)
        .bind(&event.event_id)
        .bind(event.kind.as_str())
        .bind(outcome.status_code.map(i64::from))
        .bind(&outcome.response_body)
        .bind(&outcome.error)
        .bind(now)
        .execute(pool)
        .await?;

        if !outcome.succeeded() {
            warn!(
                endpoint_id = %outcome.endpoint_id,
                event_id = %event.event_id,
                status = ?outcome.status_code,
                error = ?outcome.error,
                "Webhook delivery failed"
            );
        }
    }

    let delivered = outcomes.iter().filter(|o| o.succeeded()).count();
    info!(
        event_id = %event.event_id,
        event_type = event.kind.as_str(),
        delivered,
        attempted = outcomes.len(),
        "Webhook event dispatched"
    );
    Ok(outcomes)
}
