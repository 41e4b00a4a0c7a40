//! Durable event queue between task transitions and webhook delivery.
//!
//! Transitions call [`enqueue`] inside their own transaction, so an event
//! exists if and only if the state change committed. A background worker
//! claims due rows, hands them to the dispatcher and marks them processed.
//!
//! ## Resilience
//!
//! * A claim is a conditional update of `next_attempt_at`; only one worker
//!   can move it, and a crashed worker's lease simply expires.
//! * Store failures during dispatch are retried with exponential back-off,
//!   from [`INITIAL_BACKOFF_SECS`] up to [`MAX_BACKOFF_SECS`], until the
//!   configured attempt limit parks the row as failed.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OutboxConfig;
use crate::errors::{AppError, Result};
use crate::events::{EventEnvelope, TaskEventKind};
use crate::quota;
use crate::tasks::Task;
use crate::webhooks::dispatch::{self, OutgoingEvent};

const MAX_BACKOFF_SECS: i64 = 60;
const INITIAL_BACKOFF_SECS: i64 = 2;

/// How long a claimed row stays invisible to other workers.
const LEASE_SECS: i64 = 120;

/// Minute-window quota rows older than this are pruned.
const MINUTE_WINDOW_RETENTION_SECS: i64 = 24 * 60 * 60;
const PRUNE_INTERVAL_SECS: i64 = 60 * 60;

pub struct OutboxState {
    pub pool: SqlitePool,
    pub config: OutboxConfig,
    pub client: Client,
}

/// Queue `kind` for `task`. Must run on the transaction that changed the task.
pub async fn enqueue(
    conn: &mut SqliteConnection,
    kind: TaskEventKind,
    task: &Task,
    now: i64,
) -> Result<String> {
    let envelope = EventEnvelope::new(kind, task, now);
    let payload = serde_json::to_string(&envelope)?;
    sqlx::query(
        r#"
        INSERT INTO outbox_events (event_id, event_type, task_id, payload, created_at, next_attempt_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?5)
        "#,
    )
    .bind(&envelope.id)
    .bind(kind.as_str())
    .bind(&task.id)
    .bind(&payload)
    .bind(now)
    .execute(conn)
    .await?;
    debug!(event_id = %envelope.id, task_id = %task.id, event_type = kind.as_str(), "Event queued");
    Ok(envelope.id)
}

/// Delay before retry number `attempts` (1-based).
pub fn backoff_secs(attempts: i64) -> i64 {
    let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
    INITIAL_BACKOFF_SECS
        .saturating_mul(1_i64 << exponent)
        .min(MAX_BACKOFF_SECS)
}

#[derive(Debug, Clone, FromRow)]
struct OutboxRow {
    id: i64,
    event_id: String,
    event_type: String,
    task_id: String,
    payload: String,
    attempts: i64,
    next_attempt_at: i64,
}

impl OutboxRow {
    fn to_event(&self) -> Result<OutgoingEvent> {
        let kind = TaskEventKind::parse(&self.event_type).ok_or_else(|| {
            AppError::Internal(format!(
                "outbox row {} has unknown event type {}",
                self.id, self.event_type
            ))
        })?;
        Ok(OutgoingEvent {
            event_id: self.event_id.clone(),
            kind,
            task_id: self.task_id.clone(),
            payload: self.payload.clone(),
        })
    }
}

/// Claim up to `batch` due rows by pushing their lease forward.
async fn claim_due(pool: &SqlitePool, batch: i64, now: i64) -> Result<Vec<OutboxRow>> {
    let due = sqlx::query_as::<_, OutboxRow>(
        r#"
        SELECT id, event_id, event_type, task_id, payload, attempts, next_attempt_at
        FROM   outbox_events
        WHERE  processed_at IS NULL AND failed_at IS NULL AND next_attempt_at <= ?1
        ORDER  BY id
        LIMIT  ?2
        "#,
    )
    .bind(now)
    .bind(batch)
    .fetch_all(pool)
    .await?;

    let mut claimed = Vec::with_capacity(due.len());
    for row in due {
        let won = sqlx::query(
            r#"
            UPDATE outbox_events
            SET    next_attempt_at = ?1
            WHERE  id = ?2 AND next_attempt_at = ?3 AND processed_at IS NULL AND failed_at IS NULL
            "#,
        )
        .bind(now + LEASE_SECS)
        .bind(row.id)
        .bind(row.next_attempt_at)
        .execute(pool)
        .await?
        .rows_affected();
        if won == 1 {
            claimed.push(row);
        }
    }
    Ok(claimed)
}

async fn mark_processed(pool: &SqlitePool, id: i64, now: i64) -> Result<()> {
    sqlx::query("UPDATE outbox_events SET processed_at = ?1 WHERE id = ?2")
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn mark_retry(
    pool: &SqlitePool,
    row: &OutboxRow,
    err: &AppError,
    max_attempts: i64,
    now: i64,
) -> Result<()> {
    let attempts = row.attempts + 1;
    if attempts >= max_attempts {
        error!(event_id = %row.event_id, attempts, "Outbox event parked after repeated failures: {err}");
        sqlx::query(
            "UPDATE outbox_events SET attempts = ?1, last_error = ?2, failed_at = ?3 WHERE id = ?4",
        )
        .bind(attempts)
        .bind(err.to_string())
        .bind(now)
        .bind(row.id)
        .execute(pool)
        .await?;
        return Ok(());
    }

    let delay = backoff_secs(attempts);
    warn!(event_id = %row.event_id, attempts, "Outbox dispatch failed (will retry in {delay}s): {err}");
    sqlx::query(
        "UPDATE outbox_events SET attempts = ?1, last_error = ?2, next_attempt_at = ?3 WHERE id = ?4",
    )
    .bind(attempts)
    .bind(err.to_string())
    .bind(now + delay)
    .bind(row.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Process one batch of due events. Returns how many were handled.
pub async fn drain_once(state: &OutboxState, now: i64) -> Result<usize> {
    let rows = claim_due(&state.pool, state.config.batch_size, now).await?;
    let timeout = Duration::from_secs(state.config.webhook_timeout_secs);

    for row in &rows {
        let outcome = match row.to_event() {
            Ok(event) => dispatch::dispatch(&state.pool, &state.client, timeout, &event, now).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(_) => mark_processed(&state.pool, row.id, now).await?,
            Err(e) => mark_retry(&state.pool, row, &e, state.config.max_attempts, now).await?,
        }
    }
    Ok(rows.len())
}

/// Worker loop. Polls until `shutdown` is cancelled.
pub async fn run(state: Arc<OutboxState>, shutdown: CancellationToken) {
    info!(
        "Outbox worker starting (poll every {}s, batch {})",
        state.config.poll_interval_secs, state.config.batch_size
    );
    let mut last_prune = 0_i64;

    loop {
        let now = crate::db::now();
        match drain_once(&state, now).await {
            Ok(0) => {}
            Ok(n) => debug!("Outbox drained {n} events"),
            Err(e) => error!("Outbox poll error: {e}"),
        }

        if now - last_prune >= PRUNE_INTERVAL_SECS {
            match quota::prune_minute_windows(&state.pool, now - MINUTE_WINDOW_RETENTION_SECS).await {
                Ok(removed) if removed > 0 => info!("Pruned {removed} expired minute-window rows"),
                Ok(_) => {}
                Err(e) => warn!("Minute-window pruning failed: {e}"),
            }
            last_prune = now;
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Outbox worker stopped");
                return;
            }
            _ = tokio::time::sleep(Duration::from_secs(state.config.poll_interval_secs)) => {}
        }
    }
}
