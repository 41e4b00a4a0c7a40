//! Task transitions.
//!
//! ```text
//! open ──accept──▶ accepted ──submit──▶ review_pending ──approve──▶ completed
//!  ▲                 │  │                                              ▲
//!  └──────skip───────┘  └───────────────submit (no review)─────────────┘
//! open | accepted ──timeout / cancel──▶ failed
//! ```
//!
//! Every write is an `UPDATE … WHERE status = <observed>`. A caller that
//! affects zero rows lost a race: it re-reads and reports a conflict. Worker
//! status, contact channels and the outbox row for the emitted event are
//! written in the same transaction as the task row.

use serde::Deserialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::auth::AuthContext;
use crate::config::FeePolicy;
use crate::db;
use crate::errors::{AppError, Result};
use crate::events::TaskEventKind;
use crate::payments::fees::calculate_payout;
use crate::tasks::{
    fetch_human, fetch_task, DeliverableKind, FailureReason, PaymentStatus, Task, TaskStatus,
};
use crate::webhooks::outbox;

const MAX_DESCRIPTION_LEN: usize = 4_000;

// ─────────────────────────────────────────────────────────
// Reads and lazy timeout
// ─────────────────────────────────────────────────────────

/// Read a visible task, failing it first if its deadline has passed.
pub async fn load_task(pool: &SqlitePool, id: &str, now: i64) -> Result<Task> {
    let task = fetch_task(pool, id)
        .await?
        .filter(|t| t.deleted_at.is_none())
        .ok_or(AppError::NotFound("not_found"))?;
    settle_overdue(pool, task, now).await
}

/// Persist the timeout of an overdue task. Exactly one concurrent caller
/// wins the conditional update and emits `task.failed`; the rest re-read.
pub async fn settle_overdue(pool: &SqlitePool, task: Task, now: i64) -> Result<Task> {
    if !task.is_overdue(now) {
        return Ok(task);
    }

    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        r#"
        UPDATE tasks
        SET    status = 'failed', failure_reason = 'timeout', updated_at = ?1
        WHERE  id = ?2 AND status IN ('open', 'accepted')
        "#,
    )
    .bind(now)
    .bind(&task.id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        tx.rollback().await?;
        debug!(task_id = %task.id, "Timeout already applied by another reader");
        return fetch_task(pool, &task.id)
            .await?
            .ok_or(AppError::NotFound("not_found"));
    }

    if let Some(human_id) = task.human_id.as_deref() {
        free_worker(&mut tx, human_id).await?;
    }
    close_channels(&mut tx, &task.id, now).await?;
    let failed = emit(&mut tx, TaskEventKind::Failed, &task.id, now).await?;
    tx.commit().await?;

    info!(task_id = %task.id, "Task timed out");
    Ok(failed)
}

// ─────────────────────────────────────────────────────────
// Shared writes
// ─────────────────────────────────────────────────────────

async fn free_worker(conn: &mut SqliteConnection, human_id: &str) -> Result<()> {
    sqlx::query("UPDATE humans SET status = 'available' WHERE id = ?1")
        .bind(human_id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn close_channels(conn: &mut SqliteConnection, task_id: &str, now: i64) -> Result<()> {
    sqlx::query(
        "UPDATE contact_channels SET status = 'closed', closed_at = ?1 \
         WHERE task_id = ?2 AND status = 'open'",
    )
    .bind(now)
    .bind(task_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Re-read the task inside the transaction and queue its event.
async fn emit(
    conn: &mut SqliteConnection,
    kind: TaskEventKind,
    task_id: &str,
    now: i64,
) -> Result<Task> {
    let task = fetch_task(&mut *conn, task_id)
        .await?
        .ok_or_else(|| AppError::Internal(format!("task {task_id} vanished mid-transaction")))?;
    outbox::enqueue(conn, kind, &task, now).await?;
    Ok(task)
}

/// Move to `completed` with an approved payout breakdown.
async fn mark_completed(
    conn: &mut SqliteConnection,
    task: &Task,
    from: TaskStatus,
    fees: &FeePolicy,
    now: i64,
) -> Result<u64> {
    let payout = calculate_payout(task.budget_usd, 0.0, fees.platform_fee_rate());
    let updated = sqlx::query(
        r#"
        UPDATE tasks
        SET    status = 'completed', payment_status = 'approved', fee_rate = ?1,
               platform_fee = ?2, processor_fee = ?3, net_payout = ?4, updated_at = ?5
        WHERE  id = ?6 AND status = ?7
        "#,
    )
    .bind(payout.fee_rate)
    .bind(payout.platform_fee)
    .bind(payout.processor_fee)
    .bind(payout.net_payout)
    .bind(now)
    .bind(&task.id)
    .bind(from.as_str())
    .execute(conn)
    .await?
    .rows_affected();
    Ok(updated)
}

/// Conflict reason for a worker acting on a task that is no longer theirs to take.
fn unavailable(task: &Task, human_id: &str) -> AppError {
    match task.status {
        TaskStatus::Completed => AppError::Conflict("already_completed"),
        TaskStatus::Failed => match task.failure_reason {
            Some(FailureReason::Timeout) => AppError::Conflict("timeout"),
            _ => AppError::Conflict("task_cancelled"),
        },
        TaskStatus::ReviewPending if task.is_assigned_to(human_id) => {
            AppError::Conflict("already_submitted")
        }
        TaskStatus::ReviewPending | TaskStatus::Accepted => AppError::Conflict("already_assigned"),
        TaskStatus::Open => AppError::Conflict("state_changed"),
    }
}

// ─────────────────────────────────────────────────────────
// Create
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    pub description: Option<String>,
    pub description_display: Option<String>,
    pub origin_country: Option<String>,
    pub budget_usd: Option<f64>,
    pub quote_amount_minor: Option<i64>,
    pub quote_currency: Option<String>,
    pub deliverable: Option<String>,
    pub deadline_at: Option<i64>,
    pub deadline_minutes: Option<i64>,
    #[serde(default)]
    pub review_required: bool,
}

struct ValidTask {
    description: String,
    description_display: Option<String>,
    origin_country: String,
    budget_usd: f64,
    quote: Option<(i64, String)>,
    deliverable: DeliverableKind,
    deadline_at: Option<i64>,
    deadline_minutes: Option<i64>,
    review_required: bool,
}

impl NewTask {
    fn validate(self, now: i64) -> Result<ValidTask> {
        let description = self
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .ok_or(AppError::Validation("missing_description"))?;
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(AppError::invalid_field("description", "too long"));
        }

        let origin_country = self
            .origin_country
            .map(|c| c.trim().to_ascii_uppercase())
            .ok_or(AppError::Validation("missing_origin_country"))?;
        if origin_country.len() != 2 || !origin_country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(AppError::invalid_field(
                "origin_country",
                "expected ISO 3166-1 alpha-2 code",
            ));
        }

        let budget_usd = self
            .budget_usd
            .ok_or(AppError::Validation("missing_budget"))?;
        if !budget_usd.is_finite() || budget_usd <= 0.0 {
            return Err(AppError::invalid_field("budget_usd", "must be a positive amount"));
        }

        let quote = match (self.quote_amount_minor, self.quote_currency) {
            (None, None) => None,
            (Some(amount), Some(currency)) => {
                let currency = currency.trim().to_ascii_uppercase();
                if amount <= 0 {
                    return Err(AppError::invalid_field("quote_amount_minor", "must be positive"));
                }
                if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
                    return Err(AppError::invalid_field("quote_currency", "expected ISO 4217 code"));
                }
                Some((amount, currency))
            }
            _ => {
                return Err(AppError::invalid_field(
                    "quote_currency",
                    "quote_amount_minor and quote_currency go together",
                ))
            }
        };

        let deliverable = self
            .deliverable
            .as_deref()
            .map(str::trim)
            .ok_or(AppError::Validation("missing_deliverable"))
            .and_then(|raw| {
                DeliverableKind::parse(raw).ok_or(AppError::Validation("invalid_deliverable"))
            })?;

        let (deadline_at, deadline_minutes) = match (self.deadline_at, self.deadline_minutes) {
            (Some(at), _) if at <= now => {
                return Err(AppError::invalid_field("deadline_at", "must be in the future"))
            }
            (Some(at), _) => (Some(at), None),
            (None, Some(minutes)) if minutes <= 0 => {
                return Err(AppError::invalid_field("deadline_minutes", "must be positive"))
            }
            (None, minutes) => (None, minutes),
        };

        Ok(ValidTask {
            description,
            description_display: self.description_display.filter(|d| !d.trim().is_empty()),
            origin_country,
            budget_usd,
            quote,
            deliverable,
            deadline_at,
            deadline_minutes,
            review_required: self.review_required,
        })
    }
}

pub async fn create_task(
    pool: &SqlitePool,
    auth: &AuthContext,
    request: NewTask,
    now: i64,
) -> Result<Task> {
    auth.require_requester()?;
    let task = request.validate(now)?;
    let (requester_human_id, ai_account_id) = match auth {
        AuthContext::Agent { account_id, .. } => (None, Some(account_id.as_str())),
        AuthContext::Human { human_id } => (Some(human_id.as_str()), None),
        AuthContext::Admin | AuthContext::Anonymous => {
            return Err(AppError::Unauthorized("authentication_required"))
        }
    };
    let id = db::new_id("task");
    let (quote_amount_minor, quote_currency) = match task.quote {
        Some((amount, currency)) => (Some(amount), Some(currency)),
        None => (None, None),
    };

    sqlx::query(
        r#"
        INSERT INTO tasks (
            id, description, description_display, origin_country, budget_usd,
            quote_amount_minor, quote_currency, deliverable, deadline_at, deadline_minutes,
            review_required, status, payment_status, requester_human_id, ai_account_id,
            created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'open', 'pending', ?12, ?13, ?14, ?14)
        "#,
    )
    .bind(&id)
    .bind(&task.description)
    .bind(&task.description_display)
    .bind(&task.origin_country)
    .bind(task.budget_usd)
    .bind(quote_amount_minor)
    .bind(&quote_currency)
    .bind(task.deliverable.as_str())
    .bind(task.deadline_at)
    .bind(task.deadline_minutes)
    .bind(task.review_required)
    .bind(requester_human_id)
    .bind(ai_account_id)
    .bind(now)
    .execute(pool)
    .await?;

    info!(task_id = %id, requester = %auth.tenant_scope(), "Task created");
    fetch_task(pool, &id)
        .await?
        .ok_or_else(|| AppError::Internal(format!("task {id} missing after insert")))
}

// ─────────────────────────────────────────────────────────
// Worker transitions
// ─────────────────────────────────────────────────────────

pub async fn accept(pool: &SqlitePool, auth: &AuthContext, task_id: &str, now: i64) -> Result<Task> {
    let human_id = auth.human_id()?;
    let task = load_task(pool, task_id, now).await?;
    if task.status == TaskStatus::Accepted && task.is_assigned_to(human_id) {
        return Ok(task);
    }
    if task.status != TaskStatus::Open {
        return Err(unavailable(&task, human_id));
    }

    let human = fetch_human(pool, human_id)
        .await?
        .ok_or(AppError::NotFound("human_not_found"))?;
    if !human.has_payout_destination() {
        return Err(AppError::Validation("payout_not_configured"));
    }

    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        r#"
        UPDATE tasks
        SET    status = 'accepted', human_id = ?1, payout_destination = ?2, updated_at = ?3
        WHERE  id = ?4 AND status = 'open' AND human_id IS NULL AND deleted_at IS NULL
        "#,
    )
    .bind(human_id)
    .bind(&human.payout_destination)
    .bind(now)
    .bind(task_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        tx.rollback().await?;
        let current = load_task(pool, task_id, now).await?;
        if current.status == TaskStatus::Accepted && current.is_assigned_to(human_id) {
            return Ok(current);
        }
        return Err(unavailable(&current, human_id));
    }

    sqlx::query("UPDATE humans SET status = 'busy' WHERE id = ?1")
        .bind(human_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO contact_channels (task_id, human_id, status, created_at)
        VALUES (?1, ?2, 'open', ?3)
        ON CONFLICT(task_id, human_id) DO UPDATE SET status = 'open', closed_at = NULL
        "#,
    )
    .bind(task_id)
    .bind(human_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    let accepted = emit(&mut tx, TaskEventKind::Accepted, task_id, now).await?;
    tx.commit().await?;

    info!(task_id, human_id, "Task accepted");
    Ok(accepted)
}

/// Release the caller's assignment. An accepted task reopens; a timed-out
/// task only drops the binding, since its deadline has already passed.
pub async fn skip(pool: &SqlitePool, auth: &AuthContext, task_id: &str, now: i64) -> Result<Task> {
    let human_id = auth.human_id()?;
    let task = load_task(pool, task_id, now).await?;
    match task.status {
        TaskStatus::ReviewPending => return Err(AppError::Conflict("already_submitted")),
        TaskStatus::Completed => return Err(AppError::Conflict("already_completed")),
        TaskStatus::Open if task.human_id.is_none() => return Ok(task),
        TaskStatus::Open | TaskStatus::Accepted | TaskStatus::Failed => {}
    }
    if !task.is_assigned_to(human_id) {
        return Err(AppError::Conflict("not_assigned"));
    }
    if task.status == TaskStatus::Failed && task.failure_reason != Some(FailureReason::Timeout) {
        return Err(AppError::Conflict("task_cancelled"));
    }

    let next = if task.status == TaskStatus::Failed {
        TaskStatus::Failed
    } else {
        TaskStatus::Open
    };

    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        r#"
        UPDATE tasks
        SET    status = ?1, human_id = NULL, payout_destination = NULL, updated_at = ?2
        WHERE  id = ?3 AND status = ?4 AND human_id = ?5
        "#,
    )
    .bind(next.as_str())
    .bind(now)
    .bind(task_id)
    .bind(task.status.as_str())
    .bind(human_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        tx.rollback().await?;
        return Err(AppError::Conflict("state_changed"));
    }
    if task.status == TaskStatus::Accepted {
        free_worker(&mut tx, human_id).await?;
    }
    close_channels(&mut tx, task_id, now).await?;
    let released = fetch_task(&mut *tx, task_id)
        .await?
        .ok_or(AppError::NotFound("not_found"))?;
    tx.commit().await?;

    info!(task_id, human_id, status = next.as_str(), "Task released");
    Ok(released)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Deliverable {
    #[serde(alias = "type")]
    pub kind: Option<String>,
    pub content: Option<String>,
}

pub async fn submit(
    pool: &SqlitePool,
    auth: &AuthContext,
    task_id: &str,
    deliverable: Deliverable,
    fees: &FeePolicy,
    now: i64,
) -> Result<Task> {
    let human_id = auth.human_id()?;
    let (Some(kind), Some(content)) = (
        deliverable.kind.as_deref().map(str::trim).filter(|k| !k.is_empty()),
        deliverable.content.filter(|c| !c.trim().is_empty()),
    ) else {
        return Err(AppError::Validation("missing_deliverable"));
    };
    let kind = DeliverableKind::parse(kind).ok_or(AppError::Validation("wrong_deliverable"))?;

    let task = load_task(pool, task_id, now).await?;
    match task.status {
        TaskStatus::Accepted if task.is_assigned_to(human_id) => {}
        TaskStatus::Accepted | TaskStatus::Open => return Err(AppError::Conflict("not_assigned")),
        _ => return Err(unavailable(&task, human_id)),
    }
    if kind != task.deliverable {
        return Err(AppError::Validation("wrong_deliverable"));
    }

    let mut tx = pool.begin().await?;
    let updated = if task.review_required {
        sqlx::query(
            "UPDATE tasks SET status = 'review_pending', updated_at = ?1 \
             WHERE id = ?2 AND status = 'accepted' AND human_id = ?3",
        )
        .bind(now)
        .bind(task_id)
        .bind(human_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
    } else {
        mark_completed(&mut tx, &task, TaskStatus::Accepted, fees, now).await?
    };
    if updated == 0 {
        tx.rollback().await?;
        let current = load_task(pool, task_id, now).await?;
        return Err(unavailable(&current, human_id));
    }

    sqlx::query(
        "INSERT INTO submissions (id, task_id, human_id, kind, content, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(db::new_id("sub"))
    .bind(task_id)
    .bind(human_id)
    .bind(kind.as_str())
    .bind(&content)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    free_worker(&mut tx, human_id).await?;

    let submitted = if task.review_required {
        fetch_task(&mut *tx, task_id)
            .await?
            .ok_or(AppError::NotFound("not_found"))?
    } else {
        close_channels(&mut tx, task_id, now).await?;
        emit(&mut tx, TaskEventKind::Completed, task_id, now).await?
    };
    tx.commit().await?;

    info!(task_id, human_id, status = submitted.status.as_str(), "Deliverable submitted");
    Ok(submitted)
}

// ─────────────────────────────────────────────────────────
// Requester transitions
// ─────────────────────────────────────────────────────────

pub async fn approve_review(
    pool: &SqlitePool,
    auth: &AuthContext,
    task_id: &str,
    fees: &FeePolicy,
    now: i64,
) -> Result<Task> {
    let task = load_task(pool, task_id, now).await?;
    if !task.is_requested_by(auth) {
        return Err(AppError::Forbidden("not_requester"));
    }
    match task.status {
        TaskStatus::ReviewPending => {}
        TaskStatus::Completed => return Err(AppError::Conflict("already_completed")),
        _ => return Err(AppError::Conflict("not_in_review")),
    }

    let mut tx = pool.begin().await?;
    if mark_completed(&mut tx, &task, TaskStatus::ReviewPending, fees, now).await? == 0 {
        tx.rollback().await?;
        return Err(AppError::Conflict("state_changed"));
    }
    close_channels(&mut tx, task_id, now).await?;
    let completed = emit(&mut tx, TaskEventKind::Completed, task_id, now).await?;
    tx.commit().await?;

    info!(task_id, "Review approved");
    Ok(completed)
}

pub async fn cancel(pool: &SqlitePool, auth: &AuthContext, task_id: &str, now: i64) -> Result<Task> {
    let task = load_task(pool, task_id, now).await?;
    if !task.is_requested_by(auth) {
        return Err(AppError::Forbidden("not_requester"));
    }
    match task.status {
        TaskStatus::Open | TaskStatus::Accepted => {}
        TaskStatus::Failed => return Err(AppError::Conflict("already_failed")),
        TaskStatus::ReviewPending => return Err(AppError::Conflict("already_submitted")),
        TaskStatus::Completed => return Err(AppError::Conflict("already_completed")),
    }

    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        r#"
        UPDATE tasks
        SET    status = 'failed', failure_reason = 'cancelled', updated_at = ?1
        WHERE  id = ?2 AND status = ?3
        "#,
    )
    .bind(now)
    .bind(task_id)
    .bind(task.status.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        tx.rollback().await?;
        return Err(AppError::Conflict("state_changed"));
    }
    if let Some(human_id) = task.human_id.as_deref() {
        free_worker(&mut tx, human_id).await?;
    }
    close_channels(&mut tx, task_id, now).await?;
    let cancelled = emit(&mut tx, TaskEventKind::Failed, task_id, now).await?;
    tx.commit().await?;

    info!(task_id, "Task cancelled by requester");
    Ok(cancelled)
}

pub async fn soft_delete(pool: &SqlitePool, auth: &AuthContext, task_id: &str, now: i64) -> Result<()> {
    let task = load_task(pool, task_id, now).await?;
    if !task.is_requested_by(auth) {
        return Err(AppError::Forbidden("not_requester"));
    }
    let updated = sqlx::query(
        "UPDATE tasks SET deleted_at = ?1, updated_at = ?1 \
         WHERE id = ?2 AND status = 'open' AND human_id IS NULL AND deleted_at IS NULL",
    )
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(AppError::Conflict("not_deletable"));
    }
    info!(task_id, "Task soft-deleted");
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Admin
// ─────────────────────────────────────────────────────────

/// Undo a soft delete and reopen a failed task. A failed task whose deadline
/// has passed needs a fresh relative deadline or it would time out again.
pub async fn admin_restore(
    pool: &SqlitePool,
    auth: &AuthContext,
    task_id: &str,
    deadline_minutes: Option<i64>,
    now: i64,
) -> Result<Task> {
    auth.require_admin()?;
    let task = fetch_task(pool, task_id)
        .await?
        .ok_or(AppError::NotFound("not_found"))?;
    if let Some(minutes) = deadline_minutes {
        if minutes <= 0 {
            return Err(AppError::invalid_field("deadline_minutes", "must be positive"));
        }
    }
    let expired = task
        .effective_deadline()
        .map(|deadline| deadline < now)
        .unwrap_or(false);
    if task.status == TaskStatus::Failed && expired && deadline_minutes.is_none() {
        return Err(AppError::Validation("deadline_required"));
    }
    let new_deadline = deadline_minutes.map(|minutes| now + minutes * 60);

    let updated = sqlx::query(
        r#"
        UPDATE tasks
        SET    deleted_at         = NULL,
               status             = CASE WHEN status = 'failed' THEN 'open' ELSE status END,
               human_id           = CASE WHEN status = 'failed' THEN NULL ELSE human_id END,
               payout_destination = CASE WHEN status = 'failed' THEN NULL ELSE payout_destination END,
               failure_reason     = NULL,
               deadline_at        = COALESCE(?1, deadline_at),
               deadline_minutes   = CASE WHEN ?1 IS NULL THEN deadline_minutes ELSE NULL END,
               updated_at         = ?2
        WHERE  id = ?3 AND status = ?4
        "#,
    )
    .bind(new_deadline)
    .bind(now)
    .bind(task_id)
    .bind(task.status.as_str())
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(AppError::Conflict("state_changed"));
    }

    info!(task_id, previous = task.status.as_str(), "Task restored by admin");
    fetch_task(pool, task_id)
        .await?
        .ok_or(AppError::NotFound("not_found"))
}

/// Record the externally settled payout for a completed task.
pub async fn settle_payout(
    pool: &SqlitePool,
    auth: &AuthContext,
    task_id: &str,
    processor_fee: f64,
    failed: bool,
    fees: &FeePolicy,
    now: i64,
) -> Result<Task> {
    auth.require_admin()?;
    if !processor_fee.is_finite() || processor_fee < 0.0 {
        return Err(AppError::invalid_field("processor_fee", "must be a non-negative amount"));
    }
    let task = load_task(pool, task_id, now).await?;
    if task.status != TaskStatus::Completed {
        return Err(AppError::Conflict("task_not_completed"));
    }
    match task.payment.status {
        PaymentStatus::Approved => {}
        PaymentStatus::Paid => return Err(AppError::Conflict("already_paid")),
        PaymentStatus::Pending | PaymentStatus::Failed => {
            return Err(AppError::Conflict("payout_not_approved"))
        }
    }

    let payout = calculate_payout(task.budget_usd, processor_fee, fees.platform_fee_rate());
    let next = if failed {
        PaymentStatus::Failed
    } else {
        PaymentStatus::Paid
    };
    let updated = sqlx::query(
        r#"
        UPDATE tasks
        SET    payment_status = ?1, fee_rate = ?2, platform_fee = ?3, processor_fee = ?4,
               net_payout = ?5, updated_at = ?6
        WHERE  id = ?7 AND payment_status = 'approved'
        "#,
    )
    .bind(next.as_str())
    .bind(payout.fee_rate)
    .bind(payout.platform_fee)
    .bind(payout.processor_fee)
    .bind(payout.net_payout)
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(AppError::Conflict("state_changed"));
    }

    info!(
        task_id,
        payment_status = next.as_str(),
        net_payout = payout.net_payout,
        "Payout settled"
    );
    load_task(pool, task_id, now).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{test_pool, FileTestDb};
    use crate::tasks::set_payout_destination;

    pub(crate) fn agent(account_id: &str) -> AuthContext {
        AuthContext::Agent {
            account_id: account_id.into(),
            quota: None,
        }
    }

    pub(crate) fn human(id: &str) -> AuthContext {
        AuthContext::Human {
            human_id: id.into(),
        }
    }

    pub(crate) fn photo_task() -> NewTask {
        NewTask {
            description: Some("Photo of the storefront at 5th and Main".into()),
            origin_country: Some("us".into()),
            budget_usd: Some(5.0),
            deliverable: Some("photo".into()),
            deadline_minutes: Some(60),
            ..NewTask::default()
        }
    }

    async fn worker(pool: &SqlitePool, id: &str) -> AuthContext {
        set_payout_destination(pool, id, &format!("acct_{id}"), Some("US"))
            .await
            .unwrap();
        human(id)
    }

    async fn outbox_count(pool: &SqlitePool, task_id: &str, kind: &str) -> i64 {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM outbox_events WHERE task_id = ?1 AND event_type = ?2",
        )
        .bind(task_id)
        .bind(kind)
        .fetch_one(pool)
        .await
        .unwrap();
        count
    }

    async fn human_status(pool: &SqlitePool, id: &str) -> String {
        fetch_human(pool, id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn create_validates_input() {
        let pool = test_pool().await;
        let requester = agent("acct_a");

        let mut missing = photo_task();
        missing.description = Some("   ".into());
        let err = create_task(&pool, &requester, missing, 100).await.unwrap_err();
        assert_eq!(err.reason(), "missing_description");

        let mut bad_kind = photo_task();
        bad_kind.deliverable = Some("hologram".into());
        let err = create_task(&pool, &requester, bad_kind, 100).await.unwrap_err();
        assert_eq!(err.reason(), "invalid_deliverable");

        let mut past = photo_task();
        past.deadline_at = Some(50);
        let err = create_task(&pool, &requester, past, 100).await.unwrap_err();
        assert_eq!(err.reason(), "invalid_request");

        let err = create_task(&pool, &AuthContext::Anonymous, photo_task(), 100)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "authentication_required");

        let task = create_task(&pool, &requester, photo_task(), 100).await.unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.origin_country, "US");
        assert_eq!(task.ai_account_id.as_deref(), Some("acct_a"));
        assert_eq!(task.payment.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn accept_binds_worker_and_queues_event() {
        let pool = test_pool().await;
        let task = create_task(&pool, &agent("acct_a"), photo_task(), 100).await.unwrap();
        let b = worker(&pool, "human_b").await;

        let accepted = accept(&pool, &b, &task.id, 110).await.unwrap();
        assert_eq!(accepted.status, TaskStatus::Accepted);
        assert_eq!(accepted.human_id.as_deref(), Some("human_b"));
        assert_eq!(accepted.payout_destination.as_deref(), Some("acct_human_b"));
        assert_eq!(human_status(&pool, "human_b").await, "busy");
        assert_eq!(outbox_count(&pool, &task.id, "task.accepted").await, 1);

        // Same worker again is a no-op.
        accept(&pool, &b, &task.id, 111).await.unwrap();
        assert_eq!(outbox_count(&pool, &task.id, "task.accepted").await, 1);

        let c = worker(&pool, "human_c").await;
        let err = accept(&pool, &c, &task.id, 112).await.unwrap_err();
        assert_eq!(err.reason(), "already_assigned");
    }

    #[tokio::test]
    async fn accept_requires_payout_destination() {
        let pool = test_pool().await;
        let task = create_task(&pool, &agent("acct_a"), photo_task(), 100).await.unwrap();
        let err = accept(&pool, &human("ghost"), &task.id, 110).await.unwrap_err();
        assert_eq!(err.reason(), "human_not_found");

        sqlx::query("INSERT INTO humans (id) VALUES ('human_nopay')")
            .execute(&pool)
            .await
            .unwrap();
        let err = accept(&pool, &human("human_nopay"), &task.id, 110)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "payout_not_configured");
    }

    #[tokio::test]
    async fn overdue_task_times_out_exactly_once() {
        let pool = test_pool().await;
        let task = create_task(&pool, &agent("acct_a"), photo_task(), 100).await.unwrap();
        let b = worker(&pool, "human_b").await;
        accept(&pool, &b, &task.id, 110).await.unwrap();

        let after_deadline = 100 + 60 * 60 + 1;
        let mut readers = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let id = task.id.clone();
            readers.spawn(async move { load_task(&pool, &id, after_deadline).await });
        }
        while let Some(read) = readers.join_next().await {
            let seen = read.unwrap().unwrap();
            assert_eq!(seen.status, TaskStatus::Failed);
            assert_eq!(seen.failure_reason, Some(FailureReason::Timeout));
        }

        assert_eq!(outbox_count(&pool, &task.id, "task.failed").await, 1);
        assert_eq!(human_status(&pool, "human_b").await, "available");
        let (open_channels,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM contact_channels WHERE task_id = ?1 AND status = 'open'",
        )
        .bind(&task.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(open_channels, 0);

        let err = submit(
            &pool,
            &b,
            &task.id,
            Deliverable {
                kind: Some("photo".into()),
                content: Some("https://cdn/x.jpg".into()),
            },
            &FeePolicy::default(),
            after_deadline + 1,
        )
        .await
        .unwrap_err();
        assert_eq!(err.reason(), "timeout");
    }

    #[tokio::test]
    async fn timeout_is_settled_once_across_connections() {
        let db = FileTestDb::open(8).await;
        let pool = &db.pool;
        let task = create_task(pool, &agent("acct_a"), photo_task(), 100).await.unwrap();
        let b = worker(pool, "human_b").await;
        accept(pool, &b, &task.id, 110).await.unwrap();

        let after_deadline = 100 + 60 * 60 + 1;
        let mut readers = tokio::task::JoinSet::new();
        for i in 0..16 {
            let pool = pool.clone();
            let id = task.id.clone();
            readers.spawn(async move { load_task(&pool, &id, after_deadline + i % 3).await });
        }
        while let Some(read) = readers.join_next().await {
            let seen = read.unwrap().unwrap();
            assert_eq!(seen.status, TaskStatus::Failed);
            assert_eq!(seen.failure_reason, Some(FailureReason::Timeout));
        }

        assert_eq!(outbox_count(pool, &task.id, "task.failed").await, 1);
        assert_eq!(human_status(pool, "human_b").await, "available");
    }

    #[tokio::test]
    async fn submit_checks_kind_then_completes() {
        let pool = test_pool().await;
        let task = create_task(&pool, &agent("acct_a"), photo_task(), 100).await.unwrap();
        let b = worker(&pool, "human_b").await;
        accept(&pool, &b, &task.id, 110).await.unwrap();

        let wrong = Deliverable {
            kind: Some("video".into()),
            content: Some("https://cdn/x.mp4".into()),
        };
        let err = submit(&pool, &b, &task.id, wrong, &FeePolicy::default(), 120)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "wrong_deliverable");
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);

        let err = submit(&pool, &b, &task.id, Deliverable::default(), &FeePolicy::default(), 120)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "missing_deliverable");

        let right = Deliverable {
            kind: Some("photo".into()),
            content: Some("https://cdn/x.jpg".into()),
        };
        let done = submit(&pool, &b, &task.id, right.clone(), &FeePolicy::default(), 121)
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.payment.status, PaymentStatus::Approved);
        assert_eq!(done.payment.platform_fee, Some(1.0));
        assert_eq!(done.payment.net_payout, Some(4.0));
        assert_eq!(human_status(&pool, "human_b").await, "available");
        assert_eq!(outbox_count(&pool, &task.id, "task.completed").await, 1);

        let err = submit(&pool, &b, &task.id, right, &FeePolicy::default(), 122)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "already_completed");
    }

    #[tokio::test]
    async fn review_flow_completes_on_approval() {
        let pool = test_pool().await;
        let requester = human("human_req");
        let mut request = photo_task();
        request.review_required = true;
        let task = create_task(&pool, &requester, request, 100).await.unwrap();
        let b = worker(&pool, "human_b").await;
        accept(&pool, &b, &task.id, 110).await.unwrap();

        let pending = submit(
            &pool,
            &b,
            &task.id,
            Deliverable {
                kind: Some("photo".into()),
                content: Some("https://cdn/x.jpg".into()),
            },
            &FeePolicy::default(),
            120,
        )
        .await
        .unwrap();
        assert_eq!(pending.status, TaskStatus::ReviewPending);
        assert_eq!(outbox_count(&pool, &task.id, "task.completed").await, 0);

        // Past the deadline, review_pending does not time out.
        let late = 100 + 2 * 60 * 60;
        let err = approve_review(&pool, &b, &task.id, &FeePolicy::default(), late)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "not_requester");
        let done = approve_review(&pool, &requester, &task.id, &FeePolicy::default(), late)
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(outbox_count(&pool, &task.id, "task.completed").await, 1);
    }

    #[tokio::test]
    async fn skip_reopens_for_assignee_only() {
        let pool = test_pool().await;
        let task = create_task(&pool, &agent("acct_a"), photo_task(), 100).await.unwrap();
        let b = worker(&pool, "human_b").await;
        let c = worker(&pool, "human_c").await;

        // Unassigned open task: nothing to release.
        let same = skip(&pool, &c, &task.id, 105).await.unwrap();
        assert_eq!(same.status, TaskStatus::Open);

        accept(&pool, &b, &task.id, 110).await.unwrap();
        let err = skip(&pool, &c, &task.id, 111).await.unwrap_err();
        assert_eq!(err.reason(), "not_assigned");

        let reopened = skip(&pool, &b, &task.id, 112).await.unwrap();
        assert_eq!(reopened.status, TaskStatus::Open);
        assert_eq!(reopened.human_id, None);
        assert_eq!(human_status(&pool, "human_b").await, "available");

        accept(&pool, &c, &task.id, 113).await.unwrap();
    }

    #[tokio::test]
    async fn skip_after_timeout_drops_binding_only() {
        let pool = test_pool().await;
        let task = create_task(&pool, &agent("acct_a"), photo_task(), 100).await.unwrap();
        let b = worker(&pool, "human_b").await;
        accept(&pool, &b, &task.id, 110).await.unwrap();

        let late = 100 + 60 * 60 + 5;
        let released = skip(&pool, &b, &task.id, late).await.unwrap();
        assert_eq!(released.status, TaskStatus::Failed);
        assert_eq!(released.human_id, None);
        assert_eq!(outbox_count(&pool, &task.id, "task.failed").await, 1);
    }

    #[tokio::test]
    async fn cancel_and_restore() {
        let pool = test_pool().await;
        let requester = agent("acct_a");
        let task = create_task(&pool, &requester, photo_task(), 100).await.unwrap();

        let err = cancel(&pool, &agent("acct_other"), &task.id, 101).await.unwrap_err();
        assert_eq!(err.reason(), "not_requester");
        let cancelled = cancel(&pool, &requester, &task.id, 101).await.unwrap();
        assert_eq!(cancelled.failure_reason, Some(FailureReason::Cancelled));
        let err = cancel(&pool, &requester, &task.id, 102).await.unwrap_err();
        assert_eq!(err.reason(), "already_failed");

        let err = admin_restore(&pool, &requester, &task.id, None, 103).await.unwrap_err();
        assert_eq!(err.reason(), "admin_required");
        let restored = admin_restore(&pool, &AuthContext::Admin, &task.id, None, 103)
            .await
            .unwrap();
        assert_eq!(restored.status, TaskStatus::Open);
        assert_eq!(restored.failure_reason, None);
    }

    #[tokio::test]
    async fn soft_delete_hides_until_restored() {
        let pool = test_pool().await;
        let requester = agent("acct_a");
        let task = create_task(&pool, &requester, photo_task(), 100).await.unwrap();

        soft_delete(&pool, &requester, &task.id, 101).await.unwrap();
        let err = load_task(&pool, &task.id, 102).await.unwrap_err();
        assert_eq!(err.reason(), "not_found");

        // Expired while deleted: restoring needs a new deadline.
        let late = 100 + 2 * 60 * 60;
        let restored = admin_restore(&pool, &AuthContext::Admin, &task.id, Some(30), late)
            .await
            .unwrap();
        assert_eq!(restored.deleted_at, None);
        assert_eq!(restored.effective_deadline(), Some(late + 30 * 60));
        let visible = load_task(&pool, &task.id, late + 1).await.unwrap();
        assert_eq!(visible.status, TaskStatus::Open);
    }

    #[tokio::test]
    async fn payout_settlement_uses_reported_processor_fee() {
        let pool = test_pool().await;
        let task = create_task(&pool, &agent("acct_a"), photo_task(), 100).await.unwrap();
        let b = worker(&pool, "human_b").await;
        accept(&pool, &b, &task.id, 110).await.unwrap();
        submit(
            &pool,
            &b,
            &task.id,
            Deliverable {
                kind: Some("photo".into()),
                content: Some("https://cdn/x.jpg".into()),
            },
            &FeePolicy::default(),
            120,
        )
        .await
        .unwrap();

        let paid = settle_payout(
            &pool,
            &AuthContext::Admin,
            &task.id,
            0.45,
            false,
            &FeePolicy::default(),
            130,
        )
        .await
        .unwrap();
        assert_eq!(paid.payment.status, PaymentStatus::Paid);
        assert_eq!(paid.payment.processor_fee, Some(0.45));
        assert_eq!(paid.payment.net_payout, Some(3.55));

        let err = settle_payout(
            &pool,
            &AuthContext::Admin,
            &task.id,
            0.45,
            false,
            &FeePolicy::default(),
            131,
        )
        .await
        .unwrap_err();
        assert_eq!(err.reason(), "already_paid");
    }
}
