//! Tasks: the unit of work a requester posts and a worker fulfils.
//!
//! `machine` owns every state transition, `filter` renders list queries.
//! This module holds the domain types and the row mapping shared by both.

pub mod filter;
pub mod machine;

use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite};

use crate::auth::AuthContext;
use crate::errors::{AppError, Result};

/// Effective deadline in SQL: an absolute timestamp, or minutes relative to creation.
pub const DEADLINE_SQL: &str = "COALESCE(deadline_at, created_at + deadline_minutes * 60)";

pub(crate) const TASK_COLUMNS: &str = "id, description, description_display, origin_country, \
     budget_usd, quote_amount_minor, quote_currency, deliverable, deadline_at, deadline_minutes, \
     review_required, status, failure_reason, human_id, payout_destination, requester_human_id, \
     ai_account_id, payment_status, fee_rate, platform_fee, processor_fee, net_payout, \
     deleted_at, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Accepted,
    ReviewPending,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "accepted" => Some(Self::Accepted),
            "review_pending" => Some(Self::ReviewPending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Accepted => "accepted",
            Self::ReviewPending => "review_pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// States a deadline can still expire from.
    pub fn can_time_out(&self) -> bool {
        matches!(self, Self::Open | Self::Accepted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverableKind {
    Photo,
    Video,
    Text,
}

impl DeliverableKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "photo" => Some(Self::Photo),
            "video" => Some(Self::Video),
            "text" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Cancelled,
}

impl FailureReason {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "paid" => Some(Self::Paid),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Paid => "paid",
            Self::Failed => "failed",
        }
    }
}

/// Minor-unit price quote attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub status: PaymentStatus,
    pub fee_rate: Option<f64>,
    pub platform_fee: Option<f64>,
    pub processor_fee: Option<f64>,
    pub net_payout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub description_display: Option<String>,
    pub origin_country: String,
    pub budget_usd: f64,
    pub quote: Option<Quote>,
    pub deliverable: DeliverableKind,
    pub deadline_at: Option<i64>,
    pub deadline_minutes: Option<i64>,
    pub review_required: bool,
    pub status: TaskStatus,
    pub failure_reason: Option<FailureReason>,
    pub human_id: Option<String>,
    #[serde(skip)]
    pub payout_destination: Option<String>,
    pub requester_human_id: Option<String>,
    pub ai_account_id: Option<String>,
    pub payment: Payment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// Absolute deadline, converting a relative one at read time.
    pub fn effective_deadline(&self) -> Option<i64> {
        self.deadline_at.or_else(|| {
            self.deadline_minutes
                .map(|minutes| self.created_at + minutes * 60)
        })
    }

    pub fn is_overdue(&self, now: i64) -> bool {
        self.status.can_time_out()
            && self
                .effective_deadline()
                .map(|deadline| deadline < now)
                .unwrap_or(false)
    }

    pub fn is_requested_by(&self, auth: &AuthContext) -> bool {
        match auth {
            AuthContext::Human { human_id } => {
                self.requester_human_id.as_deref() == Some(human_id.as_str())
            }
            AuthContext::Agent { account_id, .. } => {
                self.ai_account_id.as_deref() == Some(account_id.as_str())
            }
            AuthContext::Admin | AuthContext::Anonymous => false,
        }
    }

    pub fn is_assigned_to(&self, human_id: &str) -> bool {
        self.human_id.as_deref() == Some(human_id)
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct TaskRow {
    id: String,
    description: String,
    description_display: Option<String>,
    origin_country: String,
    budget_usd: f64,
    quote_amount_minor: Option<i64>,
    quote_currency: Option<String>,
    deliverable: String,
    deadline_at: Option<i64>,
    deadline_minutes: Option<i64>,
    review_required: bool,
    status: String,
    failure_reason: Option<String>,
    human_id: Option<String>,
    payout_destination: Option<String>,
    requester_human_id: Option<String>,
    ai_account_id: Option<String>,
    payment_status: String,
    fee_rate: Option<f64>,
    platform_fee: Option<f64>,
    processor_fee: Option<f64>,
    net_payout: Option<f64>,
    deleted_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<TaskRow> for Task {
    type Error = AppError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let corrupt = |column: &str, value: &str| {
            AppError::Internal(format!("task {} has invalid {column}: {value}", row.id))
        };
        let status = TaskStatus::parse(&row.status).ok_or_else(|| corrupt("status", &row.status))?;
        let deliverable = DeliverableKind::parse(&row.deliverable)
            .ok_or_else(|| corrupt("deliverable", &row.deliverable))?;
        let failure_reason = match row.failure_reason.as_deref() {
            Some(raw) => Some(FailureReason::parse(raw).ok_or_else(|| corrupt("failure_reason", raw))?),
            None => None,
        };
        let payment_status = PaymentStatus::parse(&row.payment_status)
            .ok_or_else(|| corrupt("payment_status", &row.payment_status))?;
        let quote = match (row.quote_amount_minor, row.quote_currency) {
            (Some(amount_minor), Some(currency)) => Some(Quote {
                amount_minor,
                currency,
            }),
            _ => None,
        };

        Ok(Task {
            id: row.id,
            description: row.description,
            description_display: row.description_display,
            origin_country: row.origin_country,
            budget_usd: row.budget_usd,
            quote,
            deliverable,
            deadline_at: row.deadline_at,
            deadline_minutes: row.deadline_minutes,
            review_required: row.review_required,
            status,
            failure_reason,
            human_id: row.human_id,
            payout_destination: row.payout_destination,
            requester_human_id: row.requester_human_id,
            ai_account_id: row.ai_account_id,
            payment: Payment {
                status: payment_status,
                fee_rate: row.fee_rate,
                platform_fee: row.platform_fee,
                processor_fee: row.processor_fee,
                net_payout: row.net_payout,
            },
            deleted_at: row.deleted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Fetch a task by id, soft-deleted rows included. No timeout evaluation.
pub async fn fetch_task<'e, E>(executor: E, id: &str) -> Result<Option<Task>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    let row = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.map(Task::try_from).transpose()
}

// ─────────────────────────────────────────────────────────
// Workers
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Human {
    pub id: String,
    pub status: String,
    pub payout_destination: Option<String>,
    pub country: Option<String>,
}

impl Human {
    pub fn has_payout_destination(&self) -> bool {
        self.payout_destination
            .as_deref()
            .map(|d| !d.trim().is_empty())
            .unwrap_or(false)
    }
}

pub async fn fetch_human<'e, E>(executor: E, id: &str) -> Result<Option<Human>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let human = sqlx::query_as::<_, Human>(
        "SELECT id, status, payout_destination, country FROM humans WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(human)
}

/// Register or update a worker's payout destination.
pub async fn set_payout_destination<'e, E>(
    executor: E,
    human_id: &str,
    destination: &str,
    country: Option<&str>,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO humans (id, status, payout_destination, country)
        VALUES (?1, 'available', ?2, ?3)
        ON CONFLICT(id) DO UPDATE SET
            payout_destination = excluded.payout_destination,
            country = COALESCE(excluded.country, humans.country)
        "#,
    )
    .bind(human_id)
    .bind(destination)
    .bind(country)
    .execute(executor)
    .await?;
    Ok(())
}
