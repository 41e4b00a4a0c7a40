//! Task list queries.
//!
//! Filters are a closed enum rendered through [`QueryBuilder`] bind
//! parameters; user input never reaches the SQL text.

use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::errors::{AppError, Result};
use crate::tasks::machine::settle_overdue;
use crate::tasks::{DeliverableKind, Task, TaskRow, TaskStatus, TASK_COLUMNS};

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum TaskFilter {
    Status(TaskStatus),
    Country(String),
    Deliverable(DeliverableKind),
    MinBudget(f64),
    Worker(String),
    AiAccount(String),
}

impl TaskFilter {
    fn push(&self, query: &mut QueryBuilder<'_, Sqlite>) {
        match self {
            Self::Status(status) => {
                query.push(" AND status = ").push_bind(status.as_str());
            }
            Self::Country(country) => {
                query.push(" AND origin_country = ").push_bind(country.clone());
            }
            Self::Deliverable(kind) => {
                query.push(" AND deliverable = ").push_bind(kind.as_str());
            }
            Self::MinBudget(min) => {
                query.push(" AND budget_usd >= ").push_bind(*min);
            }
            Self::Worker(human_id) => {
                query.push(" AND human_id = ").push_bind(human_id.clone());
            }
            Self::AiAccount(account_id) => {
                query.push(" AND ai_account_id = ").push_bind(account_id.clone());
            }
        }
    }

    /// Whether a row still matches after a lazy timeout changed it.
    fn matches(&self, task: &Task) -> bool {
        match self {
            Self::Status(status) => task.status == *status,
            _ => true,
        }
    }
}

/// Query-string shape of `GET /api/tasks`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub country: Option<String>,
    pub deliverable: Option<String>,
    pub min_budget: Option<f64>,
    pub worker: Option<String>,
    pub ai_account: Option<String>,
    pub limit: Option<i64>,
}

impl ListQuery {
    pub fn into_filters(self) -> Result<(Vec<TaskFilter>, i64)> {
        let mut filters = Vec::new();
        if let Some(raw) = self.status.as_deref().filter(|s| !s.is_empty()) {
            let status = TaskStatus::parse(raw)
                .ok_or_else(|| AppError::invalid_field("status", format!("unknown status {raw}")))?;
            filters.push(TaskFilter::Status(status));
        }
        if let Some(raw) = self.country.as_deref().filter(|s| !s.is_empty()) {
            filters.push(TaskFilter::Country(raw.trim().to_ascii_uppercase()));
        }
        if let Some(raw) = self.deliverable.as_deref().filter(|s| !s.is_empty()) {
            let kind = DeliverableKind::parse(raw).ok_or_else(|| {
                AppError::invalid_field("deliverable", format!("unknown deliverable {raw}"))
            })?;
            filters.push(TaskFilter::Deliverable(kind));
        }
        if let Some(min) = self.min_budget {
            if !min.is_finite() {
                return Err(AppError::invalid_field("min_budget", "must be a number"));
            }
            filters.push(TaskFilter::MinBudget(min));
        }
        if let Some(worker) = self.worker.filter(|s| !s.is_empty()) {
            filters.push(TaskFilter::Worker(worker));
        }
        if let Some(account) = self.ai_account.filter(|s| !s.is_empty()) {
            filters.push(TaskFilter::AiAccount(account));
        }
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        Ok((filters, limit))
    }
}

pub async fn list_tasks(
    pool: &SqlitePool,
    filters: &[TaskFilter],
    limit: i64,
    now: i64,
) -> Result<Vec<Task>> {
    let mut query = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE deleted_at IS NULL"
    ));
    for filter in filters {
        filter.push(&mut query);
    }
    query
        .push(" ORDER BY created_at DESC, id LIMIT ")
        .push_bind(limit);

    let rows = query.build_query_as::<TaskRow>().fetch_all(pool).await?;
    let mut tasks = Vec::with_capacity(rows.len());
    for row in rows {
        let task = settle_overdue(pool, Task::try_from(row)?, now).await?;
        if filters.iter().all(|f| f.matches(&task)) {
            tasks.push(task);
        }
    }
    Ok(tasks)
}
