//! Agent authentication and dual fixed-window rate limiting.
//!
//! Each admitted call consumes one unit from a per-minute window and one from
//! a per-month window. Increments are single conditional upserts bounded by
//! the ceiling, so concurrent calls from one tenant can never push a counter
//! past its limit. The minute window is charged first; when the monthly
//! charge then fails, the minute unit is handed back so a blocked call does
//! not eat burst capacity.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, warn};

use crate::config::QuotaConfig;
use crate::errors::{AppError, Result};
use crate::signing::{constant_time_eq, sha256_hex};

/// Remaining quota for both windows, reported on every agent response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub monthly_limit: i64,
    pub monthly_remaining: i64,
    /// Unix seconds
    pub monthly_reset: i64,
    pub minute_limit: i64,
    pub minute_remaining: i64,
    /// Unix seconds
    pub minute_reset: i64,
}

impl QuotaSnapshot {
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let pairs = [
            ("x-ai-ratelimit-limit-month", self.monthly_limit),
            ("x-ai-ratelimit-remaining-month", self.monthly_remaining),
            ("x-ai-ratelimit-reset-month", self.monthly_reset),
            ("x-ai-ratelimit-limit-minute", self.minute_limit),
            ("x-ai-ratelimit-remaining-minute", self.minute_remaining),
            ("x-ai-ratelimit-reset-minute", self.minute_reset),
        ];
        for (name, value) in pairs {
            headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
        }
    }
}

/// A call refused by one of the windows.
#[derive(Debug, Clone)]
pub struct QuotaRejection {
    /// `minute_limit_exceeded` or `monthly_limit_exceeded`
    pub reason: &'static str,
    pub snapshot: QuotaSnapshot,
    pub now: i64,
}

impl QuotaRejection {
    /// Seconds until the exhausted window resets.
    pub fn retry_after(&self) -> i64 {
        let reset = if self.reason == MINUTE_EXCEEDED {
            self.snapshot.minute_reset
        } else {
            self.snapshot.monthly_reset
        };
        (reset - self.now).max(0)
    }
}

pub const MINUTE_EXCEEDED: &str = "minute_limit_exceeded";
pub const MONTHLY_EXCEEDED: &str = "monthly_limit_exceeded";

/// Outcome of a successful admission.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub account_id: String,
    /// `None` for bypass-listed tenants
    pub snapshot: Option<QuotaSnapshot>,
    /// Warning thresholds crossed for the first time by this call
    pub warnings: Vec<u8>,
}

#[derive(Debug, FromRow)]
struct AccountRow {
    id: String,
    api_key_hash: String,
    status: String,
    monthly_limit: Option<i64>,
    minute_limit: Option<i64>,
}

/// Fixed-window period keys and their reset instants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Windows {
    pub minute_key: String,
    pub minute_reset: i64,
    pub month_key: String,
    pub month_reset: i64,
}

impl Windows {
    pub fn at(now: DateTime<Utc>) -> Self {
        let minute_start = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        let (year, month) = if now.month() == 12 {
            (now.year() + 1, 1)
        } else {
            (now.year(), now.month() + 1)
        };
        let month_reset = NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_else(|| now.timestamp());

        Self {
            minute_key: now.format("%Y-%m-%dT%H:%M").to_string(),
            minute_reset: (minute_start + Duration::minutes(1)).timestamp(),
            month_key: now.format("%Y-%m").to_string(),
            month_reset,
        }
    }
}

/// Verify `(account_id, api_key)` and charge one call against both windows.
pub async fn admit(
    pool: &SqlitePool,
    config: &QuotaConfig,
    account_id: &str,
    api_key: &str,
    now: DateTime<Utc>,
) -> Result<Admitted> {
    let account = sqlx::query_as::<_, AccountRow>(
        "SELECT id, api_key_hash, status, monthly_limit, minute_limit FROM ai_accounts WHERE id = ?1",
    )
    .bind(account_id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::Unauthorized("invalid_credentials"))?;

    if !constant_time_eq(&sha256_hex(api_key.as_bytes()), &account.api_key_hash) {
        warn!(account_id, "Rejected agent call with wrong API key");
        return Err(AppError::Unauthorized("invalid_credentials"));
    }
    if account.status != "active" {
        return Err(AppError::Forbidden("account_disabled"));
    }

    if config.bypass_accounts.contains(&account.id) {
        debug!(account_id, "Quota bypass");
        return Ok(Admitted {
            account_id: account.id,
            snapshot: None,
            warnings: Vec::new(),
        });
    }

    let monthly_limit = account.monthly_limit.unwrap_or(config.monthly_limit);
    let minute_limit = account.minute_limit.unwrap_or(config.minute_limit);
    let windows = Windows::at(now);
    let now_ts = now.timestamp();

    let minute_count = increment_minute(pool, &account.id, &windows, minute_limit, now_ts).await?;
    let Some(minute_count) = minute_count else {
        let month_used = current_count(pool, "ai_usage_monthly", &account.id, &windows.month_key).await?;
        return Err(rejection(
            MINUTE_EXCEEDED,
            &windows,
            (monthly_limit, month_used),
            (minute_limit, minute_limit),
            now_ts,
        ));
    };

    let month_count = increment_monthly(pool, &account.id, &windows, monthly_limit).await?;
    let Some(month_count) = month_count else {
        // Hand the minute unit back; this call never ran.
        sqlx::query(
            r#"
            UPDATE ai_usage_minute
            SET    request_count = request_count - 1
            WHERE  account_id = ?1 AND period_key = ?2 AND request_count > 0
            "#,
        )
        .bind(&account.id)
        .bind(&windows.minute_key)
        .execute(pool)
        .await?;

        return Err(rejection(
            MONTHLY_EXCEEDED,
            &windows,
            (monthly_limit, monthly_limit),
            (minute_limit, minute_count - 1),
            now_ts,
        ));
    };

    let warnings = record_warnings(
        pool,
        &account.id,
        &windows.month_key,
        &config.warning_thresholds,
        month_count,
        monthly_limit,
        now_ts,
    )
    .await?;

    Ok(Admitted {
        account_id: account.id,
        snapshot: Some(QuotaSnapshot {
            monthly_limit,
            monthly_remaining: (monthly_limit - month_count).max(0),
            monthly_reset: windows.month_reset,
            minute_limit,
            minute_remaining: (minute_limit - minute_count).max(0),
            minute_reset: windows.minute_reset,
        }),
        warnings,
    })
}

/// Returns the new count, or `None` when the ceiling is already reached.
async fn increment_minute(
    pool: &SqlitePool,
    account_id: &str,
    windows: &Windows,
    limit: i64,
    now: i64,
) -> Result<Option<i64>> {
    if limit <= 0 {
        return Ok(None);
    }
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO ai_usage_minute (account_id, period_key, request_count, created_at)
        VALUES (?1, ?2, 1, ?3)
        ON CONFLICT(account_id, period_key) DO UPDATE
            SET request_count = ai_usage_minute.request_count + 1
            WHERE ai_usage_minute.request_count < ?4
        RETURNING request_count
        "#,
    )
    .bind(account_id)
    .bind(&windows.minute_key)
    .bind(now)
    .bind(limit)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(count,)| count))
}

async fn increment_monthly(
    pool: &SqlitePool,
    account_id: &str,
    windows: &Windows,
    limit: i64,
) -> Result<Option<i64>> {
    if limit <= 0 {
        return Ok(None);
    }
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO ai_usage_monthly (account_id, period_key, request_count)
        VALUES (?1, ?2, 1)
        ON CONFLICT(account_id, period_key) DO UPDATE
            SET request_count = ai_usage_monthly.request_count + 1
            WHERE ai_usage_monthly.request_count < ?3
        RETURNING request_count
        "#,
    )
    .bind(account_id)
    .bind(&windows.month_key)
    .bind(limit)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(count,)| count))
}

async fn current_count(pool: &SqlitePool, table: &str, account_id: &str, period_key: &str) -> Result<i64> {
    let sql = format!("SELECT request_count FROM {table} WHERE account_id = ?1 AND period_key = ?2");
    let row: Option<(i64,)> = sqlx::query_as(&sql)
        .bind(account_id)
        .bind(period_key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(c,)| c).unwrap_or(0))
}

fn rejection(
    reason: &'static str,
    windows: &Windows,
    (monthly_limit, month_used): (i64, i64),
    (minute_limit, minute_used): (i64, i64),
    now: i64,
) -> AppError {
    AppError::RateLimited(Box::new(QuotaRejection {
        reason,
        snapshot: QuotaSnapshot {
            monthly_limit,
            monthly_remaining: (monthly_limit - month_used).max(0),
            monthly_reset: windows.month_reset,
            minute_limit,
            minute_remaining: (minute_limit - minute_used).max(0),
            minute_reset: windows.minute_reset,
        },
        now,
    }))
}

/// Insert one marker per crossed threshold; only the first insert per
/// (tenant, period, threshold) reports it.
async fn record_warnings(
    pool: &SqlitePool,
    account_id: &str,
    month_key: &str,
    thresholds: &[u8],
    month_count: i64,
    monthly_limit: i64,
    now: i64,
) -> Result<Vec<u8>> {
    let mut fired = Vec::new();
    for &pct in thresholds {
        if month_count * 100 < monthly_limit * i64::from(pct) {
            continue;
        }
        let inserted = sqlx::query(
            r#"
            INSERT INTO ai_usage_warnings (account_id, period_key, threshold, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(month_key)
        .bind(i64::from(pct))
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            warn!(
                account_id,
                period = month_key,
                threshold = pct,
                used = month_count,
                limit = monthly_limit,
                "Agent crossed monthly quota warning threshold"
            );
            fired.push(pct);
        }
    }
    Ok(fired)
}

/// Storage hygiene: minute windows are useless once they have reset.
pub async fn prune_minute_windows(pool: &SqlitePool, older_than: i64) -> Result<u64> {
    let removed = sqlx::query("DELETE FROM ai_usage_minute WHERE created_at < ?1")
        .bind(older_than)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(removed)
}

/// Create a tenant and return its raw API key. The key is not recoverable later.
pub async fn create_account(
    pool: &SqlitePool,
    name: &str,
    monthly_limit: Option<i64>,
    minute_limit: Option<i64>,
) -> Result<(String, String)> {
    let id = crate::db::new_id("acct");
    let api_key = crate::signing::generate_secret("tc");
    sqlx::query(
        r#"
        INSERT INTO ai_accounts (id, name, api_key_hash, status, monthly_limit, minute_limit, created_at)
        VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6)
        "#,
    )
    .bind(&id)
    .bind(name)
    .bind(sha256_hex(api_key.as_bytes()))
    .bind(monthly_limit)
    .bind(minute_limit)
    .bind(crate::db::now())
    .execute(pool)
    .await?;
    Ok((id, api_key))
}

#[cfg(test)]
pub(crate) async fn seed_account(pool: &SqlitePool, id: &str, api_key: &str) {
    sqlx::query(
        "INSERT INTO ai_accounts (id, name, api_key_hash, status) VALUES (?1, ?1, ?2, 'active')",
    )
    .bind(id)
    .bind(sha256_hex(api_key.as_bytes()))
    .execute(pool)
    .await
    .unwrap();
}
