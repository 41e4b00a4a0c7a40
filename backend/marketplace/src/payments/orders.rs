//! Versioned payment orders.
//!
//! ```text
//! created ──checkout──▶ checkout_created ──confirm──▶ paid ──refund──▶ partially_refunded ─┐
//!    └───────────────────confirm──────────────────────▲       └──refund──▶ refunded ◀──────┘
//! ```
//!
//! An order is keyed by `(id, version)`. Every transition is a single
//! conditional update on the row it observed; a writer that loses a race sees
//! zero rows affected and reports a conflict instead of overwriting.

use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db;
use crate::errors::{AppError, Result};
use crate::payments::fees::{quote_order, OrderQuote};
use crate::payments::provider::{
    CheckoutRequest, ProviderRefund, RefundReason, RefundRequest, SettlementProvider,
};
use crate::tasks::{fetch_human, fetch_task};

const ORDER_COLUMNS: &str = "id, version, task_id, human_id, currency, base_amount, fx_cost, \
     intl_surcharge, total_amount, platform_fee, application_fee, payer_country, payee_country, \
     is_international, destination_account, status, refund_status, refunded_amount, \
     pending_refund_amount, refund_failure_reason, checkout_session_id, checkout_url, \
     payment_intent_id, charge_id, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    CheckoutCreated,
    Paid,
    PartiallyRefunded,
    Refunded,
}

impl OrderStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "checkout_created" => Some(Self::CheckoutCreated),
            "paid" => Some(Self::Paid),
            "partially_refunded" => Some(Self::PartiallyRefunded),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::CheckoutCreated => "checkout_created",
            Self::Paid => "paid",
            Self::PartiallyRefunded => "partially_refunded",
            Self::Refunded => "refunded",
        }
    }

    pub fn is_refundable(&self) -> bool {
        matches!(self, Self::Paid | Self::PartiallyRefunded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    None,
    Pending,
    Succeeded,
    Failed,
}

impl RefundStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "pending" => Some(Self::Pending),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    pub id: String,
    pub version: i64,
    pub task_id: String,
    pub human_id: String,
    pub currency: String,
    pub base_amount: i64,
    pub fx_cost: i64,
    pub intl_surcharge: i64,
    pub total_amount: i64,
    pub platform_fee: i64,
    pub application_fee: i64,
    pub payer_country: String,
    pub payee_country: String,
    pub is_international: bool,
    pub destination_account: String,
    pub status: OrderStatus,
    pub refund_status: RefundStatus,
    pub refunded_amount: i64,
    /// Reserved by refunds still awaiting the provider.
    pub pending_refund_amount: i64,
    pub refund_failure_reason: Option<String>,
    pub checkout_session_id: Option<String>,
    pub checkout_url: Option<String>,
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Order {
    pub fn refundable_remainder(&self) -> i64 {
        self.total_amount - self.refunded_amount - self.pending_refund_amount
    }

    /// Fields that must match for a `(id, version)` replay to be accepted.
    fn same_terms(&self, other: &NewOrderTerms) -> bool {
        self.task_id == other.task_id
            && self.human_id == other.human_id
            && self.currency == other.currency
            && self.base_amount == other.quote.base_amount
            && self.fx_cost == other.quote.fx_cost
            && self.total_amount == other.quote.total_amount
            && self.application_fee == other.quote.application_fee
            && self.payer_country == other.payer_country
            && self.payee_country == other.payee_country
            && self.destination_account == other.destination_account
    }
}

#[derive(Debug, FromRow)]
struct OrderRow {
    id: String,
    version: i64,
    task_id: String,
    human_id: String,
    currency: String,
    base_amount: i64,
    fx_cost: i64,
    intl_surcharge: i64,
    total_amount: i64,
    platform_fee: i64,
    application_fee: i64,
    payer_country: String,
    payee_country: String,
    is_international: bool,
    destination_account: String,
    status: String,
    refund_status: String,
    refunded_amount: i64,
    pending_refund_amount: i64,
    refund_failure_reason: Option<String>,
    checkout_session_id: Option<String>,
    checkout_url: Option<String>,
    payment_intent_id: Option<String>,
    charge_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<OrderRow> for Order {
    type Error = AppError;

    fn try_from(row: OrderRow) -> Result<Self> {
        let status = OrderStatus::parse(&row.status).ok_or_else(|| {
            AppError::Internal(format!("order {} has invalid status {}", row.id, row.status))
        })?;
        let refund_status = RefundStatus::parse(&row.refund_status).ok_or_else(|| {
            AppError::Internal(format!(
                "order {} has invalid refund_status {}",
                row.id, row.refund_status
            ))
        })?;
        Ok(Order {
            id: row.id,
            version: row.version,
            task_id: row.task_id,
            human_id: row.human_id,
            currency: row.currency,
            base_amount: row.base_amount,
            fx_cost: row.fx_cost,
            intl_surcharge: row.intl_surcharge,
            total_amount: row.total_amount,
            platform_fee: row.platform_fee,
            application_fee: row.application_fee,
            payer_country: row.payer_country,
            payee_country: row.payee_country,
            is_international: row.is_international,
            destination_account: row.destination_account,
            status,
            refund_status,
            refunded_amount: row.refunded_amount,
            pending_refund_amount: row.pending_refund_amount,
            refund_failure_reason: row.refund_failure_reason,
            checkout_session_id: row.checkout_session_id,
            checkout_url: row.checkout_url,
            payment_intent_id: row.payment_intent_id,
            charge_id: row.charge_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// `version = None` reads the latest version.
pub async fn fetch_order<'e, E>(executor: E, id: &str, version: Option<i64>) -> Result<Option<Order>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = match version {
        Some(version) => {
            let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1 AND version = ?2");
            sqlx::query_as::<_, OrderRow>(&sql)
                .bind(id)
                .bind(version)
                .fetch_optional(executor)
                .await?
        }
        None => {
            let sql = format!(
                "SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1 ORDER BY version DESC LIMIT 1"
            );
            sqlx::query_as::<_, OrderRow>(&sql)
                .bind(id)
                .fetch_optional(executor)
                .await?
        }
    };
    row.map(Order::try_from).transpose()
}

async fn load_order(pool: &SqlitePool, id: &str, version: Option<i64>) -> Result<Order> {
    fetch_order(pool, id, version)
        .await?
        .ok_or(AppError::NotFound("order_not_found"))
}

// ─────────────────────────────────────────────────────────
// Create
// ─────────────────────────────────────────────────────────

/// Validated order request.
#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub id: String,
    #[serde(default = "first_version")]
    pub version: i64,
    pub task_id: String,
    pub currency: String,
    pub base_amount: i64,
    #[serde(default)]
    pub fx_cost: i64,
    pub payer_country: String,
    /// Defaults to the worker's registered country.
    pub payee_country: Option<String>,
    /// Optional echo of the payout destination snapshotted on the task at
    /// accept time; any other value is refused.
    pub destination_account: Option<String>,
}

fn first_version() -> i64 {
    1
}

struct NewOrderTerms {
    task_id: String,
    human_id: String,
    currency: String,
    payer_country: String,
    payee_country: String,
    destination_account: String,
    quote: OrderQuote,
}

fn normalize_country(field: &'static str, raw: &str) -> Result<String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(AppError::invalid_field(field, "expected ISO 3166-1 alpha-2 code"));
    }
    Ok(code)
}

fn normalize_currency(raw: &str) -> Result<String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(AppError::invalid_field("currency", "expected ISO 4217 code"));
    }
    Ok(code)
}

/// Create an order, or return the existing one for a matching `(id, version)` replay.
///
/// The boolean is `true` when a new row was written.
pub async fn create_order(
    pool: &SqlitePool,
    config: &Config,
    request: NewOrder,
    now: i64,
) -> Result<(Order, bool)> {
    let id = request.id.trim().to_string();
    if id.is_empty() || id.len() > 128 {
        return Err(AppError::invalid_field("id", "must be 1-128 characters"));
    }
    if request.version < 1 {
        return Err(AppError::invalid_field("version", "must be >= 1"));
    }
    let currency = normalize_currency(&request.currency)?;
    let payer_country = normalize_country("payer_country", &request.payer_country)?;

    let task = fetch_task(pool, &request.task_id)
        .await?
        .filter(|t| t.deleted_at.is_none())
        .ok_or(AppError::NotFound("task_not_found"))?;
    let human_id = task
        .human_id
        .clone()
        .ok_or(AppError::Conflict("task_not_assigned"))?;

    let payee_country = match request.payee_country.as_deref() {
        Some(raw) => normalize_country("payee_country", raw)?,
        None => {
            let human = fetch_human(pool, &human_id).await?;
            let country = human
                .and_then(|h| h.country)
                .ok_or(AppError::Validation("missing_payee_country"))?;
            normalize_country("payee_country", &country)?
        }
    };
    let destination_account = task
        .payout_destination
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or(AppError::Validation("payout_not_configured"))?
        .to_string();
    if let Some(requested) = request.destination_account.as_deref() {
        if requested.trim() != destination_account {
            warn!(task_id = %task.id, "Order requested a payout destination other than the task's");
            return Err(AppError::Conflict("destination_mismatch"));
        }
    }

    let quote = quote_order(
        request.base_amount,
        request.fx_cost,
        &payer_country,
        &payee_country,
        &config.fees,
    )
    .map_err(|e| AppError::Validation(e.reason()))?;

    let terms = NewOrderTerms {
        task_id: task.id,
        human_id,
        currency,
        payer_country,
        payee_country,
        destination_account,
        quote,
    };

    // One task, one order id. New versions of the same id are allowed.
    let inserted = sqlx::query(
        r#"
        INSERT INTO orders (
            id, version, task_id, human_id, currency, base_amount, fx_cost, intl_surcharge,
            total_amount, platform_fee, application_fee, payer_country, payee_country,
            is_international, destination_account, created_at, updated_at
        )
        SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16
        WHERE NOT EXISTS (SELECT 1 FROM orders WHERE task_id = ?3 AND id != ?1)
        ON CONFLICT(id, version) DO NOTHING
        "#,
    )
    .bind(&id)
    .bind(request.version)
    .bind(&terms.task_id)
    .bind(&terms.human_id)
    .bind(&terms.currency)
    .bind(terms.quote.base_amount)
    .bind(terms.quote.fx_cost)
    .bind(terms.quote.intl_surcharge)
    .bind(terms.quote.total_amount)
    .bind(terms.quote.platform_fee)
    .bind(terms.quote.application_fee)
    .bind(&terms.payer_country)
    .bind(&terms.payee_country)
    .bind(terms.quote.is_international)
    .bind(&terms.destination_account)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();

    let order = fetch_order(pool, &id, Some(request.version)).await?;
    match order {
        Some(order) if inserted == 1 => {
            info!(
                order_id = %order.id,
                version = order.version,
                total = order.total_amount,
                application_fee = order.application_fee,
                "Order created"
            );
            Ok((order, true))
        }
        Some(order) if order.same_terms(&terms) => Ok((order, false)),
        Some(_) => Err(AppError::Conflict("order_version_conflict")),
        None => Err(AppError::Conflict("task_has_order")),
    }
}

// ─────────────────────────────────────────────────────────
// Checkout
// ─────────────────────────────────────────────────────────

pub fn checkout_token(order: &Order) -> String {
    format!("order:{}:v{}:checkout", order.id, order.version)
}

/// `offset` is the amount already refunded or reserved when this refund was reserved.
pub fn refund_token(order: &Order, offset: i64, amount: i64) -> String {
    format!("order:{}:v{}:refund:{offset}:{amount}", order.id, order.version)
}

pub async fn create_checkout(
    pool: &SqlitePool,
    provider: &dyn SettlementProvider,
    config: &Config,
    id: &str,
    version: Option<i64>,
    now: i64,
) -> Result<Order> {
    let order = load_order(pool, id, version).await?;
    if order.status != OrderStatus::Created {
        return Err(AppError::Conflict("invalid_order_status"));
    }

    let destination = provider.fetch_account(&order.destination_account).await?;
    if !destination.country.eq_ignore_ascii_case(&order.payee_country) {
        warn!(
            order_id = %order.id,
            destination_country = %destination.country,
            payee_country = %order.payee_country,
            "Destination country does not match payee"
        );
        return Err(AppError::Conflict("destination_country_mismatch"));
    }
    if !destination.transfers_active {
        return Err(AppError::Conflict("destination_transfers_inactive"));
    }

    // Re-derive the fees so a policy change between create and checkout is applied.
    let quote = quote_order(
        order.base_amount,
        order.fx_cost,
        &order.payer_country,
        &order.payee_country,
        &config.fees,
    )
    .map_err(|e| AppError::Validation(e.reason()))?;

    let session = provider
        .create_checkout_session(
            &CheckoutRequest {
                order_id: order.id.clone(),
                order_version: order.version,
                currency: order.currency.clone(),
                total_amount: quote.total_amount,
                application_fee: quote.application_fee,
                destination_account: order.destination_account.clone(),
                description: format!("Task {}", order.task_id),
                success_url: config.provider.checkout_success_url.clone(),
                cancel_url: config.provider.checkout_cancel_url.clone(),
            },
            &checkout_token(&order),
        )
        .await?;

    let updated = sqlx::query(
        r#"
        UPDATE orders
        SET    status = 'checkout_created', checkout_session_id = ?1, checkout_url = ?2,
               platform_fee = ?3, intl_surcharge = ?4, application_fee = ?5,
               payment_intent_id = COALESCE(?6, payment_intent_id), updated_at = ?7
        WHERE  id = ?8 AND version = ?9 AND status = 'created'
        "#,
    )
    .bind(&session.id)
    .bind(&session.url)
    .bind(quote.platform_fee)
    .bind(quote.intl_surcharge)
    .bind(quote.application_fee)
    .bind(&session.payment_intent)
    .bind(now)
    .bind(&order.id)
    .bind(order.version)
    .execute(pool)
    .await?
    .rows_affected();

    let current = load_order(pool, &order.id, Some(order.version)).await?;
    if updated == 0 && current.checkout_session_id.as_deref() != Some(session.id.as_str()) {
        return Err(AppError::Conflict("order_state_changed"));
    }
    info!(order_id = %current.id, session_id = %session.id, "Checkout session created");
    Ok(current)
}

// ─────────────────────────────────────────────────────────
// Settlement confirmation
// ─────────────────────────────────────────────────────────

/// Mark an order paid. Returns `false` when it was not in a payable state.
pub async fn confirm_payment<'e, E>(
    executor: E,
    id: &str,
    version: i64,
    payment_intent: Option<&str>,
    now: i64,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let updated = sqlx::query(
        r#"
        UPDATE orders
        SET    status = 'paid', payment_intent_id = COALESCE(?1, payment_intent_id), updated_at = ?2
        WHERE  id = ?3 AND version = ?4 AND status IN ('created', 'checkout_created')
        "#,
    )
    .bind(payment_intent)
    .bind(now)
    .bind(id)
    .bind(version)
    .execute(executor)
    .await?
    .rows_affected();

    if updated == 1 {
        info!(order_id = id, version, "Order paid");
    }
    Ok(updated == 1)
}

/// Ask the provider whether the checkout session was paid and record it.
pub async fn sync_checkout(
    pool: &SqlitePool,
    provider: &dyn SettlementProvider,
    id: &str,
    version: Option<i64>,
    now: i64,
) -> Result<Order> {
    let order = load_order(pool, id, version).await?;
    match order.status {
        OrderStatus::Paid | OrderStatus::PartiallyRefunded | OrderStatus::Refunded => {
            return Ok(order)
        }
        OrderStatus::Created | OrderStatus::CheckoutCreated => {}
    }
    let session_id = order
        .checkout_session_id
        .as_deref()
        .ok_or(AppError::Conflict("checkout_not_created"))?;

    let session = provider.retrieve_checkout_session(session_id).await?;
    if !session.is_paid() {
        return Err(AppError::Conflict("payment_not_completed"));
    }
    confirm_payment(
        pool,
        &order.id,
        order.version,
        session.payment_intent.as_deref(),
        now,
    )
    .await?;
    load_order(pool, &order.id, Some(order.version)).await
}

// ─────────────────────────────────────────────────────────
// Refunds
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundOrder {
    /// Minor units; defaults to the full remainder.
    pub amount: Option<i64>,
    pub reason: Option<RefundReason>,
}

/// A refund whose amount is reserved on the order but not yet settled.
struct RefundAttempt<'a> {
    id: String,
    order: &'a Order,
    amount: i64,
    token: String,
}

/// Reserve `amount` against the order and write the pending audit row.
///
/// The reservation is conditional on `refunded + pending + amount <= total`,
/// so concurrent refunds can never together exceed what was paid. The
/// refunded-plus-reserved total the update applied to keys the provider token.
async fn reserve_refund<'a>(
    pool: &SqlitePool,
    order: &'a Order,
    amount: i64,
    reason: Option<RefundReason>,
    now: i64,
) -> Result<RefundAttempt<'a>> {
    let mut tx = pool.begin().await?;
    let reserved: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE orders
        SET    pending_refund_amount = pending_refund_amount + ?1, updated_at = ?2
        WHERE  id = ?3 AND version = ?4
          AND  status IN ('paid', 'partially_refunded')
          AND  refunded_amount + pending_refund_amount + ?1 <= total_amount
        RETURNING refunded_amount + pending_refund_amount - ?1
        "#,
    )
    .bind(amount)
    .bind(now)
    .bind(&order.id)
    .bind(order.version)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((offset,)) = reserved else {
        tx.rollback().await?;
        let current = load_order(pool, &order.id, Some(order.version)).await?;
        debug!(order_id = %order.id, amount, "Refund reservation refused");
        return Err(match current.status {
            OrderStatus::Refunded => AppError::Conflict("already_fully_refunded"),
            status if status.is_refundable() => AppError::Conflict("refund_exceeds_remainder"),
            _ => AppError::Conflict("refund_state_changed"),
        });
    };

    let attempt = RefundAttempt {
        id: db::new_id("rfd"),
        order,
        amount,
        token: refund_token(order, offset, amount),
    };
    sqlx::query(
        r#"
        INSERT INTO order_refunds (
            id, order_id, order_version, amount, reason, idempotency_token, status, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)
        "#,
    )
    .bind(&attempt.id)
    .bind(&order.id)
    .bind(order.version)
    .bind(amount)
    .bind(reason.map(|r| r.as_str()))
    .bind(&attempt.token)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(attempt)
}

async fn mark_refund_row(
    conn: &mut SqliteConnection,
    attempt: &RefundAttempt<'_>,
    refund: Option<&ProviderRefund>,
    status: RefundStatus,
    failure_reason: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE order_refunds SET status = ?1, provider_refund_id = ?2, failure_reason = ?3 \
         WHERE id = ?4",
    )
    .bind(status.as_str())
    .bind(refund.map(|r| r.id.as_str()))
    .bind(failure_reason)
    .bind(&attempt.id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Give the reserved amount back after the provider declined the refund.
async fn release_refund(
    pool: &SqlitePool,
    attempt: &RefundAttempt<'_>,
    refund: Option<&ProviderRefund>,
    reason: &str,
    now: i64,
) -> Result<()> {
    warn!(order_id = %attempt.order.id, amount = attempt.amount, "Refund failed: {reason}");
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        UPDATE orders
        SET    pending_refund_amount = pending_refund_amount - ?1,
               refund_status = 'failed', refund_failure_reason = ?2, updated_at = ?3
        WHERE  id = ?4 AND version = ?5 AND pending_refund_amount >= ?1
        "#,
    )
    .bind(attempt.amount)
    .bind(reason)
    .bind(now)
    .bind(&attempt.order.id)
    .bind(attempt.order.version)
    .execute(&mut *tx)
    .await?;
    mark_refund_row(&mut tx, attempt, refund, RefundStatus::Failed, Some(reason)).await?;
    tx.commit().await?;
    Ok(())
}

/// Move the reserved amount into `refunded_amount`.
async fn settle_refund(
    pool: &SqlitePool,
    attempt: &RefundAttempt<'_>,
    refund: &ProviderRefund,
    now: i64,
) -> Result<()> {
    let refund_status = if refund.status == "succeeded" {
        RefundStatus::Succeeded
    } else {
        RefundStatus::Pending
    };

    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        r#"
        UPDATE orders
        SET    refunded_amount = refunded_amount + ?1,
               pending_refund_amount = pending_refund_amount - ?1,
               status = CASE WHEN refunded_amount + ?1 = total_amount
                             THEN 'refunded' ELSE 'partially_refunded' END,
               refund_status = ?2, refund_failure_reason = NULL, updated_at = ?3
        WHERE  id = ?4 AND version = ?5 AND pending_refund_amount >= ?1
        "#,
    )
    .bind(attempt.amount)
    .bind(refund_status.as_str())
    .bind(now)
    .bind(&attempt.order.id)
    .bind(attempt.order.version)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        tx.rollback().await?;
        return Err(AppError::Internal(format!(
            "refund {} settled without a reservation on order {}",
            attempt.id, attempt.order.id
        )));
    }
    mark_refund_row(&mut tx, attempt, Some(refund), refund_status, None).await?;
    tx.commit().await?;
    Ok(())
}

/// Refund part or all of a paid order.
///
/// The amount is reserved before the provider is called and settled or
/// released afterwards. A crash in between leaves the reservation and a
/// `pending` row in `order_refunds` for reconciliation, never an unrecorded
/// provider refund.
pub async fn refund_order(
    pool: &SqlitePool,
    provider: &dyn SettlementProvider,
    id: &str,
    version: Option<i64>,
    request: RefundOrder,
    now: i64,
) -> Result<Order> {
    let order = load_order(pool, id, version).await?;
    if order.status == OrderStatus::Refunded {
        return Err(AppError::Conflict("already_fully_refunded"));
    }
    if !order.status.is_refundable() {
        return Err(AppError::Conflict("order_not_paid"));
    }

    let remainder = order.refundable_remainder();
    let amount = request.amount.unwrap_or(remainder);
    if request.amount.is_none() && remainder == 0 {
        return Err(AppError::Conflict("refund_in_progress"));
    }
    if amount <= 0 {
        return Err(AppError::Validation("invalid_refund_amount"));
    }
    if amount > remainder {
        return Err(AppError::Conflict("refund_exceeds_remainder"));
    }
    let payment_intent = order
        .payment_intent_id
        .clone()
        .ok_or(AppError::Conflict("payment_reference_missing"))?;

    let attempt = reserve_refund(pool, &order, amount, request.reason, now).await?;

    let refund = provider
        .create_refund(
            &RefundRequest {
                payment_intent,
                amount,
                reason: request.reason,
                order_id: order.id.clone(),
                order_version: order.version,
            },
            &attempt.token,
        )
        .await;
    let refund = match refund {
        Ok(refund) if refund.is_failed() => {
            let reason = refund
                .failure_reason
                .clone()
                .unwrap_or_else(|| format!("refund {}", refund.status));
            release_refund(pool, &attempt, Some(&refund), &reason, now).await?;
            return Err(AppError::Upstream(reason));
        }
        Ok(refund) => refund,
        Err(err) => {
            release_refund(pool, &attempt, None, &err.to_string(), now).await?;
            return Err(err.into());
        }
    };

    settle_refund(pool, &attempt, &refund, now).await?;
    let order = load_order(pool, &order.id, Some(order.version)).await?;
    info!(
        order_id = %order.id,
        amount,
        refunded_total = order.refunded_amount,
        status = order.status.as_str(),
        token = %attempt.token,
        "Refund recorded"
    );
    Ok(order)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::db::{test_pool, FileTestDb};
    use crate::payments::provider::fake::FakeProvider;
    use crate::payments::provider::{CheckoutSession, DestinationAccount, ProviderResult};

    /// An accepted task assigned to `human_jp` with a payout destination.
    pub(crate) async fn seed_assigned_task(pool: &SqlitePool, task_id: &str) {
        sqlx::query(
            "INSERT INTO humans (id, status, payout_destination, country) \
             VALUES ('human_jp', 'busy', 'acct_jp', 'JP') ON CONFLICT(id) DO NOTHING",
        )
        .execute(pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO tasks (id, description, origin_country, budget_usd, deliverable, status, \
             human_id, payout_destination, ai_account_id, created_at, updated_at) \
             VALUES (?1, 'photo of a shrine gate', 'US', 100.0, 'photo', 'accepted', \
             'human_jp', 'acct_jp', 'acct_a', 1000, 1000)",
        )
        .bind(task_id)
        .execute(pool)
        .await
        .unwrap();
    }

    fn new_order(id: &str, task_id: &str) -> NewOrder {
        NewOrder {
            id: id.into(),
            version: 1,
            task_id: task_id.into(),
            currency: "usd".into(),
            base_amount: 10_000,
            fx_cost: 0,
            payer_country: "us".into(),
            payee_country: None,
            destination_account: None,
        }
    }

    async fn paid_order(pool: &SqlitePool, provider: &FakeProvider) -> Order {
        let config = Config::for_tests();
        seed_assigned_task(pool, "task_1").await;
        create_order(pool, &config, new_order("ord_1", "task_1"), 10)
            .await
            .unwrap();
        let order = create_checkout(pool, provider, &config, "ord_1", None, 11)
            .await
            .unwrap();
        provider.mark_paid(order.checkout_session_id.as_deref().unwrap());
        sync_checkout(pool, provider, "ord_1", None, 12).await.unwrap()
    }

    #[tokio::test]
    async fn cross_border_order_is_priced_and_replayable() {
        let pool = test_pool().await;
        let config = Config::for_tests();
        seed_assigned_task(&pool, "task_1").await;

        let (order, created) = create_order(&pool, &config, new_order("ord_1", "task_1"), 10)
            .await
            .unwrap();
        assert!(created);
        assert!(order.is_international);
        assert_eq!(order.payee_country, "JP");
        assert_eq!(order.destination_account, "acct_jp");
        assert_eq!(order.intl_surcharge, 300);
        assert_eq!(order.platform_fee, 2_000);
        assert_eq!(order.application_fee, 2_300);
        assert_eq!(order.status, OrderStatus::Created);

        let (replayed, created) = create_order(&pool, &config, new_order("ord_1", "task_1"), 20)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(replayed, order);
    }

    #[tokio::test]
    async fn mismatched_replay_is_a_conflict() {
        let pool = test_pool().await;
        let config = Config::for_tests();
        seed_assigned_task(&pool, "task_1").await;
        create_order(&pool, &config, new_order("ord_1", "task_1"), 10)
            .await
            .unwrap();

        let mut changed = new_order("ord_1", "task_1");
        changed.base_amount = 12_000;
        let err = create_order(&pool, &config, changed, 11).await.unwrap_err();
        assert_eq!(err.reason(), "order_version_conflict");

        // A new version of the same order id is a new row.
        let mut next = new_order("ord_1", "task_1");
        next.version = 2;
        next.base_amount = 12_000;
        let (v2, created) = create_order(&pool, &config, next, 12).await.unwrap();
        assert!(created);
        assert_eq!(v2.version, 2);
        let latest = fetch_order(&pool, "ord_1", None).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);

        let err = create_order(&pool, &config, new_order("ord_other", "task_1"), 13)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "task_has_order");
    }

    #[tokio::test]
    async fn destination_is_pinned_to_the_task_snapshot() {
        let pool = test_pool().await;
        let config = Config::for_tests();
        seed_assigned_task(&pool, "task_1").await;

        let mut redirected = new_order("ord_1", "task_1");
        redirected.destination_account = Some("acct_attacker".into());
        let err = create_order(&pool, &config, redirected, 10)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "destination_mismatch");
        assert!(fetch_order(&pool, "ord_1", None).await.unwrap().is_none());

        let mut echoed = new_order("ord_1", "task_1");
        echoed.destination_account = Some(" acct_jp ".into());
        let (order, created) = create_order(&pool, &config, echoed, 11).await.unwrap();
        assert!(created);
        assert_eq!(order.destination_account, "acct_jp");

        sqlx::query("UPDATE tasks SET payout_destination = NULL WHERE id = 'task_1'")
            .execute(&pool)
            .await
            .unwrap();
        let mut unpinned = new_order("ord_1", "task_1");
        unpinned.destination_account = Some("acct_jp".into());
        let err = create_order(&pool, &config, unpinned, 12).await.unwrap_err();
        assert_eq!(err.reason(), "payout_not_configured");
    }

    #[tokio::test]
    async fn checkout_checks_destination_and_uses_stable_token() {
        let pool = test_pool().await;
        let config = Config::for_tests();
        seed_assigned_task(&pool, "task_1").await;
        create_order(&pool, &config, new_order("ord_1", "task_1"), 10)
            .await
            .unwrap();

        let wrong_country = FakeProvider::with_account("acct_jp", "KR", true);
        let err = create_checkout(&pool, &wrong_country, &config, "ord_1", None, 11)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "destination_country_mismatch");

        let inactive = FakeProvider::with_account("acct_jp", "JP", false);
        let err = create_checkout(&pool, &inactive, &config, "ord_1", None, 11)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "destination_transfers_inactive");

        let provider = FakeProvider::with_account("acct_jp", "JP", true);
        let order = create_checkout(&pool, &provider, &config, "ord_1", Some(1), 12)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::CheckoutCreated);
        assert!(order.checkout_url.is_some());
        assert_eq!(
            *provider.checkout_calls.lock().unwrap(),
            vec!["order:ord_1:v1:checkout".to_string()]
        );

        let err = create_checkout(&pool, &provider, &config, "ord_1", None, 13)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_order_status");
    }

    #[tokio::test]
    async fn confirm_is_conditional_on_payable_state() {
        let pool = test_pool().await;
        let provider = FakeProvider::with_account("acct_jp", "JP", true);
        let order = paid_order(&pool, &provider).await;
        assert_eq!(order.status, OrderStatus::Paid);
        assert!(order.payment_intent_id.is_some());

        assert!(!confirm_payment(&pool, "ord_1", 1, None, 20).await.unwrap());
    }

    #[tokio::test]
    async fn partial_then_full_refund_accumulates() {
        let pool = test_pool().await;
        let provider = FakeProvider::with_account("acct_jp", "JP", true);
        paid_order(&pool, &provider).await;

        let partial = RefundOrder {
            amount: Some(4_000),
            reason: Some(RefundReason::RequestedByCustomer),
        };
        let order = refund_order(&pool, &provider, "ord_1", None, partial, 30)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyRefunded);
        assert_eq!(order.refunded_amount, 4_000);
        assert_eq!(order.refund_status, RefundStatus::Succeeded);

        let order = refund_order(&pool, &provider, "ord_1", None, RefundOrder::default(), 31)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
        assert_eq!(order.refunded_amount, order.total_amount);
        assert_eq!(order.pending_refund_amount, 0);

        let err = refund_order(&pool, &provider, "ord_1", None, RefundOrder::default(), 32)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "already_fully_refunded");
        assert_eq!(provider.distinct_refunds(), 2);

        let tokens: Vec<String> = provider
            .refund_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(token, _)| token.clone())
            .collect();
        assert_eq!(
            tokens,
            [
                "order:ord_1:v1:refund:0:4000".to_string(),
                "order:ord_1:v1:refund:4000:6000".to_string()
            ]
        );

        let (audited,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM order_refunds WHERE order_id = 'ord_1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(audited, 2);
    }

    /// Issues a second refund on the same order while the first one is
    /// still waiting on the provider.
    struct InterleavingProvider {
        inner: FakeProvider,
        pool: SqlitePool,
        second: Mutex<Option<RefundOrder>>,
        second_result: Mutex<Option<Result<Order>>>,
    }

    #[async_trait]
    impl SettlementProvider for InterleavingProvider {
        async fn fetch_account(&self, account_id: &str) -> ProviderResult<DestinationAccount> {
            self.inner.fetch_account(account_id).await
        }

        async fn create_checkout_session(
            &self,
            request: &CheckoutRequest,
            idempotency_key: &str,
        ) -> ProviderResult<CheckoutSession> {
            self.inner.create_checkout_session(request, idempotency_key).await
        }

        async fn retrieve_checkout_session(&self, session_id: &str) -> ProviderResult<CheckoutSession> {
            self.inner.retrieve_checkout_session(session_id).await
        }

        async fn create_refund(
            &self,
            request: &RefundRequest,
            idempotency_key: &str,
        ) -> ProviderResult<ProviderRefund> {
            let second = self.second.lock().unwrap().take();
            if let Some(second) = second {
                let result = refund_order(
                    &self.pool,
                    &self.inner,
                    &request.order_id,
                    Some(request.order_version),
                    second,
                    40,
                )
                .await;
                *self.second_result.lock().unwrap() = Some(result);
            }
            self.inner.create_refund(request, idempotency_key).await
        }
    }

    fn refund_of(amount: i64) -> RefundOrder {
        RefundOrder {
            amount: Some(amount),
            reason: None,
        }
    }

    /// Sum of the refunds the provider actually holds.
    fn provider_refunded(provider: &FakeProvider) -> i64 {
        let refunds = provider.refunds.lock().unwrap();
        provider
            .refund_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(token, _)| refunds.get(token).is_some_and(|r| !r.is_failed()))
            .map(|(token, request)| (token.clone(), request.amount))
            .collect::<HashMap<_, _>>()
            .values()
            .sum()
    }

    #[tokio::test]
    async fn refund_in_flight_counts_against_the_remainder() {
        let pool = test_pool().await;
        let provider = InterleavingProvider {
            inner: FakeProvider::with_account("acct_jp", "JP", true),
            pool: pool.clone(),
            second: Mutex::new(Some(refund_of(5_000))),
            second_result: Mutex::new(None),
        };
        paid_order(&pool, &provider.inner).await;

        let order = refund_order(&pool, &provider, "ord_1", None, refund_of(3_000), 30)
            .await
            .unwrap();
        let second = provider.second_result.lock().unwrap().take().unwrap().unwrap();
        assert_eq!(second.refunded_amount, 5_000);
        assert_eq!(second.pending_refund_amount, 3_000);
        assert_eq!(order.refunded_amount, 8_000);
        assert_eq!(order.pending_refund_amount, 0);
        assert_eq!(order.status, OrderStatus::PartiallyRefunded);
        assert_eq!(provider_refunded(&provider.inner), 8_000);

        let mut tokens: Vec<String> = provider
            .inner
            .refund_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(token, _)| token.clone())
            .collect();
        tokens.sort();
        assert_eq!(
            tokens,
            [
                "order:ord_1:v1:refund:0:3000".to_string(),
                "order:ord_1:v1:refund:3000:5000".to_string()
            ]
        );

        // 2_000 left; 1_000 in flight leaves no room for 1_500 more.
        *provider.second.lock().unwrap() = Some(refund_of(1_500));
        let order = refund_order(&pool, &provider, "ord_1", None, refund_of(1_000), 50)
            .await
            .unwrap();
        let err = provider.second_result.lock().unwrap().take().unwrap().unwrap_err();
        assert_eq!(err.reason(), "refund_exceeds_remainder");
        assert_eq!(order.refunded_amount, 9_000);
        assert_eq!(provider_refunded(&provider.inner), 9_000);
        assert_eq!(provider.inner.refund_calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn concurrent_refunds_never_exceed_the_paid_total() {
        let db = FileTestDb::open(8).await;
        let provider = Arc::new(FakeProvider::with_account("acct_jp", "JP", true));
        paid_order(&db.pool, &provider).await;

        let mut refunds = tokio::task::JoinSet::new();
        for i in 0..6 {
            let pool = db.pool.clone();
            let provider = Arc::clone(&provider);
            refunds.spawn(async move {
                refund_order(&pool, provider.as_ref(), "ord_1", Some(1), refund_of(3_000), 30 + i)
                    .await
            });
        }
        let mut succeeded = 0;
        while let Some(joined) = refunds.join_next().await {
            match joined.unwrap() {
                Ok(_) => succeeded += 1,
                Err(err) => assert_eq!(err.reason(), "refund_exceeds_remainder"),
            }
        }
        assert_eq!(succeeded, 3);

        let order = fetch_order(&db.pool, "ord_1", Some(1)).await.unwrap().unwrap();
        assert_eq!(order.refunded_amount, 9_000);
        assert_eq!(order.pending_refund_amount, 0);
        assert_eq!(provider_refunded(&provider), order.refunded_amount);

        let (settled,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0) FROM order_refunds \
             WHERE order_id = 'ord_1' AND status = 'succeeded'",
        )
        .fetch_one(&db.pool)
        .await
        .unwrap();
        assert_eq!(settled, 9_000);
    }

    #[tokio::test]
    async fn refund_amount_is_validated() {
        let pool = test_pool().await;
        let provider = FakeProvider::with_account("acct_jp", "JP", true);
        paid_order(&pool, &provider).await;

        let zero = RefundOrder {
            amount: Some(0),
            reason: None,
        };
        let err = refund_order(&pool, &provider, "ord_1", None, zero, 30)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_refund_amount");

        let too_much = RefundOrder {
            amount: Some(10_001),
            reason: None,
        };
        let err = refund_order(&pool, &provider, "ord_1", None, too_much, 30)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "refund_exceeds_remainder");
        assert!(provider.refund_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_refund_failure_leaves_amounts_untouched() {
        let pool = test_pool().await;
        let provider = FakeProvider::with_account("acct_jp", "JP", true);
        paid_order(&pool, &provider).await;
        *provider.refund_status.lock().unwrap() = Some("failed".to_string());

        let err = refund_order(&pool, &provider, "ord_1", None, RefundOrder::default(), 30)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);

        let order = fetch_order(&pool, "ord_1", None).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.refunded_amount, 0);
        assert_eq!(order.refund_status, RefundStatus::Failed);
        assert_eq!(
            order.refund_failure_reason.as_deref(),
            Some("expired_or_canceled_card")
        );
    }

    #[tokio::test]
    async fn unpaid_order_cannot_be_refunded() {
        let pool = test_pool().await;
        let config = Config::for_tests();
        let provider = FakeProvider::default();
        seed_assigned_task(&pool, "task_1").await;
        create_order(&pool, &config, new_order("ord_1", "task_1"), 10)
            .await
            .unwrap();
        let err = refund_order(&pool, &provider, "ord_1", None, RefundOrder::default(), 11)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "order_not_paid");
    }
}
