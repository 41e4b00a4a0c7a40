//! Settlement provider client: checkout sessions, destination accounts and refunds.
//!
//! The production adapter speaks a Stripe-compatible REST API (form-encoded
//! requests, bearer secret key). Every mutating call carries an
//! `Idempotency-Key` derived from the order identity so that a retried
//! request can never create a second charge or refund.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::errors::AppError;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider answered with an error object.
    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("settlement provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("settlement provider is not configured")]
    NotConfigured,

    #[error("invalid settlement provider base URL: {0}")]
    BaseUrl(String),
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        AppError::Upstream(err.to_string())
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Worker-side payout target as the provider sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationAccount {
    pub id: String,
    pub country: String,
    pub transfers_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub order_id: String,
    pub order_version: i64,
    pub currency: String,
    pub total_amount: i64,
    pub application_fee: i64,
    pub destination_account: String,
    pub description: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    /// `paid`, `unpaid` or `no_payment_required`
    pub payment_status: String,
    pub payment_intent: Option<String>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status == "paid"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    Duplicate,
    Fraudulent,
    RequestedByCustomer,
}

impl RefundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Fraudulent => "fraudulent",
            Self::RequestedByCustomer => "requested_by_customer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub payment_intent: String,
    pub amount: i64,
    pub reason: Option<RefundReason>,
    pub order_id: String,
    pub order_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderRefund {
    pub id: String,
    /// `pending`, `succeeded`, `failed` or `canceled`
    pub status: String,
    pub failure_reason: Option<String>,
}

impl ProviderRefund {
    pub fn is_failed(&self) -> bool {
        matches!(self.status.as_str(), "failed" | "canceled")
    }
}

#[async_trait]
pub trait SettlementProvider: Send + Sync {
    async fn fetch_account(&self, account_id: &str) -> ProviderResult<DestinationAccount>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
        idempotency_key: &str,
    ) -> ProviderResult<CheckoutSession>;

    async fn retrieve_checkout_session(&self, session_id: &str) -> ProviderResult<CheckoutSession>;

    async fn create_refund(
        &self,
        request: &RefundRequest,
        idempotency_key: &str,
    ) -> ProviderResult<ProviderRefund>;
}

// ─────────────────────────────────────────────────────────
// HTTP adapter
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    id: String,
    country: Option<String>,
    #[serde(default)]
    capabilities: Capabilities,
}

#[derive(Debug, Default, Deserialize)]
struct Capabilities {
    transfers: Option<String>,
}

pub struct HttpSettlementProvider {
    client: Client,
    config: ProviderConfig,
}

impl HttpSettlementProvider {
    pub fn new(client: Client, config: ProviderConfig) -> Self {
        Self { client, config }
    }

    fn secret(&self) -> ProviderResult<&str> {
        self.config
            .secret_key
            .as_deref()
            .ok_or(ProviderError::NotConfigured)
    }

    /// Each segment is percent-encoded, so caller-supplied ids stay inside their segment.
    fn url(&self, segments: &[&str]) -> ProviderResult<Url> {
        let mut url = Url::parse(&self.config.api_base)
            .map_err(|e| ProviderError::BaseUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::BaseUrl(self.config.api_base.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> ProviderResult<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&text)
            .ok()
            .and_then(|e| e.error.message.or(e.error.code))
            .unwrap_or_else(|| format!("provider returned HTTP {}", status.as_u16()));
        warn!("Settlement provider error {}: {message}", status.as_u16());
        Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn post_form<T: for<'de> Deserialize<'de>>(
        &self,
        path: &[&str],
        form: &[(String, String)],
        idempotency_key: &str,
    ) -> ProviderResult<T> {
        let response = self
            .client
            .post(self.url(path)?)
            .bearer_auth(self.secret()?)
            .header("Idempotency-Key", idempotency_key)
            .timeout(self.timeout())
            .form(form)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &[&str]) -> ProviderResult<T> {
        let response = self
            .client
            .get(self.url(path)?)
            .bearer_auth(self.secret()?)
            .timeout(self.timeout())
            .send()
            .await?;
        Self::decode(response).await
    }
}

/// Form fields for a destination charge with an application fee.
pub fn checkout_form(request: &CheckoutRequest) -> Vec<(String, String)> {
    let pairs = [
        ("mode", "payment".to_string()),
        ("success_url", request.success_url.clone()),
        ("cancel_url", request.cancel_url.clone()),
        ("line_items[0][quantity]", "1".to_string()),
        (
            "line_items[0][price_data][currency]",
            request.currency.to_ascii_lowercase(),
        ),
        (
            "line_items[0][price_data][unit_amount]",
            request.total_amount.to_string(),
        ),
        (
            "line_items[0][price_data][product_data][name]",
            request.description.clone(),
        ),
        (
            "payment_intent_data[application_fee_amount]",
            request.application_fee.to_string(),
        ),
        (
            "payment_intent_data[transfer_data][destination]",
            request.destination_account.clone(),
        ),
        ("metadata[order_id]", request.order_id.clone()),
        ("metadata[order_version]", request.order_version.to_string()),
    ];
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

pub fn refund_form(request: &RefundRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("payment_intent".to_string(), request.payment_intent.clone()),
        ("amount".to_string(), request.amount.to_string()),
        ("metadata[order_id]".to_string(), request.order_id.clone()),
        (
            "metadata[order_version]".to_string(),
            request.order_version.to_string(),
        ),
    ];
    if let Some(reason) = request.reason {
        form.push(("reason".to_string(), reason.as_str().to_string()));
    }
    form
}

#[async_trait]
impl SettlementProvider for HttpSettlementProvider {
    async fn fetch_account(&self, account_id: &str) -> ProviderResult<DestinationAccount> {
        let account: AccountResponse = self.get(&["v1", "accounts", account_id]).await?;
        Ok(DestinationAccount {
            id: account.id,
            country: account.country.unwrap_or_default().to_ascii_uppercase(),
            transfers_active: account.capabilities.transfers.as_deref() == Some("active"),
        })
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
        idempotency_key: &str,
    ) -> ProviderResult<CheckoutSession> {
        debug!(order_id = %request.order_id, idempotency_key, "Creating checkout session");
        self.post_form(&["v1", "checkout", "sessions"], &checkout_form(request), idempotency_key)
            .await
    }

    async fn retrieve_checkout_session(&self, session_id: &str) -> ProviderResult<CheckoutSession> {
        self.get(&["v1", "checkout", "sessions", session_id]).await
    }

    async fn create_refund(
        &self,
        request: &RefundRequest,
        idempotency_key: &str,
    ) -> ProviderResult<ProviderRefund> {
        debug!(order_id = %request.order_id, idempotency_key, "Creating refund");
        self.post_form(&["v1", "refunds"], &refund_form(request), idempotency_key)
            .await
    }
}

// ─────────────────────────────────────────────────────────
// In-memory provider for tests
// ─────────────────────────────────────────────────────────
