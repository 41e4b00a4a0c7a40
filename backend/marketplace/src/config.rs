//! Application configuration loaded from environment variables.

use std::collections::HashSet;
use std::str::FromStr;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Shared secret for `X-Admin-Token`; admin routes are closed when unset
    pub admin_token: Option<String>,
    pub quota: QuotaConfig,
    pub fees: FeePolicy,
    pub provider: ProviderConfig,
    pub outbox: OutboxConfig,
}

/// Default agent ceilings and accounting switches.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub monthly_limit: i64,
    pub minute_limit: i64,
    /// Tenants that are authenticated but never counted
    pub bypass_accounts: HashSet<String>,
    /// Percentages of the monthly ceiling that fire a one-time warning
    pub warning_thresholds: Vec<u8>,
}

/// Fee parameters shared by the order path and the legacy payout path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeePolicy {
    /// Platform commission in basis points (2000 = 20%)
    pub platform_fee_bps: i64,
    /// Cross-border surcharge in basis points of the order total
    pub intl_surcharge_bps: i64,
    /// Floor for the cross-border surcharge, in minor units
    pub intl_surcharge_min: i64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            platform_fee_bps: 2000,
            intl_surcharge_bps: 300,
            intl_surcharge_min: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the Stripe-compatible settlement API
    pub api_base: String,
    pub secret_key: Option<String>,
    /// Shared secret for verifying inbound provider webhooks
    pub webhook_secret: Option<String>,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Per-request deadline for webhook deliveries
    pub webhook_timeout_secs: u64,
    /// How often (in seconds) the worker looks for due events
    pub poll_interval_secs: u64,
    /// Maximum number of events claimed per poll
    pub batch_size: i64,
    /// Dispatch attempts before an event is parked as failed
    pub max_attempts: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./marketplace.db".to_string()),
            api_port: parse_or("API_PORT", 3001)?,
            admin_token: env_var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            quota: QuotaConfig {
                monthly_limit: parse_or("AI_MONTHLY_LIMIT", 10_000)?,
                minute_limit: parse_or("AI_MINUTE_LIMIT", 60)?,
                bypass_accounts: env_var("AI_QUOTA_BYPASS_ACCOUNTS")
                    .map(|raw| split_list(&raw).collect())
                    .unwrap_or_default(),
                warning_thresholds: parse_thresholds(
                    &env_var("AI_QUOTA_WARNING_THRESHOLDS").unwrap_or_else(|_| "80,95".into()),
                )?,
            },
            fees: FeePolicy {
                platform_fee_bps: parse_or("PLATFORM_FEE_BPS", 2000)?,
                intl_surcharge_bps: parse_or("INTL_SURCHARGE_BPS", 300)?,
                intl_surcharge_min: parse_or("INTL_SURCHARGE_MIN", 100)?,
            },
            provider: ProviderConfig {
                api_base: env_var("SETTLEMENT_API_BASE")
                    .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
                secret_key: env_var("SETTLEMENT_SECRET_KEY").ok(),
                webhook_secret: env_var("SETTLEMENT_WEBHOOK_SECRET").ok(),
                checkout_success_url: env_var("CHECKOUT_SUCCESS_URL")
                    .unwrap_or_else(|_| "http://localhost:3000/orders/success".to_string()),
                checkout_cancel_url: env_var("CHECKOUT_CANCEL_URL")
                    .unwrap_or_else(|_| "http://localhost:3000/orders/cancel".to_string()),
                timeout_secs: parse_or("SETTLEMENT_TIMEOUT_SECS", 10)?,
            },
            outbox: OutboxConfig {
                webhook_timeout_secs: parse_or("WEBHOOK_TIMEOUT_SECS", 10)?,
                poll_interval_secs: parse_or("OUTBOX_POLL_INTERVAL_SECS", 2)?,
                batch_size: parse_or("OUTBOX_BATCH_SIZE", 50)?,
                max_attempts: parse_or("OUTBOX_MAX_ATTEMPTS", 5)?,
            },
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| AppError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn parse_thresholds(raw: &str) -> Result<Vec<u8>> {
    let mut thresholds = split_list(raw)
        .map(|s| match s.parse::<u8>() {
            Ok(pct) if (1..=100).contains(&pct) => Ok(pct),
            _ => Err(AppError::Config(format!(
                "Invalid AI_QUOTA_WARNING_THRESHOLDS entry: {s}"
            ))),
        })
        .collect::<Result<Vec<_>>>()?;
    thresholds.sort_unstable();
    thresholds.dedup();
    Ok(thresholds)
}

#[cfg(test)]
impl Config {
    /// Configuration used by unit tests: small ceilings, no external endpoints.
    pub fn for_tests() -> Self {
        Config {
            database_url: "sqlite::memory:".to_string(),
            api_port: 0,
            admin_token: Some("admin-secret".to_string()),
            quota: QuotaConfig {
                monthly_limit: 100,
                minute_limit: 5,
                bypass_accounts: HashSet::new(),
                warning_thresholds: vec![80, 95],
            },
            fees: FeePolicy::default(),
            provider: ProviderConfig {
                api_base: "http://127.0.0.1:9".to_string(),
                secret_key: None,
                webhook_secret: Some("whsec_test".to_string()),
                checkout_success_url: "http://localhost/success".to_string(),
                checkout_cancel_url: "http://localhost/cancel".to_string(),
                timeout_secs: 2,
            },
            outbox: OutboxConfig {
                webhook_timeout_secs: 2,
                poll_interval_secs: 1,
                batch_size: 10,
                max_attempts: 3,
            },
        }
    }
}
