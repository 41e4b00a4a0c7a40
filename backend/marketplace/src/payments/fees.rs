//! Fee math for both settlement paths.
//!
//! Orders are priced in integer minor units and every division floors, so a
//! quote can only ever round in the payer's favour. The legacy flat-budget
//! payout keeps its float formula because its results are reconciled against
//! processor reports computed the same way.

use serde::Serialize;
use thiserror::Error;

use crate::config::FeePolicy;

const BPS_DENOMINATOR: i128 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeeError {
    #[error("base amount must be positive")]
    NonPositiveBase,
    #[error("fx cost must not be negative")]
    NegativeFxCost,
    #[error("amount overflows minor-unit range")]
    Overflow,
    #[error("application fee {application_fee} exceeds total {total}")]
    ApplicationFeeExceedsTotal { application_fee: i64, total: i64 },
}

impl FeeError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NonPositiveBase => "invalid_base_amount",
            Self::NegativeFxCost => "invalid_fx_cost",
            Self::Overflow => "amount_out_of_range",
            Self::ApplicationFeeExceedsTotal { .. } => "application_fee_exceeds_total",
        }
    }
}

/// Minor-unit pricing of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrderQuote {
    pub base_amount: i64,
    pub fx_cost: i64,
    pub total_amount: i64,
    pub platform_fee: i64,
    pub intl_surcharge: i64,
    pub application_fee: i64,
    pub is_international: bool,
}

/// `floor(amount * bps / 10000)` without intermediate overflow.
fn bps_floor(amount: i64, bps: i64) -> Result<i64, FeeError> {
    let scaled = i128::from(amount) * i128::from(bps) / BPS_DENOMINATOR;
    i64::try_from(scaled).map_err(|_| FeeError::Overflow)
}

pub fn quote_order(
    base_amount: i64,
    fx_cost: i64,
    payer_country: &str,
    payee_country: &str,
    policy: &FeePolicy,
) -> Result<OrderQuote, FeeError> {
    if base_amount <= 0 {
        return Err(FeeError::NonPositiveBase);
    }
    if fx_cost < 0 {
        return Err(FeeError::NegativeFxCost);
    }
    let total_amount = base_amount
        .checked_add(fx_cost)
        .ok_or(FeeError::Overflow)?;
    let platform_fee = bps_floor(total_amount, policy.platform_fee_bps)?;
    let is_international = !payer_country.eq_ignore_ascii_case(payee_country);
    let intl_surcharge = if is_international {
        bps_floor(total_amount, policy.intl_surcharge_bps)?.max(policy.intl_surcharge_min)
    } else {
        0
    };
    let application_fee = platform_fee
        .checked_add(intl_surcharge)
        .ok_or(FeeError::Overflow)?;
    if application_fee > total_amount {
        return Err(FeeError::ApplicationFeeExceedsTotal {
            application_fee,
            total: total_amount,
        });
    }

    Ok(OrderQuote {
        base_amount,
        fx_cost,
        total_amount,
        platform_fee,
        intl_surcharge,
        application_fee,
        is_international,
    })
}

/// Legacy USD payout breakdown for a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PayoutBreakdown {
    pub fee_rate: f64,
    pub platform_fee: f64,
    pub processor_fee: f64,
    pub net_payout: f64,
}

/// `fee = floor(budget * rate * 100) / 100`, `payout = max(budget - fee - processor_fee, 0)`
/// rounded to cents.
pub fn calculate_payout(budget: f64, processor_fee: f64, fee_rate: f64) -> PayoutBreakdown {
    let platform_fee = (budget * fee_rate * 100.0).floor() / 100.0;
    let net = (budget - platform_fee - processor_fee).max(0.0);
    PayoutBreakdown {
        fee_rate,
        platform_fee,
        processor_fee,
        net_payout: (net * 100.0).round() / 100.0,
    }
}

impl FeePolicy {
    /// Platform commission as a fraction, for the legacy payout path.
    pub fn platform_fee_rate(&self) -> f64 {
        self.platform_fee_bps as f64 / BPS_DENOMINATOR as f64
    }
}
