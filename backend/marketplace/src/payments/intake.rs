//! Inbound settlement-provider webhooks.
//!
//! The provider retries anything that is not a 2xx. Bad signatures and
//! payloads are acknowledged and dropped. An event is stored at most once by
//! event id, in the same transaction that applies it to its order, so a
//! failed apply leaves nothing stored and the redelivery is applied afresh.

use serde::Deserialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::payments::orders;
use crate::signing::{constant_time_eq, hmac_sha256_hex};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Maximum age of a signed timestamp, in seconds.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    Missing,
    Malformed,
    Stale,
    Mismatch,
}

/// Verify `t=<unix>,v1=<hex>[,v1=<hex>…]` over `"{t}.{body}"`.
pub fn verify_signature(
    secret: &str,
    header: Option<&str>,
    body: &[u8],
    now: i64,
) -> std::result::Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Stale);
    }

    let mut signed = format!("{timestamp}.").into_bytes();
    signed.extend_from_slice(body);
    let expected = hmac_sha256_hex(secret.as_bytes(), &signed);
    if candidates.iter().any(|c| constant_time_eq(c, &expected)) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Signature or payload rejected; nothing stored.
    Rejected,
    /// Already stored under this event id.
    Duplicate,
    Stored,
    /// Stored and an order was marked paid.
    Applied,
}

#[derive(Debug, Deserialize)]
struct ProviderEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: EventData,
}

#[derive(Debug, Default, Deserialize)]
struct EventData {
    #[serde(default)]
    object: Value,
}

/// Order a `checkout.session.completed` event marks as paid.
struct PaidCheckout<'a> {
    order_id: &'a str,
    version: i64,
    payment_intent: Option<&'a str>,
}

fn paid_checkout(event: &ProviderEvent) -> Option<PaidCheckout<'_>> {
    if event.event_type != "checkout.session.completed" {
        return None;
    }
    let session = &event.data.object;
    if session["payment_status"].as_str() != Some("paid") {
        return None;
    }
    let metadata = &session["metadata"];
    let version = match &metadata["order_version"] {
        Value::String(raw) => raw.parse::<i64>().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    };
    let (Some(order_id), Some(version)) = (metadata["order_id"].as_str(), version) else {
        warn!(event_id = %event.id, "Checkout event without order metadata");
        return None;
    };
    Some(PaidCheckout {
        order_id,
        version,
        payment_intent: session["payment_intent"].as_str(),
    })
}

/// Verify, store and apply one provider event.
///
/// Store and apply failures propagate so the provider retries; signature and
/// payload problems are logged and acknowledged.
pub async fn receive(
    pool: &SqlitePool,
    webhook_secret: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
    now: i64,
) -> Result<IntakeOutcome> {
    let Some(secret) = webhook_secret else {
        warn!("Provider webhook received but no signing secret is configured");
        return Ok(IntakeOutcome::Rejected);
    };
    if let Err(reason) = verify_signature(secret, signature, body, now) {
        warn!(?reason, "Provider webhook signature rejected");
        return Ok(IntakeOutcome::Rejected);
    }
    let event: ProviderEvent = match serde_json::from_slice(body) {
        Ok(event) => event,
        Err(e) => {
            warn!("Provider webhook payload is not an event: {e}");
            return Ok(IntakeOutcome::Rejected);
        }
    };

    let mut tx = pool.begin().await?;
    let inserted = sqlx::query(
        r#"
        INSERT INTO provider_events (event_id, event_type, payload, received_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(event_id) DO NOTHING
        "#,
    )
    .bind(&event.id)
    .bind(&event.event_type)
    .bind(String::from_utf8_lossy(body).into_owned())
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 {
        tx.rollback().await?;
        debug!(event_id = %event.id, "Duplicate provider event ignored");
        return Ok(IntakeOutcome::Duplicate);
    }

    let outcome = match paid_checkout(&event) {
        Some(paid) => {
            let applied = orders::confirm_payment(
                &mut *tx,
                paid.order_id,
                paid.version,
                paid.payment_intent,
                now,
            )
            .await?;
            if applied {
                IntakeOutcome::Applied
            } else {
                debug!(
                    order_id = paid.order_id,
                    version = paid.version,
                    "Order was not awaiting payment"
                );
                IntakeOutcome::Stored
            }
        }
        None => IntakeOutcome::Stored,
    };
    tx.commit().await?;

    info!(event_id = %event.id, event_type = %event.event_type, ?outcome, "Provider event stored");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::test_pool;
    use crate::payments::orders::{create_order, fetch_order, NewOrder, OrderStatus};
    use serde_json::json;

    const SECRET: &str = "whsec_test";

    fn sign(body: &[u8], t: i64) -> String {
        let mut signed = format!("{t}.").into_bytes();
        signed.extend_from_slice(body);
        format!("t={t},v1={}", hmac_sha256_hex(SECRET.as_bytes(), &signed))
    }

    fn order_request() -> NewOrder {
        NewOrder {
            id: "ord_1".into(),
            version: 1,
            task_id: "task_1".into(),
            currency: "USD".into(),
            base_amount: 10_000,
            fx_cost: 0,
            payer_country: "US".into(),
            payee_country: None,
            destination_account: None,
        }
    }

    fn paid_event(event_id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_1",
                "payment_status": "paid",
                "payment_intent": "pi_1",
                "metadata": {"order_id": "ord_1", "order_version": "1"}
            }}
        }))
        .unwrap()
    }

    #[test]
    fn signature_checks() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign(body, 1_000);
        assert_eq!(verify_signature(SECRET, Some(&header), body, 1_100), Ok(()));
        assert_eq!(
            verify_signature(SECRET, Some(&header), body, 1_000 + SIGNATURE_TOLERANCE_SECS + 1),
            Err(SignatureError::Stale)
        );
        assert_eq!(
            verify_signature(SECRET, Some(&header), br#"{"id":"evt_2"}"#, 1_000),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature(SECRET, Some("v1=abc"), body, 1_000),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature(SECRET, None, body, 1_000),
            Err(SignatureError::Missing)
        );
    }

    #[tokio::test]
    async fn bad_signature_is_acknowledged_without_storing() {
        let pool = test_pool().await;
        let body = br#"{"id":"evt_1","type":"charge.succeeded"}"#;
        let outcome = receive(&pool, Some(SECRET), Some("t=1,v1=00"), body, 1)
            .await
            .unwrap();
        assert_eq!(outcome, IntakeOutcome::Rejected);
        let (stored,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM provider_events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(stored, 0);
    }

    #[tokio::test]
    async fn checkout_completed_marks_order_paid_once() {
        let pool = test_pool().await;
        crate::payments::orders::tests::seed_assigned_task(&pool, "task_1").await;
        create_order(&pool, &Config::for_tests(), order_request(), 5)
            .await
            .unwrap();

        let body = paid_event("evt_paid");
        let header = sign(&body, 100);

        let first = receive(&pool, Some(SECRET), Some(&header), &body, 100)
            .await
            .unwrap();
        assert_eq!(first, IntakeOutcome::Applied);
        let again = receive(&pool, Some(SECRET), Some(&header), &body, 101)
            .await
            .unwrap();
        assert_eq!(again, IntakeOutcome::Duplicate);

        let order = fetch_order(&pool, "ord_1", Some(1)).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.payment_intent_id.as_deref(), Some("pi_1"));
    }

    #[tokio::test]
    async fn failed_apply_keeps_the_event_for_redelivery() {
        let pool = test_pool().await;
        crate::payments::orders::tests::seed_assigned_task(&pool, "task_1").await;
        create_order(&pool, &Config::for_tests(), order_request(), 5)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TRIGGER hold_payments BEFORE UPDATE OF status ON orders \
             WHEN NEW.status = 'paid' BEGIN SELECT RAISE(ABORT, 'orders are read-only'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let body = paid_event("evt_paid");
        let header = sign(&body, 100);
        receive(&pool, Some(SECRET), Some(&header), &body, 100)
            .await
            .unwrap_err();
        let (stored,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM provider_events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(stored, 0);

        sqlx::query("DROP TRIGGER hold_payments")
            .execute(&pool)
            .await
            .unwrap();
        let redelivered = receive(&pool, Some(SECRET), Some(&header), &body, 160)
            .await
            .unwrap();
        assert_eq!(redelivered, IntakeOutcome::Applied);
        let order = fetch_order(&pool, "ord_1", Some(1)).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
    }
}
