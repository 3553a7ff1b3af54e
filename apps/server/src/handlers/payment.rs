use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::NaiveDateTime;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::{
    auth, db,
    errors::ApiError,
    models::{
        ApiResponse, Appointment, AppointmentDetail, AppointmentStatus, CloseoutRequest,
        CloseoutStripeResponse, PaymentStatus,
    },
    AppState,
};

type HmacSha256 = Hmac<Sha256>;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";
/// Max allowed skew between the webhook signature timestamp and our clock.
const WEBHOOK_TOLERANCE_SECS: i64 = 300;

// ── Stripe client ──

#[derive(Debug, Deserialize)]
struct StripeIntentResponse {
    id: String,
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    message: Option<String>,
}

/// Create a PaymentIntent and return `(intent_id, client_secret)`.
///
/// Metadata carries everything the webhook needs to route the event back to
/// an appointment, so webhook handling never depends on local request state.
pub async fn create_payment_intent(
    secret_key: &str,
    amount_cents: i64,
    appointment_id: i64,
    kind: &str,
    tip_cents: i64,
    description: &str,
) -> anyhow::Result<(String, Option<String>)> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()?;

    let amount = amount_cents.to_string();
    let appointment = appointment_id.to_string();
    let tip = tip_cents.to_string();
    let params: Vec<(&str, &str)> = vec![
        ("amount", &amount),
        ("currency", "usd"),
        ("description", description),
        ("automatic_payment_methods[enabled]", "true"),
        ("metadata[appointment_id]", &appointment),
        ("metadata[kind]", kind),
        ("metadata[tip_cents]", &tip),
    ];

    let resp = client
        .post(format!("{}/payment_intents", STRIPE_API_BASE))
        .bearer_auth(secret_key)
        // Retries of the same charge must not create duplicate intents.
        .header(
            "Idempotency-Key",
            format!("appt-{}-{}-{}", appointment_id, kind, amount_cents),
        )
        .form(&params)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let message = resp
            .json::<StripeErrorResponse>()
            .await
            .ok()
            .and_then(|e| e.error.message)
            .unwrap_or_else(|| "no error detail".into());
        anyhow::bail!("stripe payment_intents returned {}: {}", status, message);
    }

    let intent: StripeIntentResponse = resp.json().await?;
    Ok((intent.id, intent.client_secret))
}

// ── Webhook signature verification ──

/// Verify a `Stripe-Signature` header (`t=<ts>,v1=<hex>,...`) against the
/// raw request body. Rejects stale timestamps to blunt replay.
pub fn verify_webhook_signature(
    payload: &str,
    sig_header: &str,
    secret: &str,
    now_ts: i64,
) -> bool {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in sig_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => signatures.push(v),
            _ => {}
        }
    }
    let (Some(ts), false) = (timestamp, signatures.is_empty()) else {
        return false;
    };
    if (now_ts - ts).abs() > WEBHOOK_TOLERANCE_SECS {
        return false;
    }

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(format!("{}.{}", ts, payload).as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    // Compare against every v1 entry; Stripe sends several during secret
    // rotation.
    signatures.iter().any(|sig| {
        let mut check = HmacSha256::new_from_slice(b"sig-compare").expect("any key size works");
        check.update(sig.as_bytes());
        let a = check.finalize().into_bytes();
        let mut check = HmacSha256::new_from_slice(b"sig-compare").expect("any key size works");
        check.update(expected.as_bytes());
        a == check.finalize().into_bytes()
    })
}

// ── Webhook event handling ──

#[derive(Debug, Deserialize)]
struct StripeEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripeEventObject,
}

#[derive(Debug, Deserialize)]
struct StripeEventObject {
    id: String,
    #[serde(default)]
    metadata: StripeIntentMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct StripeIntentMetadata {
    appointment_id: Option<String>,
    kind: Option<String>,
    tip_cents: Option<String>,
}

/// POST /api/payments/webhook: raw body, verified before parsing.
///
/// Always answers 200 for verified events we don't act on, so Stripe stops
/// retrying them.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    if state.stripe_webhook_secret.is_empty() {
        tracing::error!("STRIPE_WEBHOOK_SECRET not set, rejecting webhook");
        return StatusCode::UNAUTHORIZED;
    }
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let now_ts = chrono::Utc::now().timestamp();
    if !verify_webhook_signature(&body, signature, &state.stripe_webhook_secret, now_ts) {
        tracing::warn!("webhook signature verification failed");
        return StatusCode::UNAUTHORIZED;
    }

    let event: StripeEvent = match serde_json::from_str(&body) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!("unparseable webhook payload: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    let appointment_id = event
        .data
        .object
        .metadata
        .appointment_id
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok());
    let Some(appointment_id) = appointment_id else {
        tracing::info!(
            "ignoring {} for intent {} without appointment metadata",
            event.event_type,
            event.data.object.id
        );
        return StatusCode::OK;
    };
    let kind = event.data.object.metadata.kind.as_deref().unwrap_or("deposit");
    let tip_cents = event
        .data
        .object
        .metadata
        .tip_cents
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    let result = match event.event_type.as_str() {
        "payment_intent.succeeded" => {
            apply_intent_succeeded(&state.db, appointment_id, kind, tip_cents).await
        }
        "payment_intent.payment_failed" => apply_intent_failed(&state.db, appointment_id).await,
        other => {
            tracing::debug!("ignoring webhook event type {}", other);
            Ok(())
        }
    };

    match result {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::error!(
                "webhook handling failed for appointment {}: {}",
                appointment_id,
                e
            );
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Settle a successful intent. Guarded UPDATEs make redelivered events
/// no-ops.
pub async fn apply_intent_succeeded(
    pool: &SqlitePool,
    appointment_id: i64,
    kind: &str,
    tip_cents: i64,
) -> Result<(), ApiError> {
    match kind {
        "closeout" => {
            let transitioned = complete_appointment(pool, appointment_id, tip_cents).await?;
            if transitioned {
                tracing::info!("appointment {} closed out via card", appointment_id);
            }
            Ok(())
        }
        _ => {
            let updated = sqlx::query(
                "UPDATE appointments SET payment_status = ?
                 WHERE id = ? AND payment_status IN (?, ?)",
            )
            .bind(PaymentStatus::PaidDeposit.as_str())
            .bind(appointment_id)
            .bind(PaymentStatus::PendingPayment.as_str())
            .bind(PaymentStatus::PaymentFailed.as_str())
            .execute(pool)
            .await?
            .rows_affected();
            if updated > 0 {
                tracing::info!("deposit settled for appointment {}", appointment_id);
            }
            Ok(())
        }
    }
}

/// A declined deposit keeps the hold: the customer can retry payment until
/// the expiry task reclaims the slot.
pub async fn apply_intent_failed(
    pool: &SqlitePool,
    appointment_id: i64,
) -> Result<(), ApiError> {
    let updated = sqlx::query(
        "UPDATE appointments SET payment_status = ?
         WHERE id = ? AND payment_status = ?",
    )
    .bind(PaymentStatus::PaymentFailed.as_str())
    .bind(appointment_id)
    .bind(PaymentStatus::PendingPayment.as_str())
    .execute(pool)
    .await?
    .rows_affected();
    if updated > 0 {
        tracing::warn!("deposit payment failed for appointment {}", appointment_id);
    }
    Ok(())
}

/// CONFIRMED → COMPLETED with the final tip, awarding loyalty points once.
/// Returns whether this call performed the transition.
pub async fn complete_appointment(
    pool: &SqlitePool,
    appointment_id: i64,
    tip_cents: i64,
) -> Result<bool, ApiError> {
    let updated = sqlx::query(
        "UPDATE appointments SET status = ?, payment_status = ?, tip_cents = ?
         WHERE id = ? AND status = ?",
    )
    .bind(AppointmentStatus::Completed.as_str())
    .bind(PaymentStatus::PaidInFull.as_str())
    .bind(tip_cents.max(0))
    .bind(appointment_id)
    .bind(AppointmentStatus::Confirmed.as_str())
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Ok(false);
    }

    // Points come from the service's current catalog entry; tips never earn
    // points.
    sqlx::query(
        "UPDATE customers
         SET points_balance = points_balance +
             (SELECT s.points_earned FROM appointments a
              JOIN services s ON s.id = a.service_id WHERE a.id = ?)
         WHERE id = (SELECT customer_id FROM appointments WHERE id = ?)",
    )
    .bind(appointment_id)
    .bind(appointment_id)
    .execute(pool)
    .await?;
    Ok(true)
}

// ── Closeout endpoints (admin) ──

async fn closeout_target(state: &AppState, id: i64) -> Result<Appointment, ApiError> {
    let appointment = db::appointment_by_id(&state.db, id).await?;
    match appointment.appointment_status() {
        Some(AppointmentStatus::Confirmed) => Ok(appointment),
        Some(AppointmentStatus::Completed) => Err(ApiError::Validation(
            "appointment is already closed out".into(),
        )),
        _ => Err(ApiError::Validation(
            "only confirmed appointments can be closed out".into(),
        )),
    }
}

/// POST /api/admin/appointments/:id/closeout/cash: remaining balance was
/// collected in person, settle and complete in one step.
pub async fn closeout_cash(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<CloseoutRequest>,
) -> Result<Json<ApiResponse<AppointmentDetail>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    let appointment = closeout_target(&state, id).await?;
    complete_appointment(&state.db, appointment.id, body.tip_cents).await?;
    Ok(Json(ApiResponse::success(
        db::appointment_detail(&state.db, id).await?,
    )))
}

/// POST /api/admin/appointments/:id/closeout/stripe: create a card intent
/// for remaining balance plus tip. Answers 202: completion happens when the
/// success webhook lands.
pub async fn closeout_stripe(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<CloseoutRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CloseoutStripeResponse>>), ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    let appointment = closeout_target(&state, id).await?;
    let tip_cents = body.tip_cents.max(0);
    let amount_cents = appointment.remaining_cents + tip_cents;

    // Nothing left to charge (fully discounted, zero tip): settle in place.
    if amount_cents == 0 {
        complete_appointment(&state.db, appointment.id, 0).await?;
        return Ok((
            StatusCode::OK,
            Json(ApiResponse::success(CloseoutStripeResponse {
                appointment_id: appointment.id,
                amount_cents: 0,
                payment_client_secret: None,
            })),
        ));
    }

    if state.stripe_secret_key.is_empty() {
        return Err(ApiError::PaymentDeclined(
            "payment gateway is not configured".into(),
        ));
    }
    let description = format!(
        "Balance: appointment {} on {} at {}",
        appointment.id, appointment.date, appointment.start_time
    );
    let (intent_id, client_secret) = create_payment_intent(
        &state.stripe_secret_key,
        amount_cents,
        appointment.id,
        "closeout",
        tip_cents,
        &description,
    )
    .await?;

    sqlx::query("UPDATE appointments SET closeout_intent_id = ? WHERE id = ?")
        .bind(&intent_id)
        .bind(appointment.id)
        .execute(&state.db)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(CloseoutStripeResponse {
            appointment_id: appointment.id,
            amount_cents,
            payment_client_secret: client_secret,
        })),
    ))
}

// ── Hold expiry (background task) ──

/// Cancel unconfirmed holds whose deposit never settled within the expiry
/// window. Returns the number of reclaimed appointments.
pub async fn reclaim_expired_holds(
    pool: &SqlitePool,
    hold_expiry_minutes: i64,
    now: NaiveDateTime,
) -> Result<u64, ApiError> {
    let cutoff = (now - chrono::Duration::minutes(hold_expiry_minutes))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();
    let reclaimed = sqlx::query(
        "UPDATE appointments SET status = ?, cancelled_at = ?
         WHERE status = ? AND payment_status IN (?, ?) AND created_at <= ?",
    )
    .bind(AppointmentStatus::Cancelled.as_str())
    .bind(now.format("%Y-%m-%d %H:%M:%S").to_string())
    .bind(AppointmentStatus::PendingConfirmation.as_str())
    .bind(PaymentStatus::PendingPayment.as_str())
    .bind(PaymentStatus::PaymentFailed.as_str())
    .bind(&cutoff)
    .execute(pool)
    .await?
    .rows_affected();

    if reclaimed > 0 {
        tracing::info!("reclaimed {} expired unpaid holds", reclaimed);
    }
    Ok(reclaimed)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookRequest;

    fn sign(payload: &str, secret: &str, ts: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", ts, payload).as_bytes());
        format!("t={},v1={}", ts, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_webhook_signature_roundtrip() {
        let payload = r#"{"type":"payment_intent.succeeded"}"#;
        let header = sign(payload, "whsec_test", 1_900_000_000);
        assert!(verify_webhook_signature(payload, &header, "whsec_test", 1_900_000_000));
    }

    #[test]
    fn test_webhook_signature_rejects_wrong_secret_and_tampering() {
        let payload = r#"{"amount":3000}"#;
        let header = sign(payload, "whsec_test", 1_900_000_000);
        assert!(!verify_webhook_signature(payload, &header, "whsec_other", 1_900_000_000));
        assert!(!verify_webhook_signature(
            r#"{"amount":9999}"#,
            &header,
            "whsec_test",
            1_900_000_000
        ));
    }

    #[test]
    fn test_webhook_signature_rejects_stale_timestamp() {
        let payload = "{}";
        let header = sign(payload, "whsec_test", 1_900_000_000);
        assert!(!verify_webhook_signature(
            payload,
            &header,
            "whsec_test",
            1_900_000_000 + WEBHOOK_TOLERANCE_SECS + 1
        ));
    }

    #[test]
    fn test_webhook_signature_rejects_malformed_header() {
        assert!(!verify_webhook_signature("{}", "", "whsec_test", 0));
        assert!(!verify_webhook_signature("{}", "t=abc,v1=", "whsec_test", 0));
        assert!(!verify_webhook_signature("{}", "v1=deadbeef", "whsec_test", 0));
    }

    #[test]
    fn test_event_parsing_pulls_metadata() {
        let body = r#"{
            "type": "payment_intent.succeeded",
            "data": {"object": {"id": "pi_123", "metadata": {
                "appointment_id": "7", "kind": "closeout", "tip_cents": "500"
            }}}
        }"#;
        let event: StripeEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.event_type, "payment_intent.succeeded");
        assert_eq!(event.data.object.metadata.appointment_id.as_deref(), Some("7"));
        assert_eq!(event.data.object.metadata.kind.as_deref(), Some("closeout"));
        assert_eq!(event.data.object.metadata.tip_cents.as_deref(), Some("500"));
    }

    async fn booked_appointment(pool: &SqlitePool) -> Appointment {
        let state = AppState {
            db: pool.clone(),
            admin_token: String::new(),
            stripe_secret_key: String::new(),
            stripe_webhook_secret: String::new(),
            guest_link_secret: "test".into(),
            tz_offset_minutes: 0,
            started_at: std::time::Instant::now(),
            date_locks: db::DateLocks::new(),
        };
        let req = BookRequest {
            service_id: 1,
            add_on_ids: vec![],
            date: "2030-06-03".into(),
            time: "10:00".into(),
            customer_name: "Jordan Reyes".into(),
            customer_email: "jordan@example.com".into(),
            promo_code: None,
        };
        let (appt, _) = crate::handlers::client::commit_booking(&state, &req)
            .await
            .unwrap();
        appt
    }

    #[tokio::test]
    async fn test_deposit_success_is_idempotent() {
        let pool = db::test_pool().await;
        let appt = booked_appointment(&pool).await;

        apply_intent_succeeded(&pool, appt.id, "deposit", 0).await.unwrap();
        let a = db::appointment_by_id(&pool, appt.id).await.unwrap();
        assert_eq!(a.payment_status, "PAID_DEPOSIT");
        assert_eq!(a.status, "PENDING_CONFIRMATION"); // still needs admin confirm

        // Redelivered event: no change.
        apply_intent_succeeded(&pool, appt.id, "deposit", 0).await.unwrap();
        let a = db::appointment_by_id(&pool, appt.id).await.unwrap();
        assert_eq!(a.payment_status, "PAID_DEPOSIT");
    }

    #[tokio::test]
    async fn test_failed_deposit_keeps_hold_and_allows_retry() {
        let pool = db::test_pool().await;
        let appt = booked_appointment(&pool).await;

        apply_intent_failed(&pool, appt.id).await.unwrap();
        let a = db::appointment_by_id(&pool, appt.id).await.unwrap();
        assert_eq!(a.payment_status, "PAYMENT_FAILED");
        assert_eq!(a.status, "PENDING_CONFIRMATION"); // slot stays held

        // A later successful retry still settles the deposit.
        apply_intent_succeeded(&pool, appt.id, "deposit", 0).await.unwrap();
        let a = db::appointment_by_id(&pool, appt.id).await.unwrap();
        assert_eq!(a.payment_status, "PAID_DEPOSIT");
    }

    #[tokio::test]
    async fn test_closeout_completes_and_awards_points_once() {
        let pool = db::test_pool().await;
        let appt = booked_appointment(&pool).await;
        sqlx::query("UPDATE appointments SET status = 'CONFIRMED', payment_status = 'PAID_DEPOSIT' WHERE id = ?")
            .bind(appt.id)
            .execute(&pool)
            .await
            .unwrap();

        assert!(complete_appointment(&pool, appt.id, 1500).await.unwrap());
        let a = db::appointment_by_id(&pool, appt.id).await.unwrap();
        assert_eq!(a.status, "COMPLETED");
        assert_eq!(a.payment_status, "PAID_IN_FULL");
        assert_eq!(a.tip_cents, 1500);

        let points: i64 = sqlx::query_scalar("SELECT points_balance FROM customers WHERE id = ?")
            .bind(appt.customer_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(points, 85); // Silk Press catalog points

        // Redelivered closeout event must not double-award.
        assert!(!complete_appointment(&pool, appt.id, 1500).await.unwrap());
        let points: i64 = sqlx::query_scalar("SELECT points_balance FROM customers WHERE id = ?")
            .bind(appt.customer_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(points, 85);
    }

    #[tokio::test]
    async fn test_closeout_requires_confirmed_status() {
        let pool = db::test_pool().await;
        let appt = booked_appointment(&pool).await;
        // Still PENDING_CONFIRMATION: no transition, no points.
        assert!(!complete_appointment(&pool, appt.id, 0).await.unwrap());
        let a = db::appointment_by_id(&pool, appt.id).await.unwrap();
        assert_eq!(a.status, "PENDING_CONFIRMATION");
    }

    #[tokio::test]
    async fn test_reclaim_expired_holds() {
        let pool = db::test_pool().await;
        let unpaid = booked_appointment(&pool).await;
        let now = chrono::NaiveDate::from_ymd_opt(2030, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();

        // Backdate the hold past the expiry window.
        sqlx::query("UPDATE appointments SET created_at = '2030-06-01 11:00:00' WHERE id = ?")
            .bind(unpaid.id)
            .execute(&pool)
            .await
            .unwrap();
        let reclaimed = reclaim_expired_holds(&pool, 30, now).await.unwrap();
        assert_eq!(reclaimed, 1);
        let a = db::appointment_by_id(&pool, unpaid.id).await.unwrap();
        assert_eq!(a.status, "CANCELLED");

        // A settled deposit is never reclaimed, however old the hold.
        let paid = {
            let state = AppState {
                db: pool.clone(),
                admin_token: String::new(),
                stripe_secret_key: String::new(),
                stripe_webhook_secret: String::new(),
                guest_link_secret: "test".into(),
                tz_offset_minutes: 0,
                started_at: std::time::Instant::now(),
                date_locks: db::DateLocks::new(),
            };
            let req = BookRequest {
                service_id: 1,
                add_on_ids: vec![],
                date: "2030-06-03".into(),
                time: "13:00".into(),
                customer_name: "Sam Lee".into(),
                customer_email: "sam@example.com".into(),
                promo_code: None,
            };
            crate::handlers::client::commit_booking(&state, &req).await.unwrap().0
        };
        sqlx::query(
            "UPDATE appointments SET payment_status = 'PAID_DEPOSIT', created_at = '2030-06-01 00:00:00' WHERE id = ?",
        )
        .bind(paid.id)
        .execute(&pool)
        .await
        .unwrap();
        let reclaimed = reclaim_expired_holds(&pool, 30, now).await.unwrap();
        assert_eq!(reclaimed, 0);
        let a = db::appointment_by_id(&pool, paid.id).await.unwrap();
        assert_eq!(a.status, "PENDING_CONFIRMATION");
    }
}
