use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::{auth, db, errors::ApiError, models::*, pricing, scheduling, AppState};

/// Reschedule with deposit transfer is only allowed this far ahead.
const RESCHEDULE_CUTOFF_HOURS: i64 = 48;

// ── Time helpers ──

/// Whether an offset-from-UTC in minutes is representable as a fixed
/// timezone (strictly within ±24h). Checked once at startup.
pub fn valid_tz_offset(minutes: i64) -> bool {
    minutes
        .checked_mul(60)
        .and_then(|secs| i32::try_from(secs).ok())
        .and_then(FixedOffset::east_opt)
        .is_some()
}

/// "Now" as a naive local instant in the business's fixed timezone.
/// The offset has passed `valid_tz_offset` at startup.
pub fn business_now(tz_offset_minutes: i64) -> NaiveDateTime {
    let offset = FixedOffset::east_opt((tz_offset_minutes * 60) as i32)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
    Utc::now().with_timezone(&offset).naive_local()
}

fn parse_date(s: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| ApiError::Validation(format!("invalid date {:?}, expected YYYY-MM-DD", s)))
}

fn parse_time(s: &str) -> Result<NaiveTime, ApiError> {
    scheduling::parse_hm(s)
        .ok_or_else(|| ApiError::Validation(format!("invalid time {:?}, expected HH:MM", s)))
}

fn parse_add_on_csv(s: Option<&str>) -> Result<Vec<i64>, ApiError> {
    let Some(s) = s else { return Ok(Vec::new()) };
    let mut ids = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        ids.push(
            part.parse::<i64>()
                .map_err(|_| ApiError::Validation(format!("invalid add-on id {:?}", part)))?,
        );
    }
    Ok(ids)
}

// ── Promo / discount resolution ──

/// Strict promo lookup: unknown, inactive, expired or exhausted codes fail.
pub async fn resolve_promo(
    pool: &SqlitePool,
    code: &str,
    today: NaiveDate,
) -> Result<PromoCode, ApiError> {
    let promo = db::find_promo(pool, code)
        .await?
        .ok_or_else(|| ApiError::InvalidPromo(format!("unknown code {:?}", code.trim())))?;
    if let Some(reason) = pricing::promo_rejection(&promo, today) {
        return Err(ApiError::InvalidPromo(reason.into()));
    }
    Ok(promo)
}

/// Consume one promo use. `resolve_promo` works from a read that may be
/// stale by the time the commit lands, so the UPDATE carries its own guard
/// and refuses to push `times_used` past `max_uses`.
async fn reserve_promo_use(pool: &SqlitePool, promo: &PromoCode) -> Result<(), ApiError> {
    let reserved = sqlx::query(
        "UPDATE promo_codes SET times_used = times_used + 1
         WHERE id = ? AND is_active = 1 AND (max_uses IS NULL OR times_used < max_uses)",
    )
    .bind(promo.id)
    .execute(pool)
    .await?
    .rows_affected();
    if reserved == 0 {
        return Err(ApiError::InvalidPromo(
            "promo code has no uses remaining".into(),
        ));
    }
    Ok(())
}

/// Return a promo use when the booking it was reserved for is rolled back.
async fn release_promo_use(pool: &SqlitePool, code: &str) -> Result<(), ApiError> {
    sqlx::query("UPDATE promo_codes SET times_used = MAX(times_used - 1, 0) WHERE code = ?")
        .bind(code)
        .execute(pool)
        .await?;
    Ok(())
}

/// Ambassador percentage for a known customer, absent an explicit promo.
async fn ambassador_percent(
    pool: &SqlitePool,
    email: Option<&str>,
    policy: &BookingPolicy,
) -> Result<Option<i64>, ApiError> {
    let Some(email) = email else { return Ok(None) };
    Ok(db::find_customer_by_email(pool, email)
        .await?
        .filter(|c| c.is_ambassador)
        .map(|_| policy.ambassador_discount_percent))
}

fn quote_view(
    quote: pricing::Quote,
    add_ons: &[AddOn],
    promo_error: Option<String>,
) -> QuoteView {
    QuoteView {
        service_name: quote.service_name,
        total_minutes: quote.total_minutes,
        total_cents: quote.total_cents,
        deposit_cents: quote.deposit_cents,
        discount_percent: quote.discount_percent,
        discount_cents: quote.discount_cents,
        remaining_cents: quote.remaining_cents,
        tip_cents: quote.tip_cents,
        add_ons: add_ons
            .iter()
            .map(|a| QuoteAddOnView {
                id: a.id,
                name: a.name.clone(),
                price_cents: a.price_cents,
                duration_min: a.duration_min,
            })
            .collect(),
        promo_error,
    }
}

// ── Endpoints ──

/// GET /api/services: active catalog for the booking flow.
pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<Service>>>, ApiError> {
    let services = sqlx::query_as::<_, Service>(
        "SELECT id, name, description, price_cents, deposit_cents, duration_min,
                points_earned, is_active, sort_order
         FROM services WHERE is_active = 1 ORDER BY sort_order ASC",
    )
    .fetch_all(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(services)))
}

/// GET /api/add-ons: active add-ons selectable at booking time.
pub async fn list_add_ons(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<AddOn>>>, ApiError> {
    let add_ons = sqlx::query_as::<_, AddOn>(
        "SELECT id, name, price_cents, duration_min, is_active
         FROM add_ons WHERE is_active = 1 ORDER BY id ASC",
    )
    .fetch_all(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(add_ons)))
}

/// GET /api/availability?service_id=N&date=YYYY-MM-DD&add_on_ids=1,3
///
/// Read-only and lock-free: staleness against concurrent bookings is
/// resolved by the re-check inside the booking commit.
pub async fn availability(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<ApiResponse<AvailabilityResponse>>, ApiError> {
    let date = parse_date(&query.date)?;
    let add_on_ids = parse_add_on_csv(query.add_on_ids.as_deref())?;

    let policy = db::load_policy(&state.db).await?;
    let service = db::active_service(&state.db, query.service_id).await?;
    let add_ons = db::active_add_ons(&state.db, &add_on_ids).await?;
    let total_duration_min =
        service.duration_min + add_ons.iter().map(|a| a.duration_min).sum::<i64>();

    let hours = db::hours_for_weekday(&state.db, scheduling::weekday_index(date)).await?;
    let now = business_now(state.tz_offset_minutes);
    let mut slots = scheduling::generate_slots(
        date,
        hours.as_ref(),
        total_duration_min,
        policy.slot_granularity_minutes,
        now,
        policy.lead_time_minutes,
    );

    let date_str = date.format("%Y-%m-%d").to_string();
    let booked = db::booked_intervals_on(&state.db, &date_str, None).await?;
    scheduling::filter_available(&mut slots, total_duration_min, &booked, policy.buffer_minutes);

    Ok(Json(ApiResponse::success(AvailabilityResponse {
        date: date_str,
        total_duration_min,
        slots: slots
            .iter()
            .map(|s| SlotView {
                time: scheduling::fmt_hm(s.time),
                available: s.available,
            })
            .collect(),
    })))
}

/// POST /api/pricing/preview: pure quote, callable at arbitrary frequency.
///
/// A bad promo code degrades to a no-discount quote with `promo_error` set;
/// only the booking commit hard-fails on it.
pub async fn pricing_preview(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PricingPreviewRequest>,
) -> Result<Json<ApiResponse<QuoteView>>, ApiError> {
    let policy = db::load_policy(&state.db).await?;
    let service = db::active_service(&state.db, body.service_id).await?;
    let add_ons = db::active_add_ons(&state.db, &body.add_on_ids).await?;
    let today = business_now(state.tz_offset_minutes).date();

    let (promo, promo_error) = match body.promo_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => match resolve_promo(&state.db, code, today).await {
            Ok(p) => (Some(p), None),
            Err(ApiError::InvalidPromo(msg)) => (None, Some(msg)),
            Err(e) => return Err(e),
        },
        _ => (None, None),
    };

    let ambassador = if promo.is_none() {
        ambassador_percent(&state.db, body.customer_email.as_deref(), &policy).await?
    } else {
        None
    };

    let quote = pricing::compute_quote(
        &service,
        &add_ons,
        pricing::choose_discount(promo.as_ref(), ambassador),
    );
    Ok(Json(ApiResponse::success(quote_view(quote, &add_ons, promo_error))))
}

/// POST /api/appointments/book: the serialized check-then-insert commit.
pub async fn book(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BookRequest>,
) -> Result<(StatusCode, Json<ApiResponse<BookResponse>>), ApiError> {
    let (appointment, cancel_token) = commit_booking(&state, &body).await?;

    // Deposit collection happens after the row exists; a gateway failure
    // releases the hold instead of leaving the appointment in limbo.
    let mut payment_client_secret = None;
    if appointment.deposit_cents > 0 {
        if state.stripe_secret_key.is_empty() {
            tracing::warn!(
                "STRIPE_SECRET_KEY not set: appointment {} stays PENDING_PAYMENT without an intent",
                appointment.id
            );
        } else {
            let description = format!(
                "Deposit: appointment {} on {} at {}",
                appointment.id, appointment.date, appointment.start_time
            );
            match super::payment::create_payment_intent(
                &state.stripe_secret_key,
                appointment.deposit_cents,
                appointment.id,
                "deposit",
                0,
                &description,
            )
            .await
            {
                Ok((intent_id, client_secret)) => {
                    sqlx::query("UPDATE appointments SET deposit_intent_id = ? WHERE id = ?")
                        .bind(&intent_id)
                        .bind(appointment.id)
                        .execute(&state.db)
                        .await?;
                    payment_client_secret = client_secret;
                }
                Err(e) => {
                    tracing::error!(
                        "deposit intent creation failed for appointment {}: {}",
                        appointment.id,
                        e
                    );
                    let now = business_now(state.tz_offset_minutes);
                    cancel_appointment(&state.db, &appointment, now, Some("gateway failure"))
                        .await?;
                    if let Some(code) = appointment.promo_code.as_deref() {
                        release_promo_use(&state.db, code).await?;
                    }
                    return Err(ApiError::Gateway(e));
                }
            }
        }
    }

    let detail = db::appointment_detail(&state.db, appointment.id).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(BookResponse {
            appointment: detail,
            payment_client_secret,
            cancel_token,
        })),
    ))
}

/// GET /api/appointments/:id/status: poll target for payment settling.
pub async fn appointment_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<AppointmentStatusResponse>>, ApiError> {
    let appointment = db::appointment_by_id(&state.db, id).await?;
    Ok(Json(ApiResponse::success(AppointmentStatusResponse {
        status: appointment.status,
        payment_status: appointment.payment_status,
    })))
}

/// PATCH /api/appointments/:id/cancel: customer self-service cancellation.
/// Possession proof is the booking email; the deposit is never refunded.
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<ApiResponse<AppointmentDetail>>, ApiError> {
    let appointment = db::appointment_by_id(&state.db, id).await?;
    let email = body
        .customer_email
        .as_deref()
        .ok_or_else(|| ApiError::Validation("customer_email is required".into()))?;
    let owner = db::find_customer_by_email(&state.db, email)
        .await?
        .filter(|c| c.id == appointment.customer_id);
    if owner.is_none() {
        // Don't reveal whether the appointment exists to other emails.
        return Err(ApiError::NotFound(format!("appointment {}", id)));
    }

    let now = business_now(state.tz_offset_minutes);
    cancel_appointment(&state.db, &appointment, now, body.reason.as_deref()).await?;
    Ok(Json(ApiResponse::success(
        db::appointment_detail(&state.db, id).await?,
    )))
}

/// POST /api/appointments/:id/reschedule: cancel-old + book-new with the
/// deposit carried forward, allowed only ≥48h before the old start.
pub async fn reschedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<RescheduleRequest>,
) -> Result<Json<ApiResponse<BookResponse>>, ApiError> {
    let appointment = db::appointment_by_id(&state.db, id).await?;
    let owner = db::find_customer_by_email(&state.db, &body.customer_email)
        .await?
        .filter(|c| c.id == appointment.customer_id)
        .ok_or_else(|| ApiError::NotFound(format!("appointment {}", id)))?;

    let (new_appointment, cancel_token) =
        reschedule_appointment(&state, &appointment, &owner, &body.date, &body.time).await?;

    let detail = db::appointment_detail(&state.db, new_appointment.id).await?;
    Ok(Json(ApiResponse::success(BookResponse {
        appointment: detail,
        payment_client_secret: None,
        cancel_token,
    })))
}

/// GET /api/appointments/guest/:token: guest lookup via cancellation link.
pub async fn guest_detail(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<ApiResponse<AppointmentDetail>>, ApiError> {
    let appointment = appointment_by_token(&state.db, &token).await?;
    Ok(Json(ApiResponse::success(
        db::appointment_detail(&state.db, appointment.id).await?,
    )))
}

/// POST /api/appointments/guest/cancel/:token: idempotent guest cancel.
/// Replaying the link against an already-cancelled appointment succeeds.
pub async fn guest_cancel(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<ApiResponse<AppointmentStatusResponse>>, ApiError> {
    let appointment = appointment_by_token(&state.db, &token).await?;
    if appointment
        .appointment_status()
        .is_some_and(|s| s.is_terminal())
    {
        return Err(ApiError::InvalidToken);
    }
    let now = business_now(state.tz_offset_minutes);
    cancel_appointment(&state.db, &appointment, now, Some("guest link")).await?;
    let refreshed = db::appointment_by_id(&state.db, appointment.id).await?;
    Ok(Json(ApiResponse::success(AppointmentStatusResponse {
        status: refreshed.status,
        payment_status: refreshed.payment_status,
    })))
}

async fn appointment_by_token(pool: &SqlitePool, token: &str) -> Result<Appointment, ApiError> {
    sqlx::query_as::<_, Appointment>("SELECT * FROM appointments WHERE cancel_token = ?")
        .bind(token)
        .fetch_optional(pool)
        .await?
        .ok_or(ApiError::InvalidToken)
}

// ── Core operations (shared with admin handlers and tests) ──

/// Validate and insert a booking. The conflict re-check and the insert run
/// under the per-date lock, so two concurrent commits for the same slot
/// cannot both pass.
pub async fn commit_booking(
    state: &AppState,
    req: &BookRequest,
) -> Result<(Appointment, String), ApiError> {
    let date = parse_date(&req.date)?;
    let time = parse_time(&req.time)?;
    if req.customer_name.trim().is_empty() || !req.customer_email.contains('@') {
        return Err(ApiError::Validation(
            "customer name and a valid email are required".into(),
        ));
    }

    let policy = db::load_policy(&state.db).await?;
    let service = db::active_service(&state.db, req.service_id).await?;
    let add_ons = db::active_add_ons(&state.db, &req.add_on_ids).await?;
    let now = business_now(state.tz_offset_minutes);

    // Promo hard-fails at commit time (unlike preview) to block stale
    // discounts; ambassador applies only without a promo, never stacked.
    let promo = match req.promo_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => Some(resolve_promo(&state.db, code, now.date()).await?),
        _ => None,
    };
    let ambassador = if promo.is_none() {
        ambassador_percent(&state.db, Some(&req.customer_email), &policy).await?
    } else {
        None
    };
    let quote = pricing::compute_quote(
        &service,
        &add_ons,
        pricing::choose_discount(promo.as_ref(), ambassador),
    );

    validate_slot_request(state, date, time, quote.total_minutes, &policy, now).await?;

    let date_str = date.format("%Y-%m-%d").to_string();
    let time_str = scheduling::fmt_hm(time);

    // Serialize the check-then-insert per calendar date.
    let _guard = state.date_locks.acquire(date).await;

    let booked = db::booked_intervals_on(&state.db, &date_str, None).await?;
    let mut candidate = vec![scheduling::SlotCandidate {
        date,
        time,
        available: true,
    }];
    scheduling::filter_available(&mut candidate, quote.total_minutes, &booked, policy.buffer_minutes);
    if !candidate[0].available {
        return Err(ApiError::SlotUnavailable);
    }

    // Reserve the promo use before the row exists. Two commits on different
    // dates can both pass `resolve_promo` with a stale read; the counter
    // guard inside the UPDATE is the real cap.
    if let Some(p) = &promo {
        reserve_promo_use(&state.db, p).await?;
    }

    let customer =
        db::find_or_create_customer(&state.db, &req.customer_name, &req.customer_email).await?;
    let created_at = now.format("%Y-%m-%d %H:%M:%S").to_string();
    let payment_status = if quote.deposit_cents == 0 {
        PaymentStatus::NoDepositRequired
    } else {
        PaymentStatus::PendingPayment
    };

    let appointment_id = insert_appointment(
        &state.db,
        &service,
        &add_ons,
        customer.id,
        &date_str,
        &time_str,
        &quote,
        AppointmentStatus::PendingConfirmation,
        payment_status,
        promo.as_ref().map(|p| p.code.as_str()),
        &created_at,
    )
    .await?;

    let cancel_token = attach_cancel_token(state, appointment_id, &customer.email, &created_at).await?;
    let appointment = db::appointment_by_id(&state.db, appointment_id).await?;

    tracing::info!(
        "booked appointment {} ({} on {} at {}, {} min, {} cents total)",
        appointment_id,
        service.name,
        date_str,
        time_str,
        quote.total_minutes,
        quote.total_cents
    );
    Ok((appointment, cancel_token))
}

/// Defensive re-checks the slot generator should already have enforced:
/// closed day / out-of-hours → ClosedForBusiness, past or inside the lead
/// window → SlotUnavailable, off-grid time → validation error.
async fn validate_slot_request(
    state: &AppState,
    date: NaiveDate,
    time: NaiveTime,
    total_duration_min: i64,
    policy: &BookingPolicy,
    now: NaiveDateTime,
) -> Result<(), ApiError> {
    let hours = db::hours_for_weekday(&state.db, scheduling::weekday_index(date)).await?;
    let hours = match hours {
        Some(h) if !h.is_closed => h,
        _ => return Err(ApiError::ClosedForBusiness),
    };
    let (open, close) = match (
        scheduling::parse_hm(&hours.open_time),
        scheduling::parse_hm(&hours.close_time),
    ) {
        (Some(o), Some(c)) if o < c => (o, c),
        _ => return Err(ApiError::ClosedForBusiness),
    };

    let start_rel = time.signed_duration_since(open).num_minutes();
    let day_span = close.signed_duration_since(open).num_minutes();
    if start_rel < 0 || start_rel + total_duration_min > day_span {
        return Err(ApiError::ClosedForBusiness);
    }
    if start_rel % policy.slot_granularity_minutes != 0 {
        return Err(ApiError::Validation(
            "requested time is not on the slot grid".into(),
        ));
    }
    if date.and_time(time) < now + Duration::minutes(policy.lead_time_minutes) {
        return Err(ApiError::SlotUnavailable);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn insert_appointment(
    pool: &SqlitePool,
    service: &Service,
    add_ons: &[AddOn],
    customer_id: i64,
    date: &str,
    time: &str,
    quote: &pricing::Quote,
    status: AppointmentStatus,
    payment_status: PaymentStatus,
    promo_code: Option<&str>,
    created_at: &str,
) -> Result<i64, ApiError> {
    let appointment_id = sqlx::query(
        "INSERT INTO appointments (service_id, customer_id, date, start_time,
            total_duration_min, status, payment_status, total_cents, deposit_cents,
            discount_percent, discount_cents, remaining_cents, tip_cents, promo_code,
            created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(service.id)
    .bind(customer_id)
    .bind(date)
    .bind(time)
    .bind(quote.total_minutes)
    .bind(status.as_str())
    .bind(payment_status.as_str())
    .bind(quote.total_cents)
    .bind(quote.deposit_cents)
    .bind(quote.discount_percent)
    .bind(quote.discount_cents)
    .bind(quote.remaining_cents)
    .bind(promo_code)
    .bind(created_at)
    .execute(pool)
    .await?
    .last_insert_rowid();

    // Freeze the add-on selection: later catalog edits must not change what
    // this appointment was sold as.
    for add_on in add_ons {
        sqlx::query(
            "INSERT INTO appointment_add_ons (appointment_id, add_on_id, name, price_cents, duration_min)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(appointment_id)
        .bind(add_on.id)
        .bind(&add_on.name)
        .bind(add_on.price_cents)
        .bind(add_on.duration_min)
        .execute(pool)
        .await?;
    }

    Ok(appointment_id)
}

/// Token derivation needs the row id, so it's attached right after insert.
async fn attach_cancel_token(
    state: &AppState,
    appointment_id: i64,
    email: &str,
    created_at: &str,
) -> Result<String, ApiError> {
    let token = auth::guest_token(
        &state.guest_link_secret,
        &appointment_id.to_string(),
        email,
        created_at,
        "cancel",
    );
    sqlx::query("UPDATE appointments SET cancel_token = ? WHERE id = ?")
        .bind(&token)
        .bind(appointment_id)
        .execute(&state.db)
        .await?;
    Ok(token)
}

/// Transition to CANCELLED. Idempotent: an already-cancelled appointment is
/// a no-op success (link-replay safety). The deposit is never refunded here;
/// money fields are left as the historical record.
pub async fn cancel_appointment(
    pool: &SqlitePool,
    appointment: &Appointment,
    now: NaiveDateTime,
    reason: Option<&str>,
) -> Result<(), ApiError> {
    match appointment.appointment_status() {
        Some(AppointmentStatus::Cancelled) => return Ok(()),
        Some(s) if s.is_terminal() => {
            return Err(ApiError::Validation(
                "appointment can no longer be cancelled".into(),
            ))
        }
        Some(_) => {}
        None => {
            return Err(ApiError::Validation(
                "appointment is in an unknown state".into(),
            ))
        }
    }

    sqlx::query("UPDATE appointments SET status = ?, cancelled_at = ? WHERE id = ?")
        .bind(AppointmentStatus::Cancelled.as_str())
        .bind(now.format("%Y-%m-%d %H:%M:%S").to_string())
        .bind(appointment.id)
        .execute(pool)
        .await?;

    tracing::info!(
        "cancelled appointment {} (reason: {})",
        appointment.id,
        reason.unwrap_or("none given")
    );
    Ok(())
}

/// Cancel-old + book-new with the deposit carried forward. Pricing stays
/// frozen: only the date/time change, totals and the add-on snapshot are
/// copied verbatim.
pub async fn reschedule_appointment(
    state: &AppState,
    old: &Appointment,
    owner: &Customer,
    new_date: &str,
    new_time: &str,
) -> Result<(Appointment, String), ApiError> {
    match old.appointment_status() {
        Some(AppointmentStatus::PendingConfirmation) | Some(AppointmentStatus::Confirmed) => {}
        _ => {
            return Err(ApiError::Validation(
                "only pending or confirmed appointments can be rescheduled".into(),
            ))
        }
    }

    let now = business_now(state.tz_offset_minutes);
    let old_start = parse_date(&old.date)?.and_time(parse_time(&old.start_time)?);
    if old_start.signed_duration_since(now) < Duration::hours(RESCHEDULE_CUTOFF_HOURS) {
        return Err(ApiError::Validation(format!(
            "rescheduling requires at least {}h notice; cancel instead (the deposit is not transferred)",
            RESCHEDULE_CUTOFF_HOURS
        )));
    }

    let date = parse_date(new_date)?;
    let time = parse_time(new_time)?;
    let policy = db::load_policy(&state.db).await?;
    validate_slot_request(state, date, time, old.total_duration_min, &policy, now).await?;

    let date_str = date.format("%Y-%m-%d").to_string();
    let time_str = scheduling::fmt_hm(time);

    let _guard = state.date_locks.acquire(date).await;

    // The appointment being moved must not block its own new slot.
    let booked = db::booked_intervals_on(&state.db, &date_str, Some(old.id)).await?;
    let mut candidate = vec![scheduling::SlotCandidate {
        date,
        time,
        available: true,
    }];
    scheduling::filter_available(
        &mut candidate,
        old.total_duration_min,
        &booked,
        policy.buffer_minutes,
    );
    if !candidate[0].available {
        return Err(ApiError::SlotUnavailable);
    }

    let created_at = now.format("%Y-%m-%d %H:%M:%S").to_string();
    let new_id = sqlx::query(
        "INSERT INTO appointments (service_id, customer_id, date, start_time,
            total_duration_min, status, payment_status, total_cents, deposit_cents,
            discount_percent, discount_cents, remaining_cents, tip_cents, promo_code,
            created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(old.service_id)
    .bind(old.customer_id)
    .bind(&date_str)
    .bind(&time_str)
    .bind(old.total_duration_min)
    .bind(AppointmentStatus::PendingConfirmation.as_str())
    .bind(&old.payment_status) // deposit transfer: paid stays paid
    .bind(old.total_cents)
    .bind(old.deposit_cents)
    .bind(old.discount_percent)
    .bind(old.discount_cents)
    .bind(old.remaining_cents)
    .bind(&old.promo_code)
    .bind(&created_at)
    .execute(&state.db)
    .await?
    .last_insert_rowid();

    sqlx::query(
        "INSERT INTO appointment_add_ons (appointment_id, add_on_id, name, price_cents, duration_min)
         SELECT ?, add_on_id, name, price_cents, duration_min
         FROM appointment_add_ons WHERE appointment_id = ?",
    )
    .bind(new_id)
    .bind(old.id)
    .execute(&state.db)
    .await?;

    cancel_appointment(&state.db, old, now, Some("rescheduled")).await?;

    let cancel_token = attach_cancel_token(state, new_id, &owner.email, &created_at).await?;
    let new_appointment = db::appointment_by_id(&state.db, new_id).await?;
    tracing::info!(
        "rescheduled appointment {} → {} ({} {} → {} {})",
        old.id,
        new_id,
        old.date,
        old.start_time,
        date_str,
        time_str
    );
    Ok((new_appointment, cancel_token))
}

// ── Tests ──
