use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;

use crate::{
    auth, db,
    errors::ApiError,
    models::*,
    pricing::{DISCOUNT_TYPE_FIXED, DISCOUNT_TYPE_PERCENT},
    AppState,
};

use super::client::{business_now, cancel_appointment};

// ── Services ──

/// GET /api/admin/services: full catalog, inactive rows included.
pub async fn list_services(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<Service>>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    let services = sqlx::query_as::<_, Service>(
        "SELECT id, name, description, price_cents, deposit_cents, duration_min,
                points_earned, is_active, sort_order
         FROM services ORDER BY sort_order ASC, id ASC",
    )
    .fetch_all(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(services)))
}

pub async fn create_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateServiceRequest>,
) -> Result<Json<ApiResponse<Service>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("service name is required".into()));
    }
    if body.price_cents < 0 || body.duration_min <= 0 {
        return Err(ApiError::Validation(
            "price must be non-negative and duration positive".into(),
        ));
    }
    let deposit = body.deposit_cents.unwrap_or(0);
    if deposit < 0 || deposit > body.price_cents {
        return Err(ApiError::Validation(
            "deposit must be between 0 and the full price".into(),
        ));
    }

    let id = sqlx::query(
        "INSERT INTO services (name, description, price_cents, deposit_cents, duration_min,
                               points_earned, sort_order)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(body.name.trim())
    .bind(body.description.as_deref().unwrap_or(""))
    .bind(body.price_cents)
    .bind(deposit)
    .bind(body.duration_min)
    .bind(body.points_earned.unwrap_or(0))
    .bind(body.sort_order.unwrap_or(0))
    .execute(&state.db)
    .await?
    .last_insert_rowid();

    Ok(Json(ApiResponse::success(service_by_id(&state, id).await?)))
}

pub async fn update_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<UpdateServiceRequest>,
) -> Result<Json<ApiResponse<Service>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    // COALESCE keeps any field the request omitted.
    sqlx::query(
        "UPDATE services SET
            name = COALESCE(?, name),
            description = COALESCE(?, description),
            price_cents = COALESCE(?, price_cents),
            deposit_cents = COALESCE(?, deposit_cents),
            duration_min = COALESCE(?, duration_min),
            points_earned = COALESCE(?, points_earned),
            is_active = COALESCE(?, is_active),
            sort_order = COALESCE(?, sort_order)
         WHERE id = ?",
    )
    .bind(body.name.as_deref().map(str::trim))
    .bind(body.description)
    .bind(body.price_cents)
    .bind(body.deposit_cents)
    .bind(body.duration_min)
    .bind(body.points_earned)
    .bind(body.is_active)
    .bind(body.sort_order)
    .bind(id)
    .execute(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(service_by_id(&state, id).await?)))
}

/// DELETE deactivates: appointment rows reference services forever.
pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Service>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    sqlx::query("UPDATE services SET is_active = 0 WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(ApiResponse::success(service_by_id(&state, id).await?)))
}

async fn service_by_id(state: &AppState, id: i64) -> Result<Service, ApiError> {
    sqlx::query_as::<_, Service>(
        "SELECT id, name, description, price_cents, deposit_cents, duration_min,
                points_earned, is_active, sort_order
         FROM services WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("service {}", id)))
}

// ── Add-ons ──

pub async fn list_add_ons(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<AddOn>>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    let add_ons = sqlx::query_as::<_, AddOn>(
        "SELECT id, name, price_cents, duration_min, is_active FROM add_ons ORDER BY id ASC",
    )
    .fetch_all(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(add_ons)))
}

pub async fn create_add_on(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateAddOnRequest>,
) -> Result<Json<ApiResponse<AddOn>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    if body.name.trim().is_empty() || body.price_cents < 0 || body.duration_min < 0 {
        return Err(ApiError::Validation("invalid add-on fields".into()));
    }
    let id = sqlx::query("INSERT INTO add_ons (name, price_cents, duration_min) VALUES (?, ?, ?)")
        .bind(body.name.trim())
        .bind(body.price_cents)
        .bind(body.duration_min)
        .execute(&state.db)
        .await?
        .last_insert_rowid();
    Ok(Json(ApiResponse::success(add_on_by_id(&state, id).await?)))
}

pub async fn update_add_on(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<UpdateAddOnRequest>,
) -> Result<Json<ApiResponse<AddOn>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    sqlx::query(
        "UPDATE add_ons SET
            name = COALESCE(?, name),
            price_cents = COALESCE(?, price_cents),
            duration_min = COALESCE(?, duration_min),
            is_active = COALESCE(?, is_active)
         WHERE id = ?",
    )
    .bind(body.name.as_deref().map(str::trim))
    .bind(body.price_cents)
    .bind(body.duration_min)
    .bind(body.is_active)
    .bind(id)
    .execute(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(add_on_by_id(&state, id).await?)))
}

pub async fn delete_add_on(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<AddOn>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    sqlx::query("UPDATE add_ons SET is_active = 0 WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(ApiResponse::success(add_on_by_id(&state, id).await?)))
}

async fn add_on_by_id(state: &AppState, id: i64) -> Result<AddOn, ApiError> {
    sqlx::query_as::<_, AddOn>(
        "SELECT id, name, price_cents, duration_min, is_active FROM add_ons WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("add-on {}", id)))
}

// ── Business hours ──

pub async fn list_business_hours(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<BusinessHours>>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    let hours = sqlx::query_as::<_, BusinessHours>(
        "SELECT day_of_week, open_time, close_time, is_closed
         FROM business_hours ORDER BY day_of_week ASC",
    )
    .fetch_all(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(hours)))
}

/// PUT /api/admin/business-hours: upsert one weekday's window. Existing
/// appointments keep their slots; the new window only affects new bookings.
pub async fn upsert_business_hours(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpsertBusinessHoursRequest>,
) -> Result<Json<ApiResponse<BusinessHours>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    if !(0..=6).contains(&body.day_of_week) {
        return Err(ApiError::Validation(
            "day_of_week must be 0 (Monday) through 6 (Sunday)".into(),
        ));
    }
    if !body.is_closed {
        let open = crate::scheduling::parse_hm(&body.open_time);
        let close = crate::scheduling::parse_hm(&body.close_time);
        match (open, close) {
            (Some(o), Some(c)) if o < c => {}
            _ => {
                return Err(ApiError::Validation(
                    "open_time must be before close_time, both HH:MM".into(),
                ))
            }
        }
    }

    sqlx::query(
        "INSERT INTO business_hours (day_of_week, open_time, close_time, is_closed)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(day_of_week) DO UPDATE SET
            open_time = excluded.open_time,
            close_time = excluded.close_time,
            is_closed = excluded.is_closed",
    )
    .bind(body.day_of_week)
    .bind(&body.open_time)
    .bind(&body.close_time)
    .bind(body.is_closed)
    .execute(&state.db)
    .await?;

    let row = db::hours_for_weekday(&state.db, body.day_of_week)
        .await?
        .ok_or_else(|| ApiError::NotFound("business hours".into()))?;
    Ok(Json(ApiResponse::success(row)))
}

// ── Promo codes ──

pub async fn list_promos(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<PromoCode>>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    let promos = sqlx::query_as::<_, PromoCode>(
        "SELECT id, code, discount_type, discount_value, expires_at, max_uses, times_used, is_active
         FROM promo_codes ORDER BY id ASC",
    )
    .fetch_all(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(promos)))
}

pub async fn create_promo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreatePromoRequest>,
) -> Result<Json<ApiResponse<PromoCode>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    let code = body.code.trim().to_uppercase();
    if code.is_empty() {
        return Err(ApiError::Validation("promo code is required".into()));
    }
    match body.discount_type.as_str() {
        DISCOUNT_TYPE_PERCENT => {
            if !(1..=100).contains(&body.discount_value) {
                return Err(ApiError::Validation(
                    "percent discount must be 1 through 100".into(),
                ));
            }
        }
        DISCOUNT_TYPE_FIXED => {
            if body.discount_value <= 0 {
                return Err(ApiError::Validation(
                    "fixed discount must be a positive cent amount".into(),
                ));
            }
        }
        other => {
            return Err(ApiError::Validation(format!(
                "unknown discount_type {:?}",
                other
            )))
        }
    }

    sqlx::query(
        "INSERT INTO promo_codes (code, discount_type, discount_value, expires_at, max_uses)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&code)
    .bind(&body.discount_type)
    .bind(body.discount_value)
    .bind(&body.expires_at)
    .bind(body.max_uses)
    .execute(&state.db)
    .await?;

    let promo = db::find_promo(&state.db, &code)
        .await?
        .ok_or_else(|| ApiError::NotFound("promo".into()))?;
    Ok(Json(ApiResponse::success(promo)))
}

pub async fn update_promo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<UpdatePromoRequest>,
) -> Result<Json<ApiResponse<PromoCode>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    sqlx::query(
        "UPDATE promo_codes SET
            discount_value = COALESCE(?, discount_value),
            expires_at = COALESCE(?, expires_at),
            max_uses = COALESCE(?, max_uses),
            is_active = COALESCE(?, is_active)
         WHERE id = ?",
    )
    .bind(body.discount_value)
    .bind(body.expires_at)
    .bind(body.max_uses)
    .bind(body.is_active)
    .bind(id)
    .execute(&state.db)
    .await?;

    let promo = sqlx::query_as::<_, PromoCode>(
        "SELECT id, code, discount_type, discount_value, expires_at, max_uses, times_used, is_active
         FROM promo_codes WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("promo {}", id)))?;
    Ok(Json(ApiResponse::success(promo)))
}

// ── Settings ──

pub async fn list_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<UpdateSettingRequest>>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM settings ORDER BY key ASC")
            .fetch_all(&state.db)
            .await?;
    Ok(Json(ApiResponse::success(
        rows.into_iter()
            .map(|(key, value)| UpdateSettingRequest { key, value })
            .collect(),
    )))
}

const POLICY_KEYS: &[&str] = &[
    "slot_granularity_minutes",
    "buffer_minutes",
    "lead_time_minutes",
    "ambassador_discount_percent",
    "hold_expiry_minutes",
];

/// PUT /api/admin/settings: policy changes take effect on the next booking
/// request; no restart involved.
pub async fn put_setting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateSettingRequest>,
) -> Result<Json<ApiResponse<UpdateSettingRequest>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    if !POLICY_KEYS.contains(&body.key.as_str()) {
        return Err(ApiError::Validation(format!(
            "unknown setting {:?}",
            body.key
        )));
    }
    let parsed: i64 = body
        .value
        .parse()
        .map_err(|_| ApiError::Validation("setting value must be an integer".into()))?;
    if parsed < 0 {
        return Err(ApiError::Validation("setting value must be non-negative".into()));
    }
    if body.key == "slot_granularity_minutes" && parsed == 0 {
        return Err(ApiError::Validation("slot granularity must be positive".into()));
    }

    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(&body.key)
    .bind(&body.value)
    .execute(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(body)))
}

// ── Appointment management ──

/// GET /api/admin/appointments?date=…&from=…&to=…&status=…
pub async fn list_appointments(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AppointmentsQuery>,
) -> Result<Json<ApiResponse<Vec<AppointmentDetail>>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;

    let mut sql = format!("{} WHERE 1=1", db::APPOINTMENT_DETAIL_SELECT);
    if query.date.is_some() {
        sql.push_str(" AND a.date = ?");
    }
    if query.from.is_some() {
        sql.push_str(" AND a.date >= ?");
    }
    if query.to.is_some() {
        sql.push_str(" AND a.date <= ?");
    }
    if query.status.is_some() {
        sql.push_str(" AND a.status = ?");
    }
    sql.push_str(" ORDER BY a.date ASC, a.start_time ASC");

    let mut q = sqlx::query_as::<_, AppointmentDetail>(&sql);
    if let Some(date) = &query.date {
        q = q.bind(date);
    }
    if let Some(from) = &query.from {
        q = q.bind(from);
    }
    if let Some(to) = &query.to {
        q = q.bind(to);
    }
    if let Some(status) = &query.status {
        q = q.bind(status.to_uppercase());
    }

    Ok(Json(ApiResponse::success(q.fetch_all(&state.db).await?)))
}

/// PATCH /api/admin/appointments/:id/confirm: requires the deposit to be
/// settled (or never required).
pub async fn confirm_appointment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<AppointmentDetail>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    let appointment = db::appointment_by_id(&state.db, id).await?;

    match appointment.appointment_status() {
        Some(AppointmentStatus::Confirmed) => {} // repeat confirm is a no-op
        Some(AppointmentStatus::PendingConfirmation) => {
            if !appointment.payment_state().is_some_and(|p| p.deposit_settled()) {
                return Err(ApiError::Validation(
                    "deposit has not settled yet".into(),
                ));
            }
            sqlx::query("UPDATE appointments SET status = ? WHERE id = ? AND status = ?")
                .bind(AppointmentStatus::Confirmed.as_str())
                .bind(id)
                .bind(AppointmentStatus::PendingConfirmation.as_str())
                .execute(&state.db)
                .await?;
            tracing::info!("confirmed appointment {}", id);
        }
        _ => {
            return Err(ApiError::Validation(
                "only pending appointments can be confirmed".into(),
            ))
        }
    }

    Ok(Json(ApiResponse::success(
        db::appointment_detail(&state.db, id).await?,
    )))
}

/// PATCH /api/admin/appointments/:id/no-show: terminal; the deposit is
/// forfeited and no points are awarded.
pub async fn mark_no_show(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<AppointmentDetail>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    let appointment = db::appointment_by_id(&state.db, id).await?;

    match appointment.appointment_status() {
        Some(AppointmentStatus::NoShow) => {}
        Some(AppointmentStatus::Confirmed) => {
            sqlx::query("UPDATE appointments SET status = ? WHERE id = ? AND status = ?")
                .bind(AppointmentStatus::NoShow.as_str())
                .bind(id)
                .bind(AppointmentStatus::Confirmed.as_str())
                .execute(&state.db)
                .await?;
            tracing::info!("marked appointment {} as no-show", id);
        }
        _ => {
            return Err(ApiError::Validation(
                "only confirmed appointments can be marked no-show".into(),
            ))
        }
    }

    Ok(Json(ApiResponse::success(
        db::appointment_detail(&state.db, id).await?,
    )))
}

/// PATCH /api/admin/appointments/:id/cancel: no possession check, same
/// idempotent transition as the customer path.
pub async fn cancel_appointment_admin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<ApiResponse<AppointmentDetail>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;
    let appointment = db::appointment_by_id(&state.db, id).await?;
    let now = business_now(state.tz_offset_minutes);
    cancel_appointment(&state.db, &appointment, now, body.reason.as_deref()).await?;
    Ok(Json(ApiResponse::success(
        db::appointment_detail(&state.db, id).await?,
    )))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookRequest;
    use std::time::Instant;

    async fn test_state() -> Arc<AppState> {
        Arc::new(AppState {
            db: db::test_pool().await,
            admin_token: "test-admin".into(),
            stripe_secret_key: String::new(),
            stripe_webhook_secret: String::new(),
            guest_link_secret: "test".into(),
            tz_offset_minutes: 0,
            started_at: Instant::now(),
            date_locks: db::DateLocks::new(),
        })
    }

    fn admin_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer test-admin".parse().unwrap(),
        );
        headers
    }

    async fn booked(state: &AppState, time: &str) -> crate::models::Appointment {
        let req = BookRequest {
            service_id: 1,
            add_on_ids: vec![],
            date: "2030-06-03".into(),
            time: time.into(),
            customer_name: "Jordan Reyes".into(),
            customer_email: "jordan@example.com".into(),
            promo_code: None,
        };
        crate::handlers::client::commit_booking(state, &req).await.unwrap().0
    }

    #[tokio::test]
    async fn test_admin_endpoints_reject_bad_token() {
        let state = test_state().await;
        let err = list_services(State(state), HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
    }

    #[tokio::test]
    async fn test_confirm_requires_settled_deposit() {
        let state = test_state().await;
        let appt = booked(&state, "10:00").await;

        let err = confirm_appointment(State(state.clone()), admin_headers(), Path(appt.id))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        sqlx::query("UPDATE appointments SET payment_status = 'PAID_DEPOSIT' WHERE id = ?")
            .bind(appt.id)
            .execute(&state.db)
            .await
            .unwrap();
        confirm_appointment(State(state.clone()), admin_headers(), Path(appt.id))
            .await
            .unwrap();
        let a = db::appointment_by_id(&state.db, appt.id).await.unwrap();
        assert_eq!(a.status, "CONFIRMED");

        // Repeat confirm is a no-op, not an error.
        confirm_appointment(State(state), admin_headers(), Path(appt.id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_show_only_from_confirmed() {
        let state = test_state().await;
        let appt = booked(&state, "10:00").await;

        let err = mark_no_show(State(state.clone()), admin_headers(), Path(appt.id))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        sqlx::query("UPDATE appointments SET status = 'CONFIRMED', payment_status = 'PAID_DEPOSIT' WHERE id = ?")
            .bind(appt.id)
            .execute(&state.db)
            .await
            .unwrap();
        mark_no_show(State(state.clone()), admin_headers(), Path(appt.id))
            .await
            .unwrap();
        let a = db::appointment_by_id(&state.db, appt.id).await.unwrap();
        assert_eq!(a.status, "NO_SHOW");

        // A no-show frees its slot for new bookings.
        assert!(
            crate::handlers::client::commit_booking(
                &state,
                &BookRequest {
                    service_id: 1,
                    add_on_ids: vec![],
                    date: "2030-06-03".into(),
                    time: "10:00".into(),
                    customer_name: "Sam Lee".into(),
                    customer_email: "sam@example.com".into(),
                    promo_code: None,
                }
            )
            .await
            .is_ok()
        );
    }

    #[tokio::test]
    async fn test_business_hours_upsert_validation() {
        let state = test_state().await;
        let bad = UpsertBusinessHoursRequest {
            day_of_week: 0,
            open_time: "18:00".into(),
            close_time: "09:00".into(),
            is_closed: false,
        };
        let err = upsert_business_hours(State(state.clone()), admin_headers(), Json(bad))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        let good = UpsertBusinessHoursRequest {
            day_of_week: 6,
            open_time: "11:00".into(),
            close_time: "15:00".into(),
            is_closed: false,
        };
        upsert_business_hours(State(state.clone()), admin_headers(), Json(good))
            .await
            .unwrap();
        let sunday = db::hours_for_weekday(&state.db, 6).await.unwrap().unwrap();
        assert!(!sunday.is_closed);
        assert_eq!(sunday.open_time, "11:00");
    }

    #[tokio::test]
    async fn test_promo_create_normalizes_code() {
        let state = test_state().await;
        let req = CreatePromoRequest {
            code: "  spring15 ".into(),
            discount_type: "percent".into(),
            discount_value: 15,
            expires_at: None,
            max_uses: Some(10),
        };
        let Json(resp) = create_promo(State(state.clone()), admin_headers(), Json(req))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap().code, "SPRING15");

        let bad_type = CreatePromoRequest {
            code: "X".into(),
            discount_type: "bogus".into(),
            discount_value: 5,
            expires_at: None,
            max_uses: None,
        };
        assert!(create_promo(State(state), admin_headers(), Json(bad_type))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_setting_update_rejects_unknown_and_non_numeric() {
        let state = test_state().await;
        let unknown = UpdateSettingRequest {
            key: "nope".into(),
            value: "1".into(),
        };
        assert!(put_setting(State(state.clone()), admin_headers(), Json(unknown))
            .await
            .is_err());

        let bad = UpdateSettingRequest {
            key: "buffer_minutes".into(),
            value: "lots".into(),
        };
        assert!(put_setting(State(state.clone()), admin_headers(), Json(bad))
            .await
            .is_err());

        let good = UpdateSettingRequest {
            key: "buffer_minutes".into(),
            value: "20".into(),
        };
        put_setting(State(state.clone()), admin_headers(), Json(good))
            .await
            .unwrap();
        let policy = db::load_policy(&state.db).await.unwrap();
        assert_eq!(policy.buffer_minutes, 20);
    }

    #[tokio::test]
    async fn test_appointment_list_filters() {
        let state = test_state().await;
        booked(&state, "10:00").await;
        booked(&state, "13:00").await;

        let Json(resp) = list_appointments(
            State(state.clone()),
            admin_headers(),
            Query(AppointmentsQuery {
                date: Some("2030-06-03".into()),
                from: None,
                to: None,
                status: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.data.unwrap().len(), 2);

        let Json(resp) = list_appointments(
            State(state),
            admin_headers(),
            Query(AppointmentsQuery {
                date: None,
                from: None,
                to: None,
                status: Some("cancelled".into()),
            }),
        )
        .await
        .unwrap();
        assert!(resp.data.unwrap().is_empty());
    }
}
