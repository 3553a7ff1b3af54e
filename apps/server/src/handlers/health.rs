use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub db_ok: bool,
    /// Unconfirmed appointments still waiting on a deposit: a quick signal
    /// that the expiry task is keeping up.
    pub pending_holds: i64,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let pending_holds: Option<i64> = sqlx::query_scalar(
        "SELECT COUNT(*) FROM appointments
         WHERE status = 'PENDING_CONFIRMATION' AND payment_status = 'PENDING_PAYMENT'",
    )
    .fetch_one(&state.db)
    .await
    .ok();

    Json(HealthResponse {
        status: if pending_holds.is_some() { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        db_ok: pending_holds.is_some(),
        pending_holds: pending_holds.unwrap_or(-1),
    })
}
