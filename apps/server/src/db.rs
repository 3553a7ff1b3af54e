use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::ApiError;
use crate::models::{
    AddOn, Appointment, AppointmentDetail, BookingPolicy, BusinessHours, Customer, PromoCode,
    Service,
};
use crate::scheduling::BookedInterval;

// ── Migrations ──

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    // WAL for better concurrent access
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    let applied: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM _migrations WHERE name = '001_init'")
            .fetch_one(pool)
            .await?;

    if !applied {
        let migration_sql = include_str!("../migrations/001_init.sql");
        for statement in migration_sql.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(pool).await?;
            }
        }
        sqlx::query("INSERT INTO _migrations (name) VALUES ('001_init')")
            .execute(pool)
            .await?;
        tracing::info!("Applied migration: 001_init");
    }

    tracing::info!("Database migrations up to date");
    Ok(())
}

// ── Policy (settings table → injected config) ──

/// Load booking policy knobs from the settings table, falling back to
/// defaults for missing or unparseable values.
pub async fn load_policy(pool: &SqlitePool) -> Result<BookingPolicy, ApiError> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
        .fetch_all(pool)
        .await?;

    let mut policy = BookingPolicy::default();
    for (key, value) in rows {
        let Ok(parsed) = value.parse::<i64>() else {
            tracing::warn!("setting {} has non-numeric value {:?}, using default", key, value);
            continue;
        };
        match key.as_str() {
            "slot_granularity_minutes" => policy.slot_granularity_minutes = parsed,
            "buffer_minutes" => policy.buffer_minutes = parsed,
            "lead_time_minutes" => policy.lead_time_minutes = parsed,
            "ambassador_discount_percent" => policy.ambassador_discount_percent = parsed,
            "hold_expiry_minutes" => policy.hold_expiry_minutes = parsed,
            _ => {}
        }
    }
    Ok(policy)
}

// ── Per-date booking locks ──

/// Serializes check-then-insert per calendar date. Day granularity is plenty
/// at salon scale; availability reads never take these locks.
#[derive(Debug, Clone, Default)]
pub struct DateLocks {
    locks: Arc<DashMap<NaiveDate, Arc<Mutex<()>>>>,
}

impl DateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, date: NaiveDate) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(date)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop entries for dates before `today`: past dates can't be booked, so
    /// their locks are dead weight. An entry still held by an in-flight
    /// commit keeps an Arc clone alive and is left alone.
    pub fn evict_past(&self, today: NaiveDate) {
        self.locks
            .retain(|date, lock| *date >= today || Arc::strong_count(lock) > 1);
    }
}

// ── Shared queries ──

/// The shared SELECT for appointment detail responses.
pub const APPOINTMENT_DETAIL_SELECT: &str =
    "SELECT a.id, s.name AS service_name, c.name AS customer_name, c.email AS customer_email,
            a.date, a.start_time, a.total_duration_min, a.status, a.payment_status,
            a.total_cents, a.deposit_cents, a.discount_percent, a.discount_cents,
            a.remaining_cents, a.tip_cents, a.promo_code, a.created_at
     FROM appointments a
     JOIN services s ON s.id = a.service_id
     JOIN customers c ON c.id = a.customer_id";

pub async fn active_service(pool: &SqlitePool, id: i64) -> Result<Service, ApiError> {
    sqlx::query_as::<_, Service>(
        "SELECT id, name, description, price_cents, deposit_cents, duration_min,
                points_earned, is_active, sort_order
         FROM services WHERE id = ? AND is_active = 1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("service {}", id)))
}

/// Fetch the selected add-ons; every id must resolve to an active add-on.
pub async fn active_add_ons(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<AddOn>, ApiError> {
    let mut add_ons = Vec::with_capacity(ids.len());
    for id in ids {
        let add_on = sqlx::query_as::<_, AddOn>(
            "SELECT id, name, price_cents, duration_min, is_active
             FROM add_ons WHERE id = ? AND is_active = 1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::Validation(format!("unknown add-on {}", id)))?;
        add_ons.push(add_on);
    }
    Ok(add_ons)
}

pub async fn hours_for_weekday(
    pool: &SqlitePool,
    day_of_week: i64,
) -> Result<Option<BusinessHours>, ApiError> {
    Ok(sqlx::query_as::<_, BusinessHours>(
        "SELECT day_of_week, open_time, close_time, is_closed
         FROM business_hours WHERE day_of_week = ?",
    )
    .bind(day_of_week)
    .fetch_optional(pool)
    .await?)
}

pub async fn find_promo(pool: &SqlitePool, code: &str) -> Result<Option<PromoCode>, ApiError> {
    Ok(sqlx::query_as::<_, PromoCode>(
        "SELECT id, code, discount_type, discount_value, expires_at, max_uses, times_used, is_active
         FROM promo_codes WHERE code = ?",
    )
    .bind(code.trim().to_uppercase())
    .fetch_optional(pool)
    .await?)
}

pub async fn find_customer_by_email(
    pool: &SqlitePool,
    email: &str,
) -> Result<Option<Customer>, ApiError> {
    Ok(sqlx::query_as::<_, Customer>(
        "SELECT id, name, email, is_ambassador, points_balance, created_at
         FROM customers WHERE email = ?",
    )
    .bind(email.trim().to_lowercase())
    .fetch_optional(pool)
    .await?)
}

pub async fn find_or_create_customer(
    pool: &SqlitePool,
    name: &str,
    email: &str,
) -> Result<Customer, ApiError> {
    let email = email.trim().to_lowercase();
    if let Some(existing) = find_customer_by_email(pool, &email).await? {
        return Ok(existing);
    }
    sqlx::query("INSERT INTO customers (name, email) VALUES (?, ?)")
        .bind(name.trim())
        .bind(&email)
        .execute(pool)
        .await?;
    find_customer_by_email(pool, &email)
        .await?
        .ok_or_else(|| ApiError::NotFound("customer".into()))
}

/// All appointment intervals on a date, for the conflict filter. Status
/// filtering (CANCELLED / NO_SHOW never block) happens in the filter itself.
/// `exclude` omits one appointment, so a reschedule doesn't collide with the
/// slot it is vacating.
pub async fn booked_intervals_on(
    pool: &SqlitePool,
    date: &str,
    exclude: Option<i64>,
) -> Result<Vec<BookedInterval>, ApiError> {
    let rows: Vec<(String, i64, String)> = sqlx::query_as(
        "SELECT start_time, total_duration_min, status
         FROM appointments WHERE date = ? AND id != ?",
    )
    .bind(date)
    .bind(exclude.unwrap_or(-1))
    .fetch_all(pool)
    .await?;

    let mut intervals = Vec::with_capacity(rows.len());
    for (start_time, duration_min, status) in rows {
        let (Some(time), Some(status)) = (
            crate::scheduling::parse_hm(&start_time),
            crate::models::AppointmentStatus::parse(&status),
        ) else {
            tracing::warn!("skipping malformed appointment row at {} {}", date, start_time);
            continue;
        };
        intervals.push(BookedInterval {
            start_time: time,
            duration_min,
            status,
        });
    }
    Ok(intervals)
}

pub async fn appointment_by_id(
    pool: &SqlitePool,
    id: i64,
) -> Result<Appointment, ApiError> {
    sqlx::query_as::<_, Appointment>("SELECT * FROM appointments WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("appointment {}", id)))
}

pub async fn appointment_detail(
    pool: &SqlitePool,
    id: i64,
) -> Result<AppointmentDetail, ApiError> {
    let query = format!("{} WHERE a.id = ?", APPOINTMENT_DETAIL_SELECT);
    sqlx::query_as::<_, AppointmentDetail>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("appointment {}", id)))
}

// ── Test support ──

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    // A single connection keeps the in-memory database alive and shared.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    run_migrations(&pool).await.expect("migrations");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_seed_policy() {
        let pool = test_pool().await;
        let policy = load_policy(&pool).await.unwrap();
        assert_eq!(policy.slot_granularity_minutes, 30);
        assert_eq!(policy.buffer_minutes, 15);
        assert_eq!(policy.lead_time_minutes, 60);
        assert_eq!(policy.ambassador_discount_percent, 10);
        assert_eq!(policy.hold_expiry_minutes, 30);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = test_pool().await;
        run_migrations(&pool).await.unwrap();
        let services: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM services")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(services, 4); // seed catalog applied exactly once
    }

    #[tokio::test]
    async fn test_find_or_create_customer_reuses_row() {
        let pool = test_pool().await;
        let a = find_or_create_customer(&pool, "Jordan", "Jordan@Example.com")
            .await
            .unwrap();
        let b = find_or_create_customer(&pool, "Jordan", "jordan@example.com")
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.email, "jordan@example.com");
    }

    #[tokio::test]
    async fn test_date_locks_evict_past_but_not_held() {
        let d = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        let locks = DateLocks::new();

        drop(locks.acquire(d("2030-06-03")).await);
        drop(locks.acquire(d("2030-06-04")).await);
        let held = locks.acquire(d("2030-06-02")).await;
        assert_eq!(locks.locks.len(), 3);

        locks.evict_past(d("2030-06-04"));
        // The stale 06-03 entry goes; the future date and the held past
        // lock both survive.
        assert_eq!(locks.locks.len(), 2);
        assert!(locks.locks.contains_key(&d("2030-06-04")));
        assert!(locks.locks.contains_key(&d("2030-06-02")));

        drop(held);
        locks.evict_past(d("2030-06-04"));
        assert_eq!(locks.locks.len(), 1);
    }

    #[tokio::test]
    async fn test_business_hours_lookup() {
        let pool = test_pool().await;
        let monday = hours_for_weekday(&pool, 0).await.unwrap().unwrap();
        assert!(!monday.is_closed);
        assert_eq!(monday.open_time, "09:00");
        let sunday = hours_for_weekday(&pool, 6).await.unwrap().unwrap();
        assert!(sunday.is_closed);
        assert!(hours_for_weekday(&pool, 12).await.unwrap().is_none());
    }
}
