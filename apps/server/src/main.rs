mod auth;
mod db;
mod errors;
mod handlers;
mod models;
mod pricing;
mod rate_limit;
mod scheduling;

use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::{get, patch, post},
    Router,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use handlers::{admin, client, health, payment};

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub admin_token: String,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub guest_link_secret: String,
    /// Fixed offset of the salon's wall clock from UTC.
    pub tz_offset_minutes: i64,
    pub started_at: Instant,
    pub date_locks: db::DateLocks,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = env_or("DATABASE_URL", "sqlite:salon.db?mode=rwc");
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    db::run_migrations(&pool).await?;

    let admin_token = env_or("ADMIN_TOKEN", "");
    if admin_token.is_empty() {
        tracing::warn!("ADMIN_TOKEN not set: all admin endpoints will reject requests");
    }
    let stripe_secret_key = env_or("STRIPE_SECRET_KEY", "");
    if stripe_secret_key.is_empty() {
        tracing::warn!("STRIPE_SECRET_KEY not set: deposits will not be collected");
    }
    let stripe_webhook_secret = env_or("STRIPE_WEBHOOK_SECRET", "");
    if stripe_webhook_secret.is_empty() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not set: payment webhooks will be rejected");
    }
    let guest_link_secret = env_or("GUEST_LINK_SECRET", "");
    if guest_link_secret.is_empty() {
        anyhow::bail!("GUEST_LINK_SECRET must be set");
    }
    let tz_offset_minutes: i64 = env_or("TZ_OFFSET_MINUTES", "0").parse()?;
    if !client::valid_tz_offset(tz_offset_minutes) {
        anyhow::bail!(
            "TZ_OFFSET_MINUTES {} is out of range (must be strictly within ±1440)",
            tz_offset_minutes
        );
    }

    let state = Arc::new(AppState {
        db: pool.clone(),
        admin_token,
        stripe_secret_key,
        stripe_webhook_secret,
        guest_link_secret,
        tz_offset_minutes,
        started_at: Instant::now(),
        date_locks: db::DateLocks::new(),
    });

    let limiter = rate_limit::RateLimiter::new();

    // Reclaim unpaid holds so abandoned checkouts release their slots, and
    // sweep booking locks for dates that have passed.
    {
        let pool = pool.clone();
        let tz = tz_offset_minutes;
        let date_locks = state.date_locks.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                tick.tick().await;
                let policy = match db::load_policy(&pool).await {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!("hold expiry task failed to load policy: {}", e);
                        continue;
                    }
                };
                let now = client::business_now(tz);
                if let Err(e) =
                    payment::reclaim_expired_holds(&pool, policy.hold_expiry_minutes, now).await
                {
                    tracing::error!("hold expiry task failed: {}", e);
                }
                date_locks.evict_past(now.date());
            }
        });
    }

    // Keep the rate limiter's per-IP maps from growing without bound.
    {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                tick.tick().await;
                limiter.cleanup();
            }
        });
    }

    let cors = build_cors(&env_or("WEBAPP_URL", ""));

    // Health and the Stripe webhook skip rate limiting: the webhook is
    // authenticated by signature and retried by Stripe on failure.
    let unlimited = Router::new()
        .route("/api/health", get(health::health))
        .route("/api/payments/webhook", post(payment::stripe_webhook));

    let public = Router::new()
        .route("/api/services", get(client::list_services))
        .route("/api/add-ons", get(client::list_add_ons))
        .route("/api/availability", get(client::availability))
        .route("/api/pricing/preview", post(client::pricing_preview))
        .layer(middleware::from_fn_with_state(
            limiter.clone(),
            rate_limit::rate_limit_public,
        ));

    let booking = Router::new()
        .route("/api/appointments/book", post(client::book))
        .layer(middleware::from_fn_with_state(
            limiter.clone(),
            rate_limit::rate_limit_booking,
        ));

    let client_routes = Router::new()
        .route("/api/appointments/{id}/status", get(client::appointment_status))
        .route("/api/appointments/{id}/cancel", patch(client::cancel))
        .route("/api/appointments/{id}/reschedule", post(client::reschedule))
        .route("/api/appointments/guest/{token}", get(client::guest_detail))
        .route(
            "/api/appointments/guest/cancel/{token}",
            post(client::guest_cancel),
        )
        .layer(middleware::from_fn_with_state(
            limiter.clone(),
            rate_limit::rate_limit_client,
        ));

    let admin_routes = Router::new()
        .route(
            "/api/admin/services",
            get(admin::list_services).post(admin::create_service),
        )
        .route(
            "/api/admin/services/{id}",
            patch(admin::update_service).delete(admin::delete_service),
        )
        .route(
            "/api/admin/add-ons",
            get(admin::list_add_ons).post(admin::create_add_on),
        )
        .route(
            "/api/admin/add-ons/{id}",
            patch(admin::update_add_on).delete(admin::delete_add_on),
        )
        .route(
            "/api/admin/business-hours",
            get(admin::list_business_hours).put(admin::upsert_business_hours),
        )
        .route(
            "/api/admin/promos",
            get(admin::list_promos).post(admin::create_promo),
        )
        .route("/api/admin/promos/{id}", patch(admin::update_promo))
        .route(
            "/api/admin/settings",
            get(admin::list_settings).put(admin::put_setting),
        )
        .route("/api/admin/appointments", get(admin::list_appointments))
        .route(
            "/api/admin/appointments/{id}/confirm",
            patch(admin::confirm_appointment),
        )
        .route(
            "/api/admin/appointments/{id}/no-show",
            patch(admin::mark_no_show),
        )
        .route(
            "/api/admin/appointments/{id}/cancel",
            patch(admin::cancel_appointment_admin),
        )
        .route(
            "/api/admin/appointments/{id}/closeout/cash",
            post(payment::closeout_cash),
        )
        .route(
            "/api/admin/appointments/{id}/closeout/stripe",
            post(payment::closeout_stripe),
        )
        .layer(middleware::from_fn_with_state(
            limiter.clone(),
            rate_limit::rate_limit_admin,
        ));

    let app = Router::new()
        .merge(unlimited)
        .merge(public)
        .merge(booking)
        .merge(client_routes)
        .merge(admin_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let host = env_or("HOST", "0.0.0.0");
    let port = env_or("PORT", "8080");
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn build_cors(webapp_url: &str) -> CorsLayer {
    let mut origins: Vec<HeaderValue> = Vec::new();
    if let Ok(origin) = webapp_url.parse::<HeaderValue>() {
        if !webapp_url.is_empty() {
            origins.push(origin);
        }
    }
    // Local frontend dev server.
    if let Ok(origin) = "http://localhost:5173".parse::<HeaderValue>() {
        origins.push(origin);
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::PUT,
            Method::DELETE,
        ])
        .allow_headers(tower_http::cors::Any)
}
