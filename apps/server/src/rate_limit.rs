use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::ApiResponse;

// ── Tiers ──

/// Rate limit tiers, matched to endpoint sensitivity. Booking creation is
/// the strictest: it writes appointments and talks to the payment gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Public,
    Booking,
    Client,
    Admin,
}

impl Tier {
    fn limits(self) -> (u32, Duration) {
        match self {
            Tier::Public => (60, Duration::from_secs(60)),
            Tier::Booking => (5, Duration::from_secs(300)),
            Tier::Client => (30, Duration::from_secs(60)),
            Tier::Admin => (120, Duration::from_secs(60)),
        }
    }
}

// ── Core limiter ──

/// In-memory per-IP sliding-window rate limiter.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    hits: Arc<DashMap<(Tier, IpAddr), Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Ok(())` if allowed, `Err(retry_after_secs)` if limited.
    pub fn check(&self, tier: Tier, ip: IpAddr) -> Result<(), u64> {
        let (max_requests, window) = tier.limits();
        let now = Instant::now();
        let window_start = now - window;

        let mut entry = self.hits.entry((tier, ip)).or_default();
        entry.retain(|t| *t > window_start);

        if entry.len() >= max_requests as usize {
            let oldest = entry[0];
            let retry_after = (oldest + window)
                .saturating_duration_since(now)
                .as_secs()
                .max(1);
            return Err(retry_after);
        }

        entry.push(now);
        Ok(())
    }

    /// Drop entries idle for more than 2× their window. Run periodically.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.hits.retain(|(tier, _ip), timestamps| {
            let (_, window) = tier.limits();
            timestamps.retain(|t| now.duration_since(*t) < window * 2);
            !timestamps.is_empty()
        });
    }
}

// ── IP extraction ──

/// Client IP from X-Forwarded-For (reverse proxy) or the socket address.
pub fn extract_client_ip(req: &Request) -> IpAddr {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first_ip) = forwarded.split(',').next() {
            if let Ok(ip) = first_ip.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or_else(|| "127.0.0.1".parse().unwrap())
}

fn too_many_requests(retry_after: u64) -> Response {
    let body = ApiResponse::<()>::error(format!(
        "Too many requests. Try again in {} seconds",
        retry_after
    ));
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", retry_after.to_string())],
        Json(body),
    )
        .into_response()
}

// ── Middleware (one per tier) ──

pub async fn rate_limit_public(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let ip = extract_client_ip(&req);
    limiter.check(Tier::Public, ip).map_err(too_many_requests)?;
    Ok(next.run(req).await)
}

pub async fn rate_limit_booking(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let ip = extract_client_ip(&req);
    limiter.check(Tier::Booking, ip).map_err(too_many_requests)?;
    Ok(next.run(req).await)
}

pub async fn rate_limit_client(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let ip = extract_client_ip(&req);
    limiter.check(Tier::Client, ip).map_err(too_many_requests)?;
    Ok(next.run(req).await)
}

pub async fn rate_limit_admin(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let ip = extract_client_ip(&req);
    limiter.check(Tier::Admin, ip).map_err(too_many_requests)?;
    Ok(next.run(req).await)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_booking_tier_is_strictest() {
        let limiter = RateLimiter::new();
        let ip = test_ip(1);
        for _ in 0..5 {
            assert!(limiter.check(Tier::Booking, ip).is_ok());
        }
        assert!(limiter.check(Tier::Booking, ip).is_err());
    }

    #[test]
    fn test_returns_retry_after_within_window() {
        let limiter = RateLimiter::new();
        let ip = test_ip(1);
        for _ in 0..5 {
            limiter.check(Tier::Booking, ip).unwrap();
        }
        let retry_after = limiter.check(Tier::Booking, ip).unwrap_err();
        assert!((1..=300).contains(&retry_after));
    }

    #[test]
    fn test_different_ips_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            limiter.check(Tier::Booking, test_ip(1)).unwrap();
        }
        assert!(limiter.check(Tier::Booking, test_ip(1)).is_err());
        assert!(limiter.check(Tier::Booking, test_ip(2)).is_ok());
    }

    #[test]
    fn test_tiers_tracked_separately() {
        let limiter = RateLimiter::new();
        let ip = test_ip(1);
        for _ in 0..5 {
            limiter.check(Tier::Booking, ip).unwrap();
        }
        assert!(limiter.check(Tier::Booking, ip).is_err());
        // Exhausting Booking must not consume Public budget.
        assert!(limiter.check(Tier::Public, ip).is_ok());
    }

    #[test]
    fn test_cleanup_preserves_active_entries() {
        let limiter = RateLimiter::new();
        let ip = test_ip(1);
        for _ in 0..5 {
            limiter.check(Tier::Booking, ip).unwrap();
        }
        limiter.cleanup();
        // Entries are still inside their window, so the limit still applies.
        assert!(limiter.check(Tier::Booking, ip).is_err());
    }
}
