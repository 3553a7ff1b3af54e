use axum::http::{header, HeaderMap};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::ApiError;

type HmacSha256 = Hmac<Sha256>;

/// Constant-time string comparison via keyed hashing (avoids leaking prefix
/// length through timing).
fn ct_eq(a: &str, b: &str) -> bool {
    let digest = |s: &str| {
        let mut mac =
            HmacSha256::new_from_slice(b"token-compare").expect("HMAC can take key of any size");
        mac.update(s.as_bytes());
        mac.finalize().into_bytes()
    };
    digest(a) == digest(b)
}

/// Validate the admin bearer token from the Authorization header.
pub fn require_admin(headers: &HeaderMap, admin_token: &str) -> Result<(), ApiError> {
    if admin_token.is_empty() {
        // Misconfigured deployment must not become an open admin API.
        tracing::error!("ADMIN_TOKEN not set, rejecting admin request");
        return Err(ApiError::Unauthorized);
    }
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    if ct_eq(presented, admin_token) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Derive the opaque guest link token for an appointment.
///
/// HMAC over the row id and fields fixed at booking time, so the token is
/// unguessable without the server secret and unique per appointment. It is
/// persisted on the row; lookups go through the stored column.
pub fn guest_token(
    secret: &str,
    appointment_id: &str,
    email: &str,
    created_at: &str,
    scope: &str,
) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(appointment_id.as_bytes());
    mac.update(b"|");
    mac.update(email.as_bytes());
    mac.update(b"|");
    mac.update(created_at.as_bytes());
    mac.update(b"|");
    mac.update(scope.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_admin_token_accepted() {
        let headers = headers_with("Bearer s3cret");
        assert!(require_admin(&headers, "s3cret").is_ok());
    }

    #[test]
    fn test_wrong_token_rejected() {
        let headers = headers_with("Bearer nope");
        assert!(require_admin(&headers, "s3cret").is_err());
    }

    #[test]
    fn test_missing_header_rejected() {
        assert!(require_admin(&HeaderMap::new(), "s3cret").is_err());
    }

    #[test]
    fn test_unset_admin_token_rejects_everything() {
        let headers = headers_with("Bearer ");
        assert!(require_admin(&headers, "").is_err());
    }

    #[test]
    fn test_guest_token_deterministic_and_scoped() {
        let a = guest_token("secret", "41", "a@b.c", "2030-06-01 09:00:00", "cancel");
        let b = guest_token("secret", "41", "a@b.c", "2030-06-01 09:00:00", "cancel");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex-encoded SHA-256

        let other_row = guest_token("secret", "42", "a@b.c", "2030-06-01 09:00:00", "cancel");
        assert_ne!(a, other_row);

        let other_secret = guest_token("other", "41", "a@b.c", "2030-06-01 09:00:00", "cancel");
        assert_ne!(a, other_secret);
    }
}
