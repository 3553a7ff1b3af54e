use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::models::ApiResponse;

/// Error taxonomy for the booking core.
///
/// Status mapping follows the API contract: 409 = conflict (slot taken,
/// payment declined), 422 = validation (invalid promo, closed day, bad
/// transition), 404 = unknown id/token.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("slot is no longer available")]
    SlotUnavailable,

    #[error("closed for business at the requested time")]
    ClosedForBusiness,

    #[error("invalid promo code: {0}")]
    InvalidPromo(String),

    #[error("invalid or expired cancellation link")]
    InvalidToken,

    #[error("payment declined: {0}")]
    PaymentDeclined(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payment gateway error: {0}")]
    Gateway(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::SlotUnavailable => StatusCode::CONFLICT,
            ApiError::ClosedForBusiness => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::InvalidPromo(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::InvalidToken => StatusCode::NOT_FOUND,
            ApiError::PaymentDeclined(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Gateway(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Don't leak driver errors to clients
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(ApiResponse::<()>::error(message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_statuses() {
        assert_eq!(ApiError::SlotUnavailable.status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::PaymentDeclined("card declined".into()).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_validation_statuses() {
        assert_eq!(
            ApiError::ClosedForBusiness.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::InvalidPromo("EXPIRED10".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_token_maps_to_not_found() {
        assert_eq!(ApiError::InvalidToken.status(), StatusCode::NOT_FOUND);
    }
}
