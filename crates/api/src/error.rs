//! API error responses
//!
//! Billing errors never propagate past this boundary as panics or opaque
//! 500s; every failure becomes a structured `{success: false, error}` body
//! with a status code matching the error class.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use costscope_billing::BillingError;

/// Error wrapper implementing `IntoResponse`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn unauthorized(message: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        let status = match &e {
            BillingError::Validation(_) => StatusCode::BAD_REQUEST,
            BillingError::NotAMember | BillingError::NotOwner => StatusCode::FORBIDDEN,
            BillingError::Ineligible(_) => StatusCode::CONFLICT,
            BillingError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            BillingError::NotFound(_) | BillingError::SubscriptionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            BillingError::StripeApi(_)
            | BillingError::StripeTimeout
            | BillingError::LimitsSync(_) => StatusCode::BAD_GATEWAY,
            BillingError::PlanConfig(_)
            | BillingError::Database(_)
            | BillingError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Upstream failure details are logged, not returned to the caller
        let message = match &e {
            BillingError::StripeApi(_) | BillingError::StripeTimeout => {
                tracing::error!(error = %e, "Payment processor call failed");
                "Payment processing is temporarily unavailable. Please try again.".to_string()
            }
            BillingError::Database(_) => {
                tracing::error!(error = %e, "Database error");
                "An internal error occurred. Please try again.".to_string()
            }
            other => other.to_string(),
        };

        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.message,
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases: Vec<(BillingError, StatusCode)> = vec![
            (
                BillingError::Validation("bad slug".into()),
                StatusCode::BAD_REQUEST,
            ),
            (BillingError::NotOwner, StatusCode::FORBIDDEN),
            (
                BillingError::Ineligible("too many members".into()),
                StatusCode::CONFLICT,
            ),
            (BillingError::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (
                BillingError::NotFound("acme_co".into()),
                StatusCode::NOT_FOUND,
            ),
            (BillingError::StripeTimeout, StatusCode::BAD_GATEWAY),
            (
                BillingError::PlanConfig("missing seat_limit".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }

    #[test]
    fn test_upstream_details_not_leaked() {
        let api_err = ApiError::from(BillingError::StripeApi("sk_live key rejected".into()));
        assert!(!api_err.message.contains("sk_live"));
    }

    #[test]
    fn test_caller_errors_keep_their_message() {
        let api_err = ApiError::from(BillingError::Ineligible(
            "Cannot downgrade to Starter".into(),
        ));
        assert!(api_err.message.contains("Cannot downgrade"));
    }
}
