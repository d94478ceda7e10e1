//! Billing error types
//!
//! The taxonomy mirrors the failure boundaries of the orchestrators:
//! validation and authorization errors are rejected before any external
//! call, upstream mutation failures abort the whole operation, and
//! downstream mirror failures are surfaced as warnings by the callers
//! rather than as errors.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Malformed caller input, rejected before any external call
    #[error("{0}")]
    Validation(String),

    /// Caller is not a member of the organization
    #[error("You are not a member of this organization")]
    NotAMember,

    /// Caller is a member but not the sole billing owner
    #[error("Only the organization owner can manage billing")]
    NotOwner,

    /// Plan-change eligibility failed (checked before any mutation)
    #[error("{0}")]
    Ineligible(String),

    /// Too many attempts within the rate-limit window
    #[error("Too many attempts. Please wait a moment and try again.")]
    RateLimited,

    #[error("Organization not found: {0}")]
    NotFound(String),

    #[error("No active subscription for organization {0}")]
    SubscriptionNotFound(String),

    /// Payment-processor call failed; the operation was aborted
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    /// Payment-processor mutation timed out. Not retried automatically:
    /// re-issuing without the matching idempotency key risks duplication.
    #[error("Stripe request timed out")]
    StripeTimeout,

    /// Plan metadata missing or out of bounds. Indicates a product-catalog
    /// defect, not a user error.
    #[error("Plan configuration error: {0}. Please contact support.")]
    PlanConfig(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Backend limits service push failed after retries
    #[error("Limits service sync failed: {0}")]
    LimitsSync(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl From<costscope_shared::ValidationError> for BillingError {
    fn from(e: costscope_shared::ValidationError) -> Self {
        BillingError::Validation(e.to_string())
    }
}

impl BillingError {
    /// Whether this error indicates the caller did something wrong
    /// (vs an internal or upstream failure).
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            BillingError::Validation(_)
                | BillingError::NotAMember
                | BillingError::NotOwner
                | BillingError::Ineligible(_)
                | BillingError::RateLimited
                | BillingError::NotFound(_)
                | BillingError::SubscriptionNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_error_classification() {
        assert!(BillingError::RateLimited.is_caller_error());
        assert!(BillingError::Ineligible("seats".into()).is_caller_error());
        assert!(!BillingError::StripeApi("boom".into()).is_caller_error());
        assert!(!BillingError::PlanConfig("missing seat_limit".into()).is_caller_error());
        assert!(!BillingError::Database("conn reset".into()).is_caller_error());
    }

    #[test]
    fn test_plan_config_message_mentions_support() {
        let msg = BillingError::PlanConfig("seat_limit out of bounds".into()).to_string();
        assert!(msg.contains("contact support"));
    }
}
