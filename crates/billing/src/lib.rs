// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Costscope Billing Module
//!
//! Keeps an organization's billing state consistent across Stripe (source
//! of truth), the primary datastore (low-latency mirror), and the backend
//! limits service (quota enforcement).
//!
//! ## Features
//!
//! - **Checkout**: Idempotent checkout-session creation for onboarding and
//!   existing organizations
//! - **Plan Changes**: Prorated plan changes with eligibility checks,
//!   audit trail, and limits sync
//! - **Reconciliation**: Manual resync of drifted billing state from Stripe
//! - **Limits Sync**: Retrying, classifying push of usage limits downstream
//! - **Rate Limiting**: Shared-store limiter for checkout creation
//! - **Webhooks**: Asynchronous mirroring of Stripe subscription events
//! - **Invariants**: Runnable billing consistency checks

pub mod audit;
pub mod checkout;
pub mod client;
pub mod error;
pub mod history;
pub mod idempotency;
pub mod invariants;
pub mod limits_sync;
pub mod mirror;
pub mod orgs;
pub mod plans;
pub mod rate_limit;
pub mod resync;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Audit
pub use audit::{
    AuditTrail, InvalidSyncTransition, NewPlanChangeAudit, PlanChangeAction,
    PlanChangeAuditRecord, SyncStatus,
};

// Checkout
pub use checkout::{CheckoutResponse, CheckoutService};

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// History
pub use history::{BillingHistoryService, InvoiceSummary, PaymentMethodSummary};

// Idempotency
pub use idempotency::CheckoutMode;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Limits sync
pub use limits_sync::{LimitsPush, LimitsSyncClient, LimitsSyncConfig, SyncOutcome, SyncType};

// Plans
pub use plans::PlanDescriptor;

// Rate limit
pub use rate_limit::{RateLimitAction, RateLimitConfig, RateLimitResult, RateLimiter};

// Resync
pub use resync::{ResyncOutcome, ResyncService};

// Subscriptions
pub use subscriptions::{PlanChangeOutcome, SubscriptionService, SubscriptionSummary};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service combining all billing functionality
pub struct BillingService {
    pub checkout: CheckoutService,
    pub subscriptions: SubscriptionService,
    pub resync: ResyncService,
    pub history: BillingHistoryService,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
    pub rate_limiter: RateLimiter,
}

impl BillingService {
    /// Create a billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let limits_sync = LimitsSyncClient::from_env()?;
        Ok(Self::new(stripe, limits_sync, pool))
    }

    /// Create a billing service with explicit clients
    pub fn new(stripe: StripeClient, limits_sync: LimitsSyncClient, pool: PgPool) -> Self {
        let rate_limiter = RateLimiter::new(pool.clone(), RateLimitConfig::checkout_default());

        Self {
            checkout: CheckoutService::new(stripe.clone(), pool.clone(), rate_limiter.clone()),
            subscriptions: SubscriptionService::new(
                stripe.clone(),
                pool.clone(),
                limits_sync.clone(),
            ),
            resync: ResyncService::new(stripe.clone(), pool.clone(), limits_sync.clone()),
            history: BillingHistoryService::new(stripe.clone(), pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool.clone(), limits_sync),
            invariants: InvariantChecker::new(pool),
            rate_limiter,
        }
    }
}
