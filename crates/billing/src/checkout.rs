//! Checkout session orchestration
//!
//! Creates new-subscription checkout sessions at Stripe, exactly once per
//! logical request. Two entry points: onboarding (no organization yet) and
//! existing-organization upgrade-to-paid. Plan *changes* never go through
//! checkout; they are handled by the subscription service.

use serde::Serialize;
use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, CustomerId,
};
use uuid::Uuid;

use costscope_shared::{validate_org_slug, validate_price_id};

use crate::client::{stripe_call, StripeClient, STRIPE_MUTATE_TIMEOUT};
use crate::error::{BillingError, BillingResult};
use crate::idempotency::{checkout_key, CheckoutMode};
use crate::orgs;
use crate::rate_limit::{RateLimitAction, RateLimiter};

/// Created checkout session
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    /// Hosted checkout URL to redirect the user to
    pub url: String,
}

/// Checkout session orchestrator
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
    rate_limiter: RateLimiter,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool, rate_limiter: RateLimiter) -> Self {
        Self {
            stripe,
            pool,
            rate_limiter,
        }
    }

    /// Create a checkout session during onboarding, before any
    /// organization exists. The subject of the idempotency key is the
    /// signing-up user.
    pub async fn create_onboarding_session(
        &self,
        user_id: Uuid,
        email: &str,
        price_id: &str,
    ) -> BillingResult<CheckoutResponse> {
        validate_price_id(price_id)?;
        self.admit(user_id).await?;

        let key = checkout_key(CheckoutMode::Onboarding, &user_id.to_string(), price_id);
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("checkout_mode".to_string(), "onboarding".to_string());

        self.create_session(&key, price_id, None, Some(email), metadata)
            .await
    }

    /// Create a checkout session for an existing organization moving to a
    /// paid plan. Checkout is for *new* subscriptions only; an org that
    /// already has a live subscription must use the plan-change flow.
    pub async fn create_org_session(
        &self,
        user_id: Uuid,
        org_slug: &str,
        price_id: &str,
    ) -> BillingResult<CheckoutResponse> {
        validate_org_slug(org_slug)?;
        validate_price_id(price_id)?;
        self.admit(user_id).await?;

        let org = orgs::fetch_org_by_slug(&self.pool, org_slug).await?;
        orgs::require_sole_owner(&self.pool, org.id, user_id).await?;

        if org.has_active_subscription() {
            return Err(BillingError::Ineligible(
                "Organization already has an active subscription. Use the plan change flow \
                 instead of checkout."
                    .to_string(),
            ));
        }

        let key = checkout_key(CheckoutMode::Organization, org_slug, price_id);
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("org_slug".to_string(), org_slug.to_string());
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("checkout_mode".to_string(), "organization".to_string());

        let customer = match org.stripe_customer_id.as_deref() {
            Some(id) => Some(id.parse::<CustomerId>().map_err(|e| {
                BillingError::StripeApi(format!("Invalid stored customer id: {}", e))
            })?),
            None => None,
        };

        self.create_session(&key, price_id, customer, None, metadata)
            .await
    }

    async fn admit(&self, user_id: Uuid) -> BillingResult<()> {
        let result = self
            .rate_limiter
            .try_acquire(user_id, RateLimitAction::CheckoutSession)
            .await;
        if !result.allowed {
            return Err(BillingError::RateLimited);
        }
        Ok(())
    }

    async fn create_session(
        &self,
        idempotency_key: &str,
        price_id: &str,
        customer: Option<CustomerId>,
        customer_email: Option<&str>,
        metadata: std::collections::HashMap<String, String>,
    ) -> BillingResult<CheckoutResponse> {
        let config = self.stripe.config();
        let success_url =
            config.redirect_url("billing/success?session_id={CHECKOUT_SESSION_ID}");
        let cancel_url = config.redirect_url("billing/cancelled");

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.customer = customer;
        params.customer_email = customer_email;
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata.clone());

        // Omit the trial parameter entirely when it resolves to zero
        if let Some(trial_days) = config.trial_days_for_price(price_id) {
            params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                trial_period_days: Some(trial_days),
                metadata: Some(metadata),
                ..Default::default()
            });
        } else {
            params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(metadata),
                ..Default::default()
            });
        }

        // The idempotency key is derived from stable inputs only, so a
        // retried click collapses into the same Stripe session.
        let client = self.stripe.idempotent(idempotency_key);
        let session = stripe_call(
            STRIPE_MUTATE_TIMEOUT,
            CheckoutSession::create(&client, params),
        )
        .await?;

        let url = session
            .url
            .clone()
            .ok_or_else(|| BillingError::StripeApi("checkout session has no URL".to_string()))?;

        tracing::info!(
            session_id = %session.id,
            price_id = %price_id,
            "Created checkout session"
        );

        Ok(CheckoutResponse {
            session_id: session.id.to_string(),
            url,
        })
    }
}
