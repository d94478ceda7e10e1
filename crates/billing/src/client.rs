//! Stripe client wrapper and billing configuration

use std::collections::HashMap;
use std::time::Duration;

use stripe::RequestStrategy;

use crate::error::{BillingError, BillingResult};

/// Timeout for read/status calls to Stripe
pub const STRIPE_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for mutating/provisioning calls to Stripe.
///
/// A timeout here is a hard failure for the orchestrators: re-issuing a
/// mutating call without the matching idempotency key risks duplication,
/// so callers must re-submit explicitly.
pub const STRIPE_MUTATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Billing configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret key
    pub secret_key: String,
    /// Webhook signing secret (STRIPE_WEBHOOK_SECRET)
    pub webhook_secret: Option<String>,
    /// The only trusted origin for checkout success/cancel redirects
    pub app_base_url: String,
    /// Default trial length applied when a price has no override
    pub default_trial_days: u32,
    /// Per-price trial overrides, parsed from
    /// `STRIPE_TRIAL_OVERRIDES="price_abc=14,price_def=0"`
    pub trial_overrides: HashMap<String, u32>,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        let app_base_url = std::env::var("APP_BASE_URL")
            .map_err(|_| BillingError::Config("APP_BASE_URL not set".to_string()))?;

        let default_trial_days = std::env::var("STRIPE_DEFAULT_TRIAL_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let trial_overrides = std::env::var("STRIPE_TRIAL_OVERRIDES")
            .map(|v| Self::parse_trial_overrides(&v))
            .unwrap_or_default();

        Ok(Self {
            secret_key,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").ok(),
            app_base_url,
            default_trial_days,
            trial_overrides,
        })
    }

    /// Parse `price_id=days` comma-separated pairs, skipping malformed entries.
    fn parse_trial_overrides(raw: &str) -> HashMap<String, u32> {
        raw.split(',')
            .filter_map(|pair| {
                let (price, days) = pair.trim().split_once('=')?;
                let days: u32 = days.trim().parse().ok()?;
                Some((price.trim().to_string(), days))
            })
            .collect()
    }

    /// Trial length for a price: per-price override, else the system default.
    /// `None` means no trial parameter should be sent at all.
    pub fn trial_days_for_price(&self, price_id: &str) -> Option<u32> {
        let days = self
            .trial_overrides
            .get(price_id)
            .copied()
            .unwrap_or(self.default_trial_days);
        if days == 0 {
            None
        } else {
            Some(days)
        }
    }

    /// Build a redirect URL on the trusted app origin.
    pub fn redirect_url(&self, path: &str) -> String {
        format!("{}/{}", self.app_base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

/// Wrapper around the Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// The underlying Stripe client
    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    /// A client that attaches the given idempotency key, so Stripe
    /// collapses retried mutations into a single effect.
    pub fn idempotent(&self, key: &str) -> stripe::Client {
        self.client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(key.to_string()))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

/// Run a Stripe call under an explicit timeout.
///
/// An elapsed timeout is NOT retried here: for mutating calls the caller
/// must re-submit with the same idempotency key, and for reads the caller
/// decides whether a stale answer is acceptable.
pub async fn stripe_call<T, F>(timeout: Duration, fut: F) -> BillingResult<T>
where
    F: std::future::Future<Output = Result<T, stripe::StripeError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(BillingError::StripeTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(default_days: u32, overrides: &str) -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_x".to_string(),
            webhook_secret: None,
            app_base_url: "https://app.costscope.dev".to_string(),
            default_trial_days: default_days,
            trial_overrides: StripeConfig::parse_trial_overrides(overrides),
        }
    }

    #[test]
    fn test_trial_override_wins_over_default() {
        let cfg = config_with(7, "price_abc=14,price_def=0");
        assert_eq!(cfg.trial_days_for_price("price_abc"), Some(14));
        // Explicit zero override means: no trial parameter at all
        assert_eq!(cfg.trial_days_for_price("price_def"), None);
        // No override: system default
        assert_eq!(cfg.trial_days_for_price("price_other"), Some(7));
    }

    #[test]
    fn test_zero_default_omits_trial() {
        let cfg = config_with(0, "");
        assert_eq!(cfg.trial_days_for_price("price_abc"), None);
    }

    #[test]
    fn test_malformed_override_entries_skipped() {
        let cfg = config_with(3, "price_ok=5,garbage,price_bad=x");
        assert_eq!(cfg.trial_days_for_price("price_ok"), Some(5));
        assert_eq!(cfg.trial_days_for_price("price_bad"), Some(3));
    }

    #[test]
    fn test_redirect_url_joins_cleanly() {
        let cfg = config_with(0, "");
        assert_eq!(
            cfg.redirect_url("/billing/success"),
            "https://app.costscope.dev/billing/success"
        );
        assert_eq!(
            cfg.redirect_url("billing/cancel"),
            "https://app.costscope.dev/billing/cancel"
        );
    }
}
