//! Idempotency key derivation
//!
//! Keys are derived from stable inputs only — never a timestamp or random
//! value — so a retried click or network retry collapses into the same
//! Stripe request fingerprint instead of creating a duplicate effect.
//! Stripe caps idempotency keys at 255 characters.

use uuid::Uuid;

/// Checkout flavor, part of the key so onboarding and org checkouts for
/// the same price never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    /// No organization exists yet; the subject is the signing-up user
    Onboarding,
    /// Upgrade-to-paid for an existing organization
    Organization,
}

impl CheckoutMode {
    fn as_str(&self) -> &'static str {
        match self {
            CheckoutMode::Onboarding => "onboarding",
            CheckoutMode::Organization => "org",
        }
    }
}

/// Key for a checkout-session creation: (mode, subject, price).
pub fn checkout_key(mode: CheckoutMode, subject: &str, price_id: &str) -> String {
    format!("checkout:{}:{}:{}", mode.as_str(), subject, price_id)
}

/// Key for a plan change: (organization id, new price).
///
/// A replayed plan-change request within Stripe's dedup window becomes a
/// no-op re-return of the prior result, not a second proration charge.
pub fn plan_change_key(org_id: Uuid, new_price_id: &str) -> String {
    format!("plan-change:{}:{}", org_id, new_price_id)
}
