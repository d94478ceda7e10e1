//! Billing reconciliation
//!
//! Re-derives an organization's billing state from Stripe (the source of
//! truth) and overwrites the primary datastore and backend limits service.
//! This is the repair path for drift caused by missed or delayed webhook
//! delivery. It mirrors, it does not decide: no eligibility or downgrade
//! check applies here.

use serde::Serialize;
use sqlx::PgPool;
use stripe::{CustomerId, ListSubscriptions, Subscription, SubscriptionId, SubscriptionStatus};
use uuid::Uuid;

use costscope_shared::validate_org_slug;

use crate::client::{stripe_call, StripeClient, STRIPE_READ_TIMEOUT};
use crate::error::{BillingError, BillingResult};
use crate::limits_sync::{LimitsPush, LimitsSyncClient, SyncType};
use crate::mirror::BillingMirror;
use crate::orgs::{self, OrgBillingRow};
use crate::plans::PlanDescriptor;

/// Result of a reconciliation run
#[derive(Debug, Clone, Serialize)]
pub struct ResyncOutcome {
    pub success: bool,
    pub message: String,
}

/// Reconciliation service
pub struct ResyncService {
    stripe: StripeClient,
    pool: PgPool,
    limits_sync: LimitsSyncClient,
}

impl ResyncService {
    pub fn new(stripe: StripeClient, pool: PgPool, limits_sync: LimitsSyncClient) -> Self {
        Self {
            stripe,
            pool,
            limits_sync,
        }
    }

    /// Re-sync an organization's billing state from Stripe.
    pub async fn resync(&self, org_slug: &str, acting_user_id: Uuid) -> BillingResult<ResyncOutcome> {
        validate_org_slug(org_slug)?;

        let org = orgs::fetch_org_by_slug(&self.pool, org_slug).await?;
        orgs::require_sole_owner(&self.pool, org.id, acting_user_id).await?;

        // An org with no billing relationship is a valid state, not an error.
        let Some(customer_ref) = org.stripe_customer_id.clone() else {
            return Ok(ResyncOutcome {
                success: true,
                message: "Organization has no billing relationship; nothing to sync".to_string(),
            });
        };

        let subscription = match self.find_subscription(&org, &customer_ref).await? {
            Some(sub) => sub,
            None => {
                // Stripe knows the customer but has no live subscription:
                // the mirror must say so.
                self.mark_unsubscribed(org.id).await?;
                tracing::info!(
                    org_id = %org.id,
                    org_slug = %org_slug,
                    "Resync found no live subscription, billing marked canceled"
                );
                return Ok(ResyncOutcome {
                    success: true,
                    message: "No live subscription at the payment processor; billing status \
                              set to canceled"
                        .to_string(),
                });
            }
        };

        let price = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .ok_or_else(|| {
                BillingError::PlanConfig("subscription has no price to derive a plan from".to_string())
            })?;
        let plan = PlanDescriptor::from_price(price)?;

        // Overwrite unconditionally: this process is itself the
        // authority-restoring operation.
        let mirror = BillingMirror::from_subscription(&subscription, &plan);
        mirror.write(&self.pool, org.id).await?;

        let push = LimitsPush {
            org_slug: org_slug.to_string(),
            plan_name: plan.name.clone(),
            billing_status: mirror.billing_status.clone(),
            trial_end: mirror.trial_end.map(|t| t.unix_timestamp()),
            pipeline_runs_per_day: plan.limits.pipeline_runs_per_day,
            pipeline_runs_per_month: plan.limits.pipeline_runs_per_month,
            seat_limit: plan.limits.seat_limit,
            provider_limit: plan.limits.provider_limit,
            concurrent_pipelines: plan.limits.concurrent_pipelines,
            sync_type: SyncType::Reconciliation,
        };
        let sync = self.limits_sync.push(&push).await;

        tracing::info!(
            org_id = %org.id,
            org_slug = %org_slug,
            plan = %plan.name,
            billing_status = %mirror.billing_status,
            limits_synced = sync.success,
            "Billing state resynced from Stripe"
        );

        // The primary datastore write succeeded, so the resync is a
        // success even when the limits push degrades.
        let message = if sync.success {
            format!("Billing state resynced to plan '{}'", plan.name)
        } else {
            format!(
                "Billing state resynced to plan '{}', but the limits service sync failed: {}",
                plan.name,
                sync.error.as_deref().unwrap_or("unknown error")
            )
        };

        Ok(ResyncOutcome {
            success: true,
            message,
        })
    }

    /// Locate the subscription: stored reference first, then a search by
    /// customer reference (covers a stale stored reference).
    async fn find_subscription(
        &self,
        org: &OrgBillingRow,
        customer_ref: &str,
    ) -> BillingResult<Option<Subscription>> {
        if let Some(sub_ref) = org.stripe_subscription_id.as_deref() {
            if let Ok(sub_id) = sub_ref.parse::<SubscriptionId>() {
                match stripe_call(
                    STRIPE_READ_TIMEOUT,
                    Subscription::retrieve(
                        self.stripe.inner(),
                        &sub_id,
                        &["items.data.price.product"],
                    ),
                )
                .await
                {
                    Ok(sub) if is_live(sub.status) => return Ok(Some(sub)),
                    Ok(sub) => {
                        tracing::info!(
                            org_id = %org.id,
                            subscription_id = %sub.id,
                            status = ?sub.status,
                            "Stored subscription is not live, searching by customer"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            org_id = %org.id,
                            stored_ref = sub_ref,
                            error = %e,
                            "Stored subscription reference unusable, searching by customer"
                        );
                    }
                }
            }
        }

        self.find_by_customer(org, customer_ref).await
    }

    async fn find_by_customer(
        &self,
        org: &OrgBillingRow,
        customer_ref: &str,
    ) -> BillingResult<Option<Subscription>> {
        let customer_id: CustomerId = customer_ref
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid stored customer id: {}", e)))?;

        let mut params = ListSubscriptions::new();
        params.customer = Some(customer_id);
        params.limit = Some(10);

        let subscriptions = stripe_call(
            STRIPE_READ_TIMEOUT,
            Subscription::list(self.stripe.inner(), &params),
        )
        .await?;

        let live = subscriptions
            .data
            .into_iter()
            .find(|sub| is_live(sub.status));

        match live.as_ref() {
            Some(sub) => {
                // The list endpoint does not expand product metadata;
                // re-retrieve the winner with the expansion.
                let sub_id = sub.id.clone();
                tracing::info!(
                    org_id = %org.id,
                    subscription_id = %sub_id,
                    "Found live subscription by customer search"
                );
                let expanded = stripe_call(
                    STRIPE_READ_TIMEOUT,
                    Subscription::retrieve(
                        self.stripe.inner(),
                        &sub_id,
                        &["items.data.price.product"],
                    ),
                )
                .await?;
                Ok(Some(expanded))
            }
            None => Ok(None),
        }
    }

    async fn mark_unsubscribed(&self, org_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE organizations SET
                billing_status = 'canceled',
                stripe_subscription_id = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(org_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn is_live(status: SubscriptionStatus) -> bool {
    matches!(
        status,
        SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_status_classification() {
        assert!(is_live(SubscriptionStatus::Active));
        assert!(is_live(SubscriptionStatus::Trialing));
        assert!(is_live(SubscriptionStatus::PastDue));
        assert!(!is_live(SubscriptionStatus::Canceled));
        assert!(!is_live(SubscriptionStatus::Unpaid));
        assert!(!is_live(SubscriptionStatus::IncompleteExpired));
    }
}
