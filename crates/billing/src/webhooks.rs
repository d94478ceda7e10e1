//! Stripe webhook handling
//!
//! Keeps the primary datastore and limits service current when Stripe
//! reports asynchronous changes. Delivery is at-least-once and can be
//! missed entirely; the reconciliation path repairs whatever this handler
//! does not see.

use sqlx::PgPool;
use stripe::{
    CheckoutSession, Event, EventObject, EventType, Expandable, Subscription, SubscriptionId,
    Webhook,
};
use uuid::Uuid;

use crate::client::{stripe_call, StripeClient, STRIPE_READ_TIMEOUT};
use crate::error::{BillingError, BillingResult};
use crate::limits_sync::{LimitsPush, LimitsSyncClient, SyncType};
use crate::mirror::BillingMirror;
use crate::plans::PlanDescriptor;

/// Webhook event handler
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    limits_sync: LimitsSyncClient,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, limits_sync: LimitsSyncClient) -> Self {
        Self {
            stripe,
            pool,
            limits_sync,
        }
    }

    /// Verify the payload signature and parse the event.
    pub fn verify(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let secret = self
            .stripe
            .config()
            .webhook_secret
            .as_deref()
            .ok_or_else(|| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        Webhook::construct_event(payload, signature, secret)
            .map_err(|e| BillingError::Validation(format!("invalid webhook signature: {}", e)))
    }

    /// Dispatch a verified event. Unhandled event types are acknowledged
    /// without action.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                if let EventObject::CheckoutSession(session) = event.data.object {
                    self.handle_checkout_completed(session).await?;
                }
            }
            EventType::CustomerSubscriptionUpdated => {
                if let EventObject::Subscription(subscription) = event.data.object {
                    self.handle_subscription_updated(subscription).await?;
                }
            }
            EventType::CustomerSubscriptionDeleted => {
                if let EventObject::Subscription(subscription) = event.data.object {
                    self.handle_subscription_deleted(subscription).await?;
                }
            }
            other => {
                tracing::debug!(event_type = ?other, "Ignoring unhandled webhook event");
            }
        }
        Ok(())
    }

    /// Checkout completed: store the customer/subscription references and
    /// mirror the new subscription's state.
    async fn handle_checkout_completed(&self, session: CheckoutSession) -> BillingResult<()> {
        let Some(org_slug) = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("org_slug"))
            .cloned()
        else {
            // Onboarding checkout: the organization does not exist yet and
            // is created by the signup flow after redirect.
            tracing::info!(session_id = %session.id, "Checkout completed without org_slug metadata");
            return Ok(());
        };

        let customer_ref = session.customer.as_ref().map(expandable_customer_id);
        let subscription_ref = session.subscription.as_ref().map(expandable_subscription_id);

        let org_id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE organizations SET
                stripe_customer_id = COALESCE($2, stripe_customer_id),
                stripe_subscription_id = COALESCE($3, stripe_subscription_id),
                updated_at = NOW()
            WHERE slug = $1
            RETURNING id
            "#,
        )
        .bind(&org_slug)
        .bind(&customer_ref)
        .bind(&subscription_ref)
        .fetch_optional(&self.pool)
        .await?;

        let Some((org_id,)) = org_id else {
            tracing::warn!(
                org_slug = %org_slug,
                session_id = %session.id,
                "Checkout completed for unknown organization"
            );
            return Ok(());
        };

        if let Some(sub_ref) = subscription_ref {
            let sub_id: SubscriptionId = sub_ref
                .parse()
                .map_err(|e| BillingError::StripeApi(format!("Invalid subscription id: {}", e)))?;
            let subscription = stripe_call(
                STRIPE_READ_TIMEOUT,
                Subscription::retrieve(self.stripe.inner(), &sub_id, &["items.data.price.product"]),
            )
            .await?;
            self.mirror_and_push(org_id, &org_slug, &subscription).await?;
        }

        tracing::info!(
            org_id = %org_id,
            org_slug = %org_slug,
            session_id = %session.id,
            "Checkout completion mirrored"
        );
        Ok(())
    }

    async fn handle_subscription_updated(&self, subscription: Subscription) -> BillingResult<()> {
        let customer_ref = expandable_customer_id(&subscription.customer);
        let Some((org_id, org_slug)) = self.find_org_by_customer(&customer_ref).await? else {
            tracing::warn!(
                customer = %customer_ref,
                subscription_id = %subscription.id,
                "Subscription update for unknown customer"
            );
            return Ok(());
        };

        // The webhook payload does not expand product metadata; retrieve
        // the subscription with the expansion before deriving the plan.
        let expanded = stripe_call(
            STRIPE_READ_TIMEOUT,
            Subscription::retrieve(
                self.stripe.inner(),
                &subscription.id,
                &["items.data.price.product"],
            ),
        )
        .await?;

        self.mirror_and_push(org_id, &org_slug, &expanded).await?;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription.id,
            "Subscription update mirrored"
        );
        Ok(())
    }

    async fn handle_subscription_deleted(&self, subscription: Subscription) -> BillingResult<()> {
        let customer_ref = expandable_customer_id(&subscription.customer);
        let Some((org_id, org_slug)) = self.find_org_by_customer(&customer_ref).await? else {
            return Ok(());
        };

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

        tracing::info!(
            org_id = %org_id,
            org_slug = %org_slug,
            subscription_id = %subscription.id,
            "Subscription deletion mirrored, billing marked canceled"
        );
        Ok(())
    }

    async fn find_org_by_customer(
        &self,
        customer_ref: &str,
    ) -> BillingResult<Option<(Uuid, String)>> {
        let row: Option<(Uuid, String)> =
            sqlx::query_as("SELECT id, slug FROM organizations WHERE stripe_customer_id = $1")
                .bind(customer_ref)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn mirror_and_push(
        &self,
        org_id: Uuid,
        org_slug: &str,
        subscription: &Subscription,
    ) -> BillingResult<()> {
        let price = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .ok_or_else(|| {
                BillingError::PlanConfig("subscription has no price to derive a plan from".to_string())
            })?;
        let plan = PlanDescriptor::from_price(price)?;

        let mirror = BillingMirror::from_subscription(subscription, &plan);
        mirror.write(&self.pool, org_id).await?;

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
        if !sync.success {
            // The mirror write succeeded; a lagging limits service is
            // repaired by the next resync.
            tracing::warn!(
                org_id = %org_id,
                error = ?sync.error,
                queued = sync.queued,
                "Limits push failed during webhook mirroring"
            );
        }
        Ok(())
    }
}

fn expandable_customer_id(customer: &Expandable<stripe::Customer>) -> String {
    match customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    }
}

fn expandable_subscription_id(subscription: &Expandable<Subscription>) -> String {
    match subscription {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(subscription) => subscription.id.to_string(),
    }
}
