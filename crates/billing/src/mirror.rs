//! Primary-datastore mirror writes
//!
//! The payment processor is the source of truth for subscription state;
//! these helpers overwrite the low-latency mirror on the organizations row.
//! Both the plan-change orchestrator and the reconciliation path write
//! through here so they cannot drift apart.

use costscope_shared::UsageLimits;
use sqlx::PgPool;
use stripe::{Subscription, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::plans::PlanDescriptor;

/// Snapshot of billing state to mirror onto an organizations row
#[derive(Debug, Clone)]
pub struct BillingMirror {
    pub stripe_subscription_id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub billing_status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub trial_end: Option<OffsetDateTime>,
    pub limits: UsageLimits,
}

/// Free-text mirror of the processor's subscription status.
pub fn subscription_status_str(status: SubscriptionStatus) -> &'static str {
    match status {
        SubscriptionStatus::Active => "active",
        SubscriptionStatus::PastDue => "past_due",
        SubscriptionStatus::Canceled => "canceled",
        SubscriptionStatus::Unpaid => "unpaid",
        SubscriptionStatus::Trialing => "trialing",
        SubscriptionStatus::Incomplete => "incomplete",
        SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        SubscriptionStatus::Paused => "paused",
    }
}

fn timestamp(unix: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

impl BillingMirror {
    /// Build a mirror snapshot from a subscription and its derived plan.
    pub fn from_subscription(subscription: &Subscription, plan: &PlanDescriptor) -> Self {
        Self {
            stripe_subscription_id: subscription.id.to_string(),
            plan_id: plan.price_id.clone(),
            plan_name: plan.name.clone(),
            billing_status: subscription_status_str(subscription.status).to_string(),
            current_period_start: timestamp(subscription.current_period_start),
            current_period_end: timestamp(subscription.current_period_end),
            trial_end: subscription.trial_end.map(timestamp),
            limits: plan.limits,
        }
    }

    /// Overwrite the organization's mirrored billing columns.
    pub async fn write(&self, pool: &PgPool, org_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE organizations SET
                stripe_subscription_id = $2,
                plan_id = $3,
                plan_name = $4,
                billing_status = $5,
                current_period_start = $6,
                current_period_end = $7,
                trial_end = $8,
                seat_limit = $9,
                provider_limit = $10,
                pipeline_runs_per_day = $11,
                pipeline_runs_per_week = $12,
                pipeline_runs_per_month = $13,
                concurrent_pipelines = $14,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(org_id)
        .bind(&self.stripe_subscription_id)
        .bind(&self.plan_id)
        .bind(&self.plan_name)
        .bind(&self.billing_status)
        .bind(self.current_period_start)
        .bind(self.current_period_end)
        .bind(self.trial_end)
        .bind(self.limits.seat_limit)
        .bind(self.limits.provider_limit)
        .bind(self.limits.pipeline_runs_per_day)
        .bind(self.limits.pipeline_runs_per_week)
        .bind(self.limits.pipeline_runs_per_month)
        .bind(self.limits.concurrent_pipelines)
        .execute(pool)
        .await?;

        Ok(())
    }
}
