//! Plan change orchestration
//!
//! The single authoritative path for changing an organization's plan.
//! Mutation order and failure boundaries:
//!
//! 1. Apply the new price at Stripe with proration — failure aborts the
//!    whole operation, nothing persisted.
//! 2. Parse the resulting plan's limits from product metadata — failure is
//!    a configuration error in a partial-success state (Stripe has already
//!    changed); the audit record is still written best-effort.
//! 3. Mirror to the primary datastore — non-fatal, Stripe stays
//!    authoritative and reconciliation self-heals.
//! 4. Append the audit record with sync status `pending`.
//! 5. Push limits to the backend service — non-fatal, surfaced as
//!    `sync_warning`/`sync_queued` on an otherwise-successful result.

use serde::Serialize;
use sqlx::PgPool;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    Price, PriceId, Subscription, SubscriptionId, UpdateSubscription, UpdateSubscriptionItems,
};
use time::OffsetDateTime;
use uuid::Uuid;

use costscope_shared::{validate_org_slug, validate_price_id};

use crate::audit::{AuditTrail, NewPlanChangeAudit, PlanChangeAction, SyncStatus};
use crate::client::{stripe_call, StripeClient, STRIPE_MUTATE_TIMEOUT, STRIPE_READ_TIMEOUT};
use crate::error::{BillingError, BillingResult};
use crate::idempotency::plan_change_key;
use crate::limits_sync::{LimitsPush, LimitsSyncClient, SyncType};
use crate::mirror::BillingMirror;
use crate::orgs::{self, OrgBillingRow};
use crate::plans::PlanDescriptor;

/// Summary of the subscription after a plan change
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSummary {
    pub stripe_subscription_id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub billing_status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub unit_amount_cents: i64,
    pub interval: String,
}

/// Result of a plan change.
///
/// `success` is true once the Stripe mutation and local bookkeeping
/// completed, even when downstream mirrors lagged; `sync_warning` and
/// `sync_queued` communicate degraded-but-successful completion.
#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeOutcome {
    pub success: bool,
    pub action: PlanChangeAction,
    pub subscription: SubscriptionSummary,
    pub sync_warning: Option<String>,
    pub sync_queued: bool,
}

/// Reject a plan whose seat limit cannot hold the current member count.
///
/// Runs on a snapshot taken before any external mutation. Two requests
/// racing between this check and the Stripe mutation can both pass; the
/// processor serializes the subscription updates and reconciliation
/// restores consistency. That window is an accepted trade-off, not a bug.
pub(crate) fn check_seat_eligibility(
    active_members: i64,
    plan: &PlanDescriptor,
) -> BillingResult<()> {
    if active_members > i64::from(plan.limits.seat_limit) {
        return Err(BillingError::Ineligible(format!(
            "Cannot downgrade to {}: organization has {} active members but the plan allows \
             {} seats. Remove members before changing plans.",
            plan.name, active_members, plan.limits.seat_limit
        )));
    }
    Ok(())
}

/// Plan change orchestrator
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
    audit: AuditTrail,
    limits_sync: LimitsSyncClient,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool, limits_sync: LimitsSyncClient) -> Self {
        let audit = AuditTrail::new(pool.clone());
        Self {
            stripe,
            pool,
            audit,
            limits_sync,
        }
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Change an organization's subscription to a new price.
    pub async fn change_plan(
        &self,
        org_slug: &str,
        new_price_id: &str,
        acting_user_id: Uuid,
    ) -> BillingResult<PlanChangeOutcome> {
        validate_org_slug(org_slug)?;
        validate_price_id(new_price_id)?;

        let org = orgs::fetch_org_by_slug(&self.pool, org_slug).await?;
        orgs::require_sole_owner(&self.pool, org.id, acting_user_id).await?;

        let sub_ref = org
            .stripe_subscription_id
            .as_deref()
            .ok_or_else(|| BillingError::SubscriptionNotFound(org_slug.to_string()))?;
        let sub_id: SubscriptionId = sub_ref
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription id: {}", e)))?;
        let price_id: PriceId = new_price_id
            .parse()
            .map_err(|e| BillingError::Validation(format!("Invalid price id: {}", e)))?;

        // Resolve the target plan before mutating anything: a catalog
        // defect must not leave a half-changed subscription behind.
        let new_price = stripe_call(
            STRIPE_READ_TIMEOUT,
            Price::retrieve(self.stripe.inner(), &price_id, &["product"]),
        )
        .await?;
        let new_plan = PlanDescriptor::from_price(&new_price)?;

        // Eligibility guard, before any external mutation
        let active_members = orgs::count_active_members(&self.pool, org.id).await?;
        check_seat_eligibility(active_members, &new_plan)?;

        // Current subscription: item id to swap, old price for action
        // classification
        let current = stripe_call(
            STRIPE_READ_TIMEOUT,
            Subscription::retrieve(self.stripe.inner(), &sub_id, &["items.data.price"]),
        )
        .await?;

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::StripeApi("No subscription items found".to_string()))?;

        let old_price = current
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref());
        let old_price_id = old_price.map(|p| p.id.to_string());
        let old_price_cents = old_price.and_then(|p| p.unit_amount).unwrap_or(0);

        let action = PlanChangeAction::classify(old_price_cents, new_plan.unit_amount_cents);

        // Step 1: authoritative mutation with proration. The idempotency
        // key collapses a replayed request into a no-op re-return instead
        // of a second proration charge.
        let key = plan_change_key(org.id, new_price_id);
        let client = self.stripe.idempotent(&key);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("org_slug".to_string(), org_slug.to_string());
        metadata.insert("plan_id".to_string(), new_price_id.to_string());

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(new_price_id.to_string()),
                ..Default::default()
            }]),
            metadata: Some(metadata),
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            expand: &["items.data.price.product"],
            ..Default::default()
        };

        let updated = stripe_call(
            STRIPE_MUTATE_TIMEOUT,
            Subscription::update(&client, &sub_id, params),
        )
        .await?;

        // Step 2: re-derive the plan from what Stripe actually applied.
        // Failure here is a partial-success state: the subscription has
        // already changed, so surface a configuration error distinctly and
        // still write the audit record best-effort.
        let plan = match updated
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .ok_or_else(|| {
                BillingError::PlanConfig("updated subscription has no price".to_string())
            })
            .and_then(PlanDescriptor::from_price)
        {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(
                    org_id = %org.id,
                    subscription_id = %updated.id,
                    new_price_id = %new_price_id,
                    error = %e,
                    "Subscription changed at Stripe but plan limits are unusable"
                );
                self.record_partial_failure(
                    &org,
                    acting_user_id,
                    action,
                    old_price_id.as_deref(),
                    old_price_cents,
                    new_price_id,
                    new_plan.unit_amount_cents,
                    &updated,
                    &e,
                )
                .await;
                return Err(e);
            }
        };

        // Step 3: mirror write. Non-fatal: Stripe remains authoritative
        // and a webhook or resync will self-heal the mirror.
        let mirror = BillingMirror::from_subscription(&updated, &plan);
        let mut sync_warning: Option<String> = None;
        let mut mirror_write = "ok";
        if let Err(e) = mirror.write(&self.pool, org.id).await {
            tracing::warn!(
                org_id = %org.id,
                error = %e,
                "Primary datastore mirror write failed after plan change"
            );
            sync_warning = Some(format!(
                "Plan changed, but updating the local billing record failed: {}",
                e
            ));
            mirror_write = "failed";
        }

        // Step 4: audit record, sync status pending
        let audit_id = match self
            .audit
            .record_pending(&NewPlanChangeAudit {
                org_id: org.id,
                actor_user_id: acting_user_id,
                action,
                old_plan: org.plan_name.clone(),
                new_plan: plan.name.clone(),
                old_price_cents: Some(old_price_cents),
                new_price_cents: plan.unit_amount_cents,
                stripe_subscription_id: updated.id.to_string(),
                metadata: serde_json::json!({
                    "org_slug": org_slug,
                    "old_price_id": old_price_id,
                    "new_price_id": new_price_id,
                    "proration": "create_prorations",
                    "mirror_write": mirror_write,
                }),
            })
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(
                    org_id = %org.id,
                    error = %e,
                    "Failed to write plan change audit record"
                );
                None
            }
        };

        // Step 5: push limits to the backend service
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
            sync_type: SyncType::PlanChange,
        };
        let sync = self.limits_sync.push(&push).await;

        let mut sync_queued = false;
        if sync.success {
            if let Some(id) = audit_id {
                if let Err(e) = self
                    .audit
                    .record_sync_outcome(id, SyncStatus::Synced, None)
                    .await
                {
                    tracing::warn!(record_id = %id, error = %e, "Failed to record sync outcome");
                }
            }
        } else {
            let error_text = sync.error.as_deref().unwrap_or("unknown sync failure");
            // Queued-for-retry keeps the record pending; a terminal
            // failure marks it failed. Either way the customer's plan has
            // already changed and must not be rolled back.
            let status = if sync.queued {
                SyncStatus::Pending
            } else {
                SyncStatus::Failed
            };
            if let Some(id) = audit_id {
                if let Err(e) = self
                    .audit
                    .record_sync_outcome(id, status, Some(error_text))
                    .await
                {
                    tracing::warn!(record_id = %id, error = %e, "Failed to record sync outcome");
                }
            }
            sync_queued = sync.queued;
            sync_warning = Some(format!(
                "Plan changed, but syncing usage limits failed: {}. Run a billing resync if \
                 limits look stale.",
                error_text
            ));
        }

        tracing::info!(
            org_id = %org.id,
            org_slug = %org_slug,
            action = action.as_str(),
            new_plan = %plan.name,
            new_price_id = %new_price_id,
            sync_queued,
            "Plan change completed"
        );

        Ok(PlanChangeOutcome {
            success: true,
            action,
            subscription: SubscriptionSummary {
                stripe_subscription_id: updated.id.to_string(),
                plan_id: plan.price_id.clone(),
                plan_name: plan.name.clone(),
                billing_status: mirror.billing_status.clone(),
                current_period_start: mirror.current_period_start,
                current_period_end: mirror.current_period_end,
                unit_amount_cents: plan.unit_amount_cents,
                interval: plan.interval.clone(),
            },
            sync_warning,
            sync_queued,
        })
    }

    /// Best-effort audit write for the step-2 partial-success state: the
    /// subscription changed at Stripe but the plan limits are unusable, so
    /// no limits sync will run.
    #[allow(clippy::too_many_arguments)]
    async fn record_partial_failure(
        &self,
        org: &OrgBillingRow,
        acting_user_id: Uuid,
        action: PlanChangeAction,
        old_price_id: Option<&str>,
        old_price_cents: i64,
        new_price_id: &str,
        new_price_cents: i64,
        updated: &Subscription,
        error: &BillingError,
    ) {
        let entry = NewPlanChangeAudit {
            org_id: org.id,
            actor_user_id: acting_user_id,
            action,
            old_plan: org.plan_name.clone(),
            new_plan: new_price_id.to_string(),
            old_price_cents: Some(old_price_cents),
            new_price_cents,
            stripe_subscription_id: updated.id.to_string(),
            metadata: serde_json::json!({
                "org_slug": org.slug,
                "old_price_id": old_price_id,
                "new_price_id": new_price_id,
                "partial_failure": "plan metadata unusable after mutation",
            }),
        };

        match self.audit.record_pending(&entry).await {
            Ok(id) => {
                if let Err(e) = self
                    .audit
                    .record_sync_outcome(id, SyncStatus::Failed, Some(&error.to_string()))
                    .await
                {
                    tracing::warn!(
                        record_id = %id,
                        error = %e,
                        "Failed to mark partial-failure audit record"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    org_id = %org.id,
                    error = %e,
                    "Failed to write partial-failure audit record"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use costscope_shared::UsageLimits;

    fn plan(name: &str, seat_limit: i32) -> PlanDescriptor {
        PlanDescriptor {
            price_id: "price_planB".to_string(),
            name: name.to_string(),
            unit_amount_cents: 4900,
            interval: "month".to_string(),
            limits: UsageLimits {
                seat_limit,
                provider_limit: 10,
                pipeline_runs_per_day: 500,
                pipeline_runs_per_week: 3500,
                pipeline_runs_per_month: 15000,
                concurrent_pipelines: 5,
            },
        }
    }

    #[test]
    fn test_downgrade_blocked_when_members_exceed_seats() {
        let err = check_seat_eligibility(7, &plan("Starter", 5)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Cannot downgrade"), "got: {}", msg);
        assert!(msg.contains("7 active members"));
        assert!(msg.contains("5 seats"));
    }

    #[test]
    fn test_member_count_at_seat_limit_is_eligible() {
        assert!(check_seat_eligibility(5, &plan("Starter", 5)).is_ok());
        assert!(check_seat_eligibility(4, &plan("Starter", 5)).is_ok());
        assert!(check_seat_eligibility(0, &plan("Starter", 5)).is_ok());
    }

    #[test]
    fn test_eligibility_race_window() {
        // Two concurrent plan changes for the same org read the same
        // member-count snapshot before either mutates at Stripe. Both pass
        // the guard; nothing re-checks inside the mutation. The guard is
        // best-effort: the processor serializes the subscription writes
        // and reconciliation restores consistency afterwards.
        let target = plan("Starter", 5);
        let snapshot_members = 5;

        let request_a = check_seat_eligibility(snapshot_members, &target);
        let request_b = check_seat_eligibility(snapshot_members, &target);

        assert!(request_a.is_ok());
        assert!(request_b.is_ok());
    }

    #[test]
    fn test_action_classification_matches_price_direction() {
        assert_eq!(
            PlanChangeAction::classify(2900, 4900),
            PlanChangeAction::Upgrade
        );
        assert_eq!(
            PlanChangeAction::classify(4900, 2900),
            PlanChangeAction::Downgrade
        );
    }
}
