//! Plan-change audit trail
//!
//! One row per plan-change attempt, inserted with sync status `pending`
//! before the limits push runs and patched exactly once when the outcome
//! is known. Rows are never deleted.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Direction of a plan change, classified by unit-price comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanChangeAction {
    Upgrade,
    Downgrade,
}

impl PlanChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanChangeAction::Upgrade => "upgrade",
            PlanChangeAction::Downgrade => "downgrade",
        }
    }

    /// A change to an equal or higher unit price is an upgrade.
    pub fn classify(old_price_cents: i64, new_price_cents: i64) -> Self {
        if new_price_cents >= old_price_cents {
            PlanChangeAction::Upgrade
        } else {
            PlanChangeAction::Downgrade
        }
    }
}

/// Synchronization state of an audit record.
///
/// Modeled as a tagged enum with defined transitions so an invalid
/// transition is a typed error instead of a silently-written status
/// string. `Pending -> Pending` is the queued-for-retry case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    /// Attempt a state transition. `Synced` and `Failed` are terminal.
    pub fn transition(self, to: SyncStatus) -> Result<SyncStatus, InvalidSyncTransition> {
        match (self, to) {
            (SyncStatus::Pending, next) => Ok(next),
            (from, to) => Err(InvalidSyncTransition { from, to }),
        }
    }
}

/// Rejected sync-status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid sync status transition {from:?} -> {to:?}")]
pub struct InvalidSyncTransition {
    pub from: SyncStatus,
    pub to: SyncStatus,
}

/// New audit row, written before the limits push runs
#[derive(Debug, Clone)]
pub struct NewPlanChangeAudit {
    pub org_id: Uuid,
    pub actor_user_id: Uuid,
    pub action: PlanChangeAction,
    pub old_plan: Option<String>,
    pub new_plan: String,
    pub old_price_cents: Option<i64>,
    pub new_price_cents: i64,
    pub stripe_subscription_id: String,
    pub metadata: serde_json::Value,
}

/// Stored audit record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlanChangeAuditRecord {
    pub id: Uuid,
    pub org_id: Uuid,
    pub actor_user_id: Uuid,
    pub action: String,
    pub old_plan: Option<String>,
    pub new_plan: String,
    pub old_price_cents: Option<i64>,
    pub new_price_cents: Option<i64>,
    pub stripe_subscription_id: Option<String>,
    pub sync_status: String,
    pub sync_error: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Append/patch access to the plan-change audit trail
#[derive(Clone)]
pub struct AuditTrail {
    pool: PgPool,
}

impl AuditTrail {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a record with sync status `pending`, returning its id.
    pub async fn record_pending(&self, entry: &NewPlanChangeAudit) -> BillingResult<Uuid> {
        let record: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO plan_change_audit (
                org_id, actor_user_id, action, old_plan, new_plan,
                old_price_cents, new_price_cents, stripe_subscription_id,
                sync_status, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9)
            RETURNING id
            "#,
        )
        .bind(entry.org_id)
        .bind(entry.actor_user_id)
        .bind(entry.action.as_str())
        .bind(&entry.old_plan)
        .bind(&entry.new_plan)
        .bind(entry.old_price_cents)
        .bind(entry.new_price_cents)
        .bind(&entry.stripe_subscription_id)
        .bind(&entry.metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(record.0)
    }

    /// Patch the record with the sync outcome. The transition is validated
    /// in the type system before any SQL runs; the row is only patched if
    /// it is still `pending`, so a replay cannot overwrite a terminal
    /// status.
    pub async fn record_sync_outcome(
        &self,
        record_id: Uuid,
        outcome: SyncStatus,
        sync_error: Option<&str>,
    ) -> BillingResult<()> {
        SyncStatus::Pending
            .transition(outcome)
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let rows = sqlx::query(
            r#"
            UPDATE plan_change_audit
            SET sync_status = $2,
                sync_error = $3,
                updated_at = NOW()
            WHERE id = $1 AND sync_status = 'pending'
            "#,
        )
        .bind(record_id)
        .bind(outcome.as_str())
        .bind(sync_error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            tracing::warn!(
                record_id = %record_id,
                outcome = outcome.as_str(),
                "Audit record was not pending, outcome not recorded"
            );
        }

        Ok(())
    }

    /// Plan-change history for an organization, newest first.
    pub async fn history(&self, org_id: Uuid) -> BillingResult<Vec<PlanChangeAuditRecord>> {
        let records = sqlx::query_as::<_, PlanChangeAuditRecord>(
            r#"
            SELECT
                id, org_id, actor_user_id, action, old_plan, new_plan,
                old_price_cents, new_price_cents, stripe_subscription_id,
                sync_status, sync_error, metadata, created_at, updated_at
            FROM plan_change_audit
            WHERE org_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_price() {
        assert_eq!(
            PlanChangeAction::classify(2900, 9900),
            PlanChangeAction::Upgrade
        );
        assert_eq!(
            PlanChangeAction::classify(9900, 2900),
            PlanChangeAction::Downgrade
        );
        // Same price (e.g. monthly -> annual with equal unit amount)
        assert_eq!(
            PlanChangeAction::classify(2900, 2900),
            PlanChangeAction::Upgrade
        );
    }

    #[test]
    fn test_valid_transitions_from_pending() {
        assert_eq!(
            SyncStatus::Pending.transition(SyncStatus::Synced).unwrap(),
            SyncStatus::Synced
        );
        assert_eq!(
            SyncStatus::Pending.transition(SyncStatus::Failed).unwrap(),
            SyncStatus::Failed
        );
        // Queued-for-retry keeps the record pending
        assert_eq!(
            SyncStatus::Pending.transition(SyncStatus::Pending).unwrap(),
            SyncStatus::Pending
        );
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        for from in [SyncStatus::Synced, SyncStatus::Failed] {
            for to in [SyncStatus::Pending, SyncStatus::Synced, SyncStatus::Failed] {
                let err = from.transition(to).unwrap_err();
                assert_eq!(err.from, from);
                assert_eq!(err.to, to);
            }
        }
    }

    #[test]
    fn test_status_strings_match_schema() {
        assert_eq!(SyncStatus::Pending.as_str(), "pending");
        assert_eq!(SyncStatus::Synced.as_str(), "synced");
        assert_eq!(SyncStatus::Failed.as_str(), "failed");
    }
}
