//! Billing consistency checks
//!
//! Runnable read-only checks for drift between the mirrored billing state,
//! the audit trail, and the plan bounds. Run after reconciliation or on a
//! schedule; violations carry enough context to debug.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::plans::{
    CONCURRENT_PIPELINE_BOUNDS, DAILY_PIPELINE_BOUNDS, PROVIDER_LIMIT_BOUNDS, SEAT_LIMIT_BOUNDS,
};

/// A single invariant violation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Organization(s) affected
    pub org_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - quotas may be enforced incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidWithoutSubscriptionRow {
    org_id: Uuid,
    slug: String,
    plan_name: Option<String>,
    billing_status: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckPendingRow {
    record_id: Uuid,
    org_id: Uuid,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct OutOfBoundsLimitsRow {
    org_id: Uuid,
    slug: String,
    seat_limit: Option<i32>,
    provider_limit: Option<i32>,
    pipeline_runs_per_day: Option<i32>,
    concurrent_pipelines: Option<i32>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_paid_plan_has_subscription().await?);
        violations.extend(self.check_audit_not_stuck_pending().await?);
        violations.extend(self.check_limits_within_bounds().await?);

        let checks_run = 3;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// A live billing status requires a subscription reference; without
    /// one, quota enforcement is running on state nothing backs.
    async fn check_paid_plan_has_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidWithoutSubscriptionRow> = sqlx::query_as(
            r#"
            SELECT o.id as org_id, o.slug, o.plan_name, o.billing_status
            FROM organizations o
            WHERE o.billing_status IN ('active', 'trialing', 'past_due')
              AND o.stripe_subscription_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_plan_has_subscription".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Organization '{}' has billing status '{}' but no subscription reference",
                    row.slug,
                    row.billing_status.as_deref().unwrap_or("(none)")
                ),
                context: serde_json::json!({
                    "slug": row.slug,
                    "plan_name": row.plan_name,
                    "billing_status": row.billing_status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Audit records should leave `pending` within the request that
    /// created them; one stuck for an hour means a sync outcome was lost.
    async fn check_audit_not_stuck_pending(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckPendingRow> = sqlx::query_as(
            r#"
            SELECT a.id as record_id, a.org_id, a.created_at
            FROM plan_change_audit a
            WHERE a.sync_status = 'pending'
              AND a.created_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "audit_not_stuck_pending".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Plan change audit record {} has been pending since {}",
                    row.record_id, row.created_at
                ),
                context: serde_json::json!({
                    "record_id": row.record_id,
                    "created_at": row.created_at.to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Stored limits must respect the plan bounds; the write paths reject
    /// out-of-bounds descriptors, so a violation means an unguarded write.
    async fn check_limits_within_bounds(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OutOfBoundsLimitsRow> = sqlx::query_as(
            r#"
            SELECT o.id as org_id, o.slug, o.seat_limit, o.provider_limit,
                   o.pipeline_runs_per_day, o.concurrent_pipelines
            FROM organizations o
            WHERE (o.seat_limit IS NOT NULL AND (o.seat_limit < $1 OR o.seat_limit > $2))
               OR (o.provider_limit IS NOT NULL AND (o.provider_limit < $3 OR o.provider_limit > $4))
               OR (o.pipeline_runs_per_day IS NOT NULL
                   AND (o.pipeline_runs_per_day < $5 OR o.pipeline_runs_per_day > $6))
               OR (o.concurrent_pipelines IS NOT NULL
                   AND (o.concurrent_pipelines < $7 OR o.concurrent_pipelines > $8))
            "#,
        )
        .bind(*SEAT_LIMIT_BOUNDS.start())
        .bind(*SEAT_LIMIT_BOUNDS.end())
        .bind(*PROVIDER_LIMIT_BOUNDS.start())
        .bind(*PROVIDER_LIMIT_BOUNDS.end())
        .bind(*DAILY_PIPELINE_BOUNDS.start())
        .bind(*DAILY_PIPELINE_BOUNDS.end())
        .bind(*CONCURRENT_PIPELINE_BOUNDS.start())
        .bind(*CONCURRENT_PIPELINE_BOUNDS.end())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "limits_within_bounds".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Organization '{}' has stored usage limits outside plan bounds",
                    row.slug
                ),
                context: serde_json::json!({
                    "slug": row.slug,
                    "seat_limit": row.seat_limit,
                    "provider_limit": row.provider_limit,
                    "pipeline_runs_per_day": row.pipeline_runs_per_day,
                    "concurrent_pipelines": row.concurrent_pipelines,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "paid_plan_has_subscription" => self.check_paid_plan_has_subscription().await,
            "audit_not_stuck_pending" => self.check_audit_not_stuck_pending().await,
            "limits_within_bounds" => self.check_limits_within_bounds().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "paid_plan_has_subscription",
            "audit_not_stuck_pending",
            "limits_within_bounds",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 3);
        assert!(checks.contains(&"limits_within_bounds"));
    }
}
