//! Organization lookup and billing-access checks
//!
//! Shared by the checkout, plan-change and reconciliation paths. All
//! checks run before any external call is made.

use costscope_shared::MemberRole;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Billing-relevant slice of the organizations row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrgBillingRow {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub plan_id: Option<String>,
    pub plan_name: Option<String>,
    pub billing_status: Option<String>,
}

/// Statuses that count as a live subscription
pub const ACTIVE_STATUSES: &[&str] = &["active", "trialing", "past_due"];

impl OrgBillingRow {
    /// Whether the mirrored billing status indicates a live subscription.
    pub fn has_active_subscription(&self) -> bool {
        self.stripe_subscription_id.is_some()
            && self
                .billing_status
                .as_deref()
                .map(|s| ACTIVE_STATUSES.contains(&s))
                .unwrap_or(false)
    }
}

pub async fn fetch_org_by_slug(pool: &PgPool, slug: &str) -> BillingResult<OrgBillingRow> {
    let org = sqlx::query_as::<_, OrgBillingRow>(
        r#"
        SELECT id, slug, name, stripe_customer_id, stripe_subscription_id,
               plan_id, plan_name, billing_status
        FROM organizations
        WHERE slug = $1
        "#,
    )
    .bind(slug)
    .fetch_optional(pool)
    .await?;

    org.ok_or_else(|| BillingError::NotFound(slug.to_string()))
}

/// Require the acting user to be the organization's sole billing owner.
pub async fn require_sole_owner(pool: &PgPool, org_id: Uuid, user_id: Uuid) -> BillingResult<()> {
    let role: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT role FROM organization_members
        WHERE org_id = $1 AND user_id = $2 AND status = 'active'
        "#,
    )
    .bind(org_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    match role {
        None => return Err(BillingError::NotAMember),
        Some((role,)) if role != MemberRole::Owner.as_str() => {
            return Err(BillingError::NotOwner)
        }
        Some(_) => {}
    }

    let owner_count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM organization_members
        WHERE org_id = $1 AND role = $2 AND status = 'active'
        "#,
    )
    .bind(org_id)
    .bind(MemberRole::Owner.as_str())
    .fetch_one(pool)
    .await?;

    if owner_count != 1 {
        return Err(BillingError::NotOwner);
    }

    Ok(())
}

/// Active-member count, used by the downgrade eligibility guard.
pub async fn count_active_members(pool: &PgPool, org_id: Uuid) -> BillingResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM organization_members WHERE org_id = $1 AND status = 'active'",
    )
    .bind(org_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(sub: Option<&str>, status: Option<&str>) -> OrgBillingRow {
        OrgBillingRow {
            id: Uuid::new_v4(),
            slug: "acme_co".to_string(),
            name: "Acme Co".to_string(),
            stripe_customer_id: Some("cus_123".to_string()),
            stripe_subscription_id: sub.map(String::from),
            plan_id: None,
            plan_name: None,
            billing_status: status.map(String::from),
        }
    }

    #[test]
    fn test_active_subscription_detection() {
        assert!(row(Some("sub_1"), Some("active")).has_active_subscription());
        assert!(row(Some("sub_1"), Some("trialing")).has_active_subscription());
        assert!(row(Some("sub_1"), Some("past_due")).has_active_subscription());
        assert!(!row(Some("sub_1"), Some("canceled")).has_active_subscription());
        assert!(!row(Some("sub_1"), None).has_active_subscription());
        assert!(!row(None, Some("active")).has_active_subscription());
    }
}
