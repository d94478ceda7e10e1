//! Organization and membership row types

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Derived usage limits for an organization's current plan.
///
/// Written to the organizations row by the billing crate and pushed to the
/// backend limits service. Values are validated against plan bounds before
/// being written anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimits {
    /// Maximum active members (seats)
    pub seat_limit: i32,
    /// Maximum connected integration providers
    pub provider_limit: i32,
    /// Cost-pipeline runs allowed per day
    pub pipeline_runs_per_day: i32,
    /// Cost-pipeline runs allowed per week
    pub pipeline_runs_per_week: i32,
    /// Cost-pipeline runs allowed per month
    pub pipeline_runs_per_month: i32,
    /// Concurrently executing pipelines
    pub concurrent_pipelines: i32,
}

/// Organization row as stored in the primary datastore.
///
/// The payment processor owns the customer/subscription references and
/// billing status as ground truth; these columns are a low-latency mirror.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Organization {
    pub id: Uuid,
    /// Unique, immutable tenant slug
    pub slug: String,
    pub name: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    /// Price id of the current plan
    pub plan_id: Option<String>,
    pub plan_name: Option<String>,
    /// Free-text mirror of the processor's subscription status
    /// (active/trialing/past_due/canceled/...)
    pub billing_status: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub seat_limit: Option<i32>,
    pub provider_limit: Option<i32>,
    pub pipeline_runs_per_day: Option<i32>,
    pub pipeline_runs_per_week: Option<i32>,
    pub pipeline_runs_per_month: Option<i32>,
    pub concurrent_pipelines: Option<i32>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Role of a member inside an organization. Stored as plain text with a
/// CHECK constraint; compare with [`MemberRole::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }
}

/// Membership row linking a user to an organization
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OrganizationMember {
    pub org_id: Uuid,
    pub user_id: Uuid,
    /// owner | admin | member
    pub role: String,
    /// active | suspended
    pub status: String,
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_role_as_str() {
        assert_eq!(MemberRole::Owner.as_str(), "owner");
        assert_eq!(MemberRole::Admin.as_str(), "admin");
        assert_eq!(MemberRole::Member.as_str(), "member");
    }
}
