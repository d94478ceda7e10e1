// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Costscope Shared Types
//!
//! Types and helpers used by both the API server and the billing crate:
//! organization rows, usage limits, input validation, database pools.

pub mod db;
pub mod org;
pub mod validate;

pub use db::{create_pool, run_migrations};
pub use org::{MemberRole, Organization, OrganizationMember, UsageLimits};
pub use validate::{validate_org_slug, validate_price_id, ValidationError};
