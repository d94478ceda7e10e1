// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing System
//!
//! Boundary conditions and failure-path behavior in:
//! - Rate limiting (RL-01 to RL-05)
//! - Plan descriptor bounds (PLAN-01 to PLAN-05)
//! - Sync status lifecycle (SYNC-01 to SYNC-03)
//! - Idempotency keys (IDEM-01 to IDEM-02)

#[cfg(test)]
mod rate_limit_edge_cases {
    use crate::rate_limit::{decide, RateLimitConfig};
    use std::time::Duration;
    use time::OffsetDateTime;

    fn cfg(max_attempts: i32, window_secs: u64) -> RateLimitConfig {
        RateLimitConfig {
            max_attempts,
            window: Duration::from_secs(window_secs),
            entry_ceiling: 100,
            evict_check_interval: 64,
        }
    }

    // =========================================================================
    // RL-01: First attempt in a fresh window is always allowed
    // =========================================================================
    #[test]
    fn test_first_attempt_allowed() {
        let now = OffsetDateTime::now_utc();
        let result = decide(1, now, now, &cfg(2, 30));
        assert!(result.allowed);
        assert!(result.retry_after_seconds.is_none());
    }

    // =========================================================================
    // RL-02: Attempt N at limit N is allowed, N+1 is not
    // =========================================================================
    #[test]
    fn test_limit_boundary() {
        let now = OffsetDateTime::now_utc();
        let config = cfg(2, 30);
        assert!(decide(2, now, now, &config).allowed);
        assert!(!decide(3, now, now, &config).allowed);
    }

    // =========================================================================
    // RL-03: A max_attempts of 1 rejects the second attempt immediately
    // =========================================================================
    #[test]
    fn test_single_attempt_window() {
        let now = OffsetDateTime::now_utc();
        let config = cfg(1, 30);
        assert!(decide(1, now, now, &config).allowed);
        assert!(!decide(2, now, now, &config).allowed);
    }

    // =========================================================================
    // RL-04: Retry hint shrinks as the window ages
    // =========================================================================
    #[test]
    fn test_retry_hint_tracks_window_age() {
        let config = cfg(1, 30);
        let window_start = OffsetDateTime::now_utc();

        let early = decide(2, window_start, window_start, &config);
        let late = decide(
            2,
            window_start,
            window_start + Duration::from_secs(25),
            &config,
        );

        assert!(early.retry_after_seconds.unwrap() >= late.retry_after_seconds.unwrap());
        assert!(late.retry_after_seconds.unwrap() <= 5);
    }

    // =========================================================================
    // RL-05: The store resets attempts to 1 after the window elapses, so a
    // count of 1 is allowed no matter how old the previous window was
    // =========================================================================
    #[test]
    fn test_fresh_window_after_expiry() {
        let config = cfg(2, 30);
        let window_start = OffsetDateTime::now_utc();
        let result = decide(1, window_start, window_start, &config);
        assert!(result.allowed);
    }
}

#[cfg(test)]
mod plan_bounds_edge_cases {
    use crate::plans::limits_from_metadata;
    use std::collections::HashMap;

    fn base() -> HashMap<String, String> {
        [
            ("seat_limit", "1"),
            ("provider_limit", "1"),
            ("pipeline_runs_per_day", "1"),
            ("concurrent_pipelines", "1"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    // =========================================================================
    // PLAN-01: Minimum bound of 1 on every field is accepted
    // =========================================================================
    #[test]
    fn test_minimum_bounds_accepted() {
        let limits = limits_from_metadata(&base()).unwrap();
        assert_eq!(limits.seat_limit, 1);
        assert_eq!(limits.pipeline_runs_per_week, 7);
        assert_eq!(limits.pipeline_runs_per_month, 30);
    }

    // =========================================================================
    // PLAN-02: One past each upper bound is rejected
    // =========================================================================
    #[test]
    fn test_one_past_upper_bound_rejected() {
        for (key, value) in [
            ("seat_limit", "1001"),
            ("provider_limit", "101"),
            ("pipeline_runs_per_day", "10001"),
            ("concurrent_pipelines", "51"),
        ] {
            let mut meta = base();
            meta.insert(key.to_string(), value.to_string());
            assert!(
                limits_from_metadata(&meta).is_err(),
                "{} = {} must be rejected",
                key,
                value
            );
        }
    }

    // =========================================================================
    // PLAN-03: Whitespace around numbers is tolerated
    // =========================================================================
    #[test]
    fn test_whitespace_tolerated() {
        let mut meta = base();
        meta.insert("seat_limit".to_string(), " 25 ".to_string());
        assert_eq!(limits_from_metadata(&meta).unwrap().seat_limit, 25);
    }

    // =========================================================================
    // PLAN-04: A rejected descriptor yields no limits at all - the error
    // carries the offending field
    // =========================================================================
    #[test]
    fn test_rejection_names_field() {
        let mut meta = base();
        meta.insert("seat_limit".to_string(), "2000".to_string());
        let err = limits_from_metadata(&meta).unwrap_err();
        assert!(err.to_string().contains("seat_limit"));
    }

    // =========================================================================
    // PLAN-05: Integer overflow input is a parse error, not a panic
    // =========================================================================
    #[test]
    fn test_overflow_input_rejected() {
        let mut meta = base();
        meta.insert(
            "pipeline_runs_per_day".to_string(),
            "99999999999999999999".to_string(),
        );
        assert!(limits_from_metadata(&meta).is_err());
    }
}

#[cfg(test)]
mod sync_status_edge_cases {
    use crate::audit::SyncStatus;

    // =========================================================================
    // SYNC-01: Queued retry leaves the record pending and retains the
    // ability to reach a terminal state later
    // =========================================================================
    #[test]
    fn test_queued_retry_then_terminal() {
        let status = SyncStatus::Pending
            .transition(SyncStatus::Pending)
            .unwrap();
        let status = status.transition(SyncStatus::Synced).unwrap();
        assert_eq!(status, SyncStatus::Synced);
    }

    // =========================================================================
    // SYNC-02: A synced record can never become failed (and vice versa)
    // =========================================================================
    #[test]
    fn test_terminal_states_are_final() {
        assert!(SyncStatus::Synced.transition(SyncStatus::Failed).is_err());
        assert!(SyncStatus::Failed.transition(SyncStatus::Synced).is_err());
    }

    // =========================================================================
    // SYNC-03: Terminal states cannot be reopened
    // =========================================================================
    #[test]
    fn test_terminal_states_cannot_reopen() {
        assert!(SyncStatus::Synced.transition(SyncStatus::Pending).is_err());
        assert!(SyncStatus::Failed.transition(SyncStatus::Pending).is_err());
    }
}

#[cfg(test)]
mod idempotency_edge_cases {
    use crate::idempotency::{checkout_key, plan_change_key, CheckoutMode};
    use uuid::Uuid;

    // =========================================================================
    // IDEM-01: Keys derived at different times are identical - no clock
    // component may leak in
    // =========================================================================
    #[tokio::test]
    async fn test_keys_stable_across_time() {
        let org = Uuid::new_v4();
        let before = plan_change_key(org, "price_abc");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let after = plan_change_key(org, "price_abc");
        assert_eq!(before, after);
    }

    // =========================================================================
    // IDEM-02: A user retrying onboarding checkout for a different price
    // gets a different key (and therefore a fresh session)
    // =========================================================================
    #[test]
    fn test_price_change_gets_fresh_key() {
        let user = Uuid::new_v4().to_string();
        let key_a = checkout_key(CheckoutMode::Onboarding, &user, "price_monthly");
        let key_b = checkout_key(CheckoutMode::Onboarding, &user, "price_annual");
        assert_ne!(key_a, key_b);
    }
}
