//! Distributed rate limiting
//!
//! Bounds how often a subject may initiate checkout-session creation. The
//! authoritative counter lives in the `rate_limit_entries` table and is
//! mutated with a single atomic upsert, so the limit holds across all
//! running server instances. A per-process map cannot provide that
//! guarantee and is not used here.
//!
//! On store error the limiter fails open: availability is preferred over
//! strictness for this control, but every fail-open is logged as a warning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

/// Action types subject to rate limiting, keyed per subject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAction {
    /// Checkout-session creation (onboarding or existing-org)
    CheckoutSession,
}

impl RateLimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAction::CheckoutSession => "checkout_session",
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Permitted attempts per window
    pub max_attempts: i32,
    /// Window width
    pub window: Duration,
    /// Entry-count ceiling that triggers amortized eviction
    pub entry_ceiling: i64,
    /// Run the eviction check every N acquires
    pub evict_check_interval: u64,
}

impl RateLimitConfig {
    /// Checkout creation: 2 attempts per 30 seconds per subject.
    pub fn checkout_default() -> Self {
        Self {
            max_attempts: 2,
            window: Duration::from_secs(30),
            entry_ceiling: 10_000,
            evict_check_interval: 64,
        }
    }
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Seconds until the window resets, set when rejected
    pub retry_after_seconds: Option<u64>,
}

/// Decide from the post-increment attempt count whether this attempt is
/// within the window's budget. Pure so the window math is testable without
/// a database.
pub(crate) fn decide(
    attempts: i32,
    window_start: OffsetDateTime,
    now: OffsetDateTime,
    config: &RateLimitConfig,
) -> RateLimitResult {
    if attempts <= config.max_attempts {
        return RateLimitResult {
            allowed: true,
            retry_after_seconds: None,
        };
    }
    let window_ends = window_start + config.window;
    let retry_after = (window_ends - now).whole_seconds().max(1) as u64;
    RateLimitResult {
        allowed: false,
        retry_after_seconds: Some(retry_after),
    }
}

/// Shared-store rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    pool: PgPool,
    config: RateLimitConfig,
    acquires: Arc<AtomicU64>,
}

impl RateLimiter {
    pub fn new(pool: PgPool, config: RateLimitConfig) -> Self {
        Self {
            pool,
            config,
            acquires: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Check-and-increment for one attempt by `subject_id` at `action`.
    ///
    /// The upsert either starts a fresh window (first attempt, or previous
    /// window fully elapsed) or increments the current window's counter;
    /// both paths are a single statement, so concurrent instances cannot
    /// both observe the same pre-increment count.
    pub async fn try_acquire(&self, subject_id: Uuid, action: RateLimitAction) -> RateLimitResult {
        let window_secs = self.config.window.as_secs_f64();

        let row: Result<(i32, OffsetDateTime), sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO rate_limit_entries (subject_id, action, window_start, attempts)
            VALUES ($1, $2, NOW(), 1)
            ON CONFLICT (subject_id, action) DO UPDATE SET
                attempts = CASE
                    WHEN rate_limit_entries.window_start <= NOW() - make_interval(secs => $3)
                    THEN 1
                    ELSE rate_limit_entries.attempts + 1
                END,
                window_start = CASE
                    WHEN rate_limit_entries.window_start <= NOW() - make_interval(secs => $3)
                    THEN NOW()
                    ELSE rate_limit_entries.window_start
                END
            RETURNING attempts, window_start
            "#,
        )
        .bind(subject_id)
        .bind(action.as_str())
        .bind(window_secs)
        .fetch_one(&self.pool)
        .await;

        let result = match row {
            Ok((attempts, window_start)) => decide(
                attempts,
                window_start,
                OffsetDateTime::now_utc(),
                &self.config,
            ),
            Err(e) => {
                // Fail open: never block a paying customer on a counter
                // store outage.
                tracing::warn!(
                    subject_id = %subject_id,
                    action = action.as_str(),
                    error = %e,
                    "Rate limit store unavailable, failing open"
                );
                RateLimitResult {
                    allowed: true,
                    retry_after_seconds: None,
                }
            }
        };

        if !result.allowed {
            tracing::info!(
                subject_id = %subject_id,
                action = action.as_str(),
                retry_after = ?result.retry_after_seconds,
                "Rate limit exceeded"
            );
        }

        self.maybe_evict().await;
        result
    }

    /// Amortized eviction, run on every Nth acquire. When the entry count
    /// exceeds the ceiling: discard fully-expired entries (older than two
    /// window-widths) first, then remove oldest-first down to the ceiling.
    async fn maybe_evict(&self) {
        let n = self.acquires.fetch_add(1, Ordering::Relaxed);
        if n % self.config.evict_check_interval != 0 {
            return;
        }
        if let Err(e) = self.evict_stale_entries().await {
            tracing::warn!(error = %e, "Rate limit eviction failed");
        }
    }

    async fn evict_stale_entries(&self) -> Result<(), sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rate_limit_entries")
            .fetch_one(&self.pool)
            .await?;

        if count <= self.config.entry_ceiling {
            return Ok(());
        }

        let expiry_secs = self.config.window.as_secs_f64() * 2.0;
        let expired = sqlx::query(
            "DELETE FROM rate_limit_entries WHERE window_start <= NOW() - make_interval(secs => $1)",
        )
        .bind(expiry_secs)
        .execute(&self.pool)
        .await?
        .rows_affected() as i64;

        let excess = eviction_excess(count - expired, self.config.entry_ceiling);
        if excess > 0 {
            sqlx::query(
                r#"
                DELETE FROM rate_limit_entries
                WHERE (subject_id, action) IN (
                    SELECT subject_id, action FROM rate_limit_entries
                    ORDER BY window_start ASC
                    LIMIT $1
                )
                "#,
            )
            .bind(excess)
            .execute(&self.pool)
            .await?;
        }

        tracing::debug!(
            entries_before = count,
            expired_removed = expired,
            oldest_removed = excess,
            "Evicted stale rate limit entries"
        );
        Ok(())
    }
}

/// How many entries must go oldest-first once expired rows are gone.
pub(crate) fn eviction_excess(remaining: i64, ceiling: i64) -> i64 {
    (remaining - ceiling).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: i32, window_secs: u64) -> RateLimitConfig {
        RateLimitConfig {
            max_attempts,
            window: Duration::from_secs(window_secs),
            entry_ceiling: 100,
            evict_check_interval: 64,
        }
    }

    #[test]
    fn test_attempts_within_budget_allowed() {
        let cfg = config(2, 30);
        let now = OffsetDateTime::now_utc();
        assert!(decide(1, now, now, &cfg).allowed);
        assert!(decide(2, now, now, &cfg).allowed);
    }

    #[test]
    fn test_attempt_over_budget_rejected_with_retry_hint() {
        let cfg = config(2, 30);
        let window_start = OffsetDateTime::now_utc();
        let now = window_start + Duration::from_secs(10);

        let result = decide(3, window_start, now, &cfg);
        assert!(!result.allowed, "N+1th attempt must be rejected");
        let retry = result.retry_after_seconds.unwrap();
        assert!(
            (19..=21).contains(&retry),
            "expected ~20s until window reset, got {}",
            retry
        );
    }

    #[test]
    fn test_retry_hint_never_zero() {
        let cfg = config(1, 30);
        let window_start = OffsetDateTime::now_utc();
        // Right at the window edge the hint still tells the caller to wait
        let now = window_start + Duration::from_secs(30);
        let result = decide(2, window_start, now, &cfg);
        assert_eq!(result.retry_after_seconds, Some(1));
    }

    #[test]
    fn test_n_plus_one_pattern() {
        // N allowed, one rejection: the counter increments on every call,
        // so counts 1..=N pass and N+1 fails.
        let cfg = config(5, 60);
        let now = OffsetDateTime::now_utc();
        let outcomes: Vec<bool> = (1..=6).map(|i| decide(i, now, now, &cfg).allowed).collect();
        assert_eq!(outcomes, vec![true, true, true, true, true, false]);
    }

    #[test]
    fn test_eviction_excess() {
        assert_eq!(eviction_excess(150, 100), 50);
        assert_eq!(eviction_excess(100, 100), 0);
        // Expired purge alone brought us under the ceiling
        assert_eq!(eviction_excess(40, 100), 0);
    }
}
