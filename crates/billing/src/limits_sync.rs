//! Backend limits service sync client
//!
//! Pushes an organization's derived usage limits to the backend limits
//! service after a plan change or reconciliation. Retries are synchronous
//! backoff-sleep-retry within the calling request's lifetime; there is no
//! queue or worker. Only transient failures (5xx, timeouts, connection
//! errors) are retried; 4xx responses indicate a caller or configuration
//! defect and are never retried. A rate-limit response's retry hint
//! overrides the computed exponential delay when larger.

use std::time::Duration;

use serde::Serialize;
use tokio_retry::strategy::ExponentialBackoff;

use crate::error::{BillingError, BillingResult};

/// What triggered this push, carried in the payload for downstream
/// observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    PlanChange,
    Reconciliation,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::PlanChange => "plan_change",
            SyncType::Reconciliation => "reconciliation",
        }
    }
}

/// Limits payload for `PUT /v1/organizations/{slug}/limits`
#[derive(Debug, Clone, Serialize)]
pub struct LimitsPush {
    pub org_slug: String,
    pub plan_name: String,
    pub billing_status: String,
    /// Unix seconds, absent while not trialing
    pub trial_end: Option<i64>,
    pub pipeline_runs_per_day: i32,
    pub pipeline_runs_per_month: i32,
    pub seat_limit: i32,
    pub provider_limit: i32,
    pub concurrent_pipelines: i32,
    pub sync_type: SyncType,
}

/// Outcome of a limits push
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// True when retries were exhausted on a transient failure class; the
    /// caller may re-run reconciliation later to converge.
    pub queued: bool,
}

impl SyncOutcome {
    fn synced() -> Self {
        Self {
            success: true,
            error: None,
            queued: false,
        }
    }
}

/// How a single attempt failed
#[derive(Debug)]
enum PushFailure {
    /// Worth retrying: 5xx, timeout, connection failure, rate limit
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    /// Caller or configuration defect: never retried
    Terminal { message: String },
}

/// Sync client configuration
#[derive(Debug, Clone)]
pub struct LimitsSyncConfig {
    pub base_url: String,
    pub api_token: String,
    /// Total attempts, including the first
    pub max_attempts: usize,
    /// First-retry delay; doubles each attempt
    pub base_delay: Duration,
    /// Per-attempt delay cap
    pub max_delay: Duration,
    /// Per-attempt request timeout
    pub request_timeout: Duration,
}

impl LimitsSyncConfig {
    pub fn from_env() -> BillingResult<Self> {
        let base_url = std::env::var("LIMITS_SERVICE_URL")
            .map_err(|_| BillingError::Config("LIMITS_SERVICE_URL not set".to_string()))?;
        let api_token = std::env::var("LIMITS_SERVICE_TOKEN")
            .map_err(|_| BillingError::Config("LIMITS_SERVICE_TOKEN not set".to_string()))?;

        Ok(Self {
            base_url,
            api_token,
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            request_timeout: Duration::from_secs(10),
        })
    }
}

/// Retrying HTTP client for the backend limits service
#[derive(Clone)]
pub struct LimitsSyncClient {
    http: reqwest::Client,
    config: LimitsSyncConfig,
}

impl LimitsSyncClient {
    pub fn new(config: LimitsSyncConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(LimitsSyncConfig::from_env()?))
    }

    /// Push limits, retrying transient failures with bounded exponential
    /// backoff. Reports one of synced / failed / queued-for-retry.
    pub async fn push(&self, limits: &LimitsPush) -> SyncOutcome {
        // ExponentialBackoff yields factor * 2^n millis; with factor =
        // base_delay the sequence is base, 2*base, 4*base, ... capped.
        let mut delays = ExponentialBackoff::from_millis(2)
            .factor(self.config.base_delay.as_millis() as u64 / 2)
            .max_delay(self.config.max_delay);

        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            match self.attempt_push(limits).await {
                Ok(()) => {
                    tracing::info!(
                        org_slug = %limits.org_slug,
                        sync_type = limits.sync_type.as_str(),
                        attempt,
                        "Pushed limits to backend service"
                    );
                    return SyncOutcome::synced();
                }
                Err(PushFailure::Terminal { message }) => {
                    tracing::error!(
                        org_slug = %limits.org_slug,
                        sync_type = limits.sync_type.as_str(),
                        error = %message,
                        "Limits push failed terminally, not retrying"
                    );
                    return SyncOutcome {
                        success: false,
                        error: Some(message),
                        queued: false,
                    };
                }
                Err(PushFailure::Transient {
                    message,
                    retry_after,
                }) => {
                    tracing::warn!(
                        org_slug = %limits.org_slug,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        error = %message,
                        "Limits push attempt failed"
                    );
                    last_error = message;

                    if attempt < self.config.max_attempts {
                        let computed = delays.next().unwrap_or(self.config.max_delay);
                        tokio::time::sleep(effective_delay(computed, retry_after)).await;
                    }
                }
            }
        }

        tracing::error!(
            org_slug = %limits.org_slug,
            sync_type = limits.sync_type.as_str(),
            error = %last_error,
            "Limits push exhausted retries, queued for reconciliation"
        );
        SyncOutcome {
            success: false,
            error: Some(last_error),
            queued: true,
        }
    }

    async fn attempt_push(&self, limits: &LimitsPush) -> Result<(), PushFailure> {
        let url = format!(
            "{}/v1/organizations/{}/limits",
            self.config.base_url.trim_end_matches('/'),
            limits.org_slug
        );

        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.config.api_token)
            .timeout(self.config.request_timeout)
            .json(limits)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, &body))
    }
}

/// Map a reqwest-level failure: timeouts and connection errors are
/// transient, anything else (e.g. a malformed URL) is terminal.
fn classify_request_error(e: reqwest::Error) -> PushFailure {
    if e.is_timeout() || e.is_connect() {
        PushFailure::Transient {
            message: format!("request failed: {}", e),
            retry_after: None,
        }
    } else {
        PushFailure::Terminal {
            message: format!("request failed: {}", e),
        }
    }
}

/// Map an HTTP status: 5xx transient, 429 transient with hint, other 4xx
/// terminal.
fn classify_status(
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> PushFailure {
    let message = format!("limits service returned {}: {}", status, body);
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        PushFailure::Transient {
            message,
            retry_after,
        }
    } else {
        PushFailure::Terminal { message }
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// The rate-limit hint wins only when it is larger than the computed
/// exponential delay.
fn effective_delay(computed: Duration, retry_after: Option<Duration>) -> Duration {
    match retry_after {
        Some(hint) if hint > computed => hint,
        _ => computed,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_config(server_url: &str, max_attempts: usize) -> LimitsSyncConfig {
        LimitsSyncConfig {
            base_url: server_url.to_string(),
            api_token: "test-token".to_string(),
            max_attempts,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            request_timeout: Duration::from_secs(2),
        }
    }

    fn test_push() -> LimitsPush {
        LimitsPush {
            org_slug: "acme_co".to_string(),
            plan_name: "Team".to_string(),
            billing_status: "active".to_string(),
            trial_end: None,
            pipeline_runs_per_day: 500,
            pipeline_runs_per_month: 15000,
            seat_limit: 25,
            provider_limit: 10,
            concurrent_pipelines: 5,
            sync_type: SyncType::PlanChange,
        }
    }

    #[test]
    fn test_effective_delay_prefers_larger_hint() {
        let computed = Duration::from_millis(500);
        assert_eq!(
            effective_delay(computed, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            effective_delay(computed, Some(Duration::from_millis(100))),
            computed
        );
        assert_eq!(effective_delay(computed, None), computed);
    }

    #[test]
    fn test_classify_status() {
        let transient = classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, None, "boom");
        assert!(matches!(transient, PushFailure::Transient { .. }));

        let rate_limited = classify_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(5)),
            "slow down",
        );
        match rate_limited {
            PushFailure::Transient { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(5)));
            }
            other => panic!("429 must be transient, got {:?}", other),
        }

        let terminal = classify_status(reqwest::StatusCode::BAD_REQUEST, None, "bad payload");
        assert!(matches!(terminal, PushFailure::Terminal { .. }));
        let auth = classify_status(reqwest::StatusCode::UNAUTHORIZED, None, "no");
        assert!(matches!(auth, PushFailure::Terminal { .. }));
    }

    #[tokio::test]
    async fn test_push_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/v1/organizations/acme_co/limits")
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let client = LimitsSyncClient::new(test_config(&server.url(), 4));
        let outcome = client.push(&test_push()).await;

        assert!(outcome.success);
        assert!(!outcome.queued);
        assert!(outcome.error.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_4xx_never_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/v1/organizations/acme_co/limits")
            .with_status(422)
            .with_body("seat_limit missing")
            .expect(1)
            .create_async()
            .await;

        let client = LimitsSyncClient::new(test_config(&server.url(), 4));
        let outcome = client.push(&test_push()).await;

        assert!(!outcome.success);
        assert!(!outcome.queued, "validation failure is terminal, not queued");
        assert!(outcome.error.unwrap().contains("422"));
        // expect(1) verifies exactly one request reached the server
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_5xx_exhaustion_is_queued() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/v1/organizations/acme_co/limits")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let client = LimitsSyncClient::new(test_config(&server.url(), 3));
        let outcome = client.push(&test_push()).await;

        assert!(!outcome.success);
        assert!(outcome.queued, "transient exhaustion must report queued");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_honors_retry_after_hint() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/v1/organizations/acme_co/limits")
            .with_status(429)
            .with_header("retry-after", "1")
            .expect(2)
            .create_async()
            .await;

        let client = LimitsSyncClient::new(test_config(&server.url(), 2));
        let started = std::time::Instant::now();
        let outcome = client.push(&test_push()).await;

        assert!(!outcome.success);
        assert!(outcome.queued);
        // The computed delay is ~2ms; the 1s hint must have been honored
        assert!(
            started.elapsed() >= Duration::from_millis(900),
            "retry-after hint was not honored, elapsed {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_push_connection_failure_is_queued() {
        // Nothing is listening on this port
        let client = LimitsSyncClient::new(test_config("http://127.0.0.1:1", 2));
        let outcome = client.push(&test_push()).await;

        assert!(!outcome.success);
        assert!(outcome.queued, "connection failure is transient");
    }

    #[test]
    fn test_payload_shape() {
        let payload = serde_json::to_value(test_push()).unwrap();
        assert_eq!(payload["org_slug"], "acme_co");
        assert_eq!(payload["sync_type"], "plan_change");
        assert_eq!(payload["trial_end"], serde_json::Value::Null);
        assert_eq!(payload["pipeline_runs_per_month"], 15000);
    }
}
