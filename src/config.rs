//! Engine configuration knobs.
//!
//! Every knob has a conservative default and a `PROMPTSTRIKE_*`
//! environment override so deployments can tune without code changes.

use std::time::Duration;

/// Tunable limits and defaults for the execution engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool size. `None` selects
    /// `min(available_parallelism * 4, per_target_concurrency * targets)`
    /// at spawn time.
    pub workers: Option<usize>,

    /// Maximum in-flight probes per (provider, model).
    pub per_target_concurrency: usize,

    /// Hard cap on a single provider request, independent of the job
    /// deadline.
    pub per_request_timeout: Duration,

    /// How long a leased job stays invisible before it is eligible for
    /// re-lease.
    pub lease_duration: Duration,

    /// Base delay for exponential retry backoff.
    pub retry_base: Duration,

    /// Ceiling for retry backoff.
    pub retry_cap: Duration,

    /// Default number of retries for transient failures.
    pub default_retry_budget: u32,

    /// Default per-job deadline when the campaign spec does not set one.
    pub default_job_deadline: Duration,

    /// Wall-clock budget for evaluating one detection tree against one
    /// response.
    pub detector_budget: Duration,

    /// Responses larger than this are truncated before storage.
    pub max_response_bytes: usize,

    /// Default requests-per-minute bucket size when a target does not
    /// override it.
    pub default_requests_per_minute: u32,

    /// Default tokens-per-minute bucket size when a target does not
    /// override it.
    pub default_tokens_per_minute: u64,

    /// Token estimate charged against the token bucket when a template
    /// carries no estimate of its own.
    pub default_token_estimate: u64,

    /// Interval at which governor waiters gain +1 effective priority.
    pub governor_aging_interval: Duration,

    /// Consecutive breaker-class failures before a provider circuit opens.
    pub breaker_failure_threshold: u32,

    /// Initial open-circuit cooldown; doubles on repeated half-open
    /// failures.
    pub breaker_cooldown: Duration,

    /// Ceiling for the breaker cooldown.
    pub breaker_cooldown_cap: Duration,

    /// Upper bound on variable-expansion bindings materialized per
    /// template per campaign.
    pub expansion_cap: usize,

    /// Capacity of the result broadcast channel.
    pub subscription_capacity: usize,

    /// Forced pulls per arm before the adaptive selector starts
    /// exploiting.
    pub cold_start_pulls: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: None,
            per_target_concurrency: env_or("PROMPTSTRIKE_TARGET_CONCURRENCY", 4),
            per_request_timeout: Duration::from_secs(env_or(
                "PROMPTSTRIKE_REQUEST_TIMEOUT_SECS",
                120,
            )),
            lease_duration: Duration::from_secs(env_or("PROMPTSTRIKE_LEASE_SECS", 60)),
            retry_base: Duration::from_millis(250),
            retry_cap: Duration::from_secs(30),
            default_retry_budget: env_or("PROMPTSTRIKE_RETRY_BUDGET", 3),
            default_job_deadline: Duration::from_secs(env_or(
                "PROMPTSTRIKE_JOB_DEADLINE_SECS",
                300,
            )),
            detector_budget: Duration::from_millis(env_or("PROMPTSTRIKE_DETECTOR_BUDGET_MS", 200)),
            max_response_bytes: env_or("PROMPTSTRIKE_MAX_RESPONSE_BYTES", 1024 * 1024),
            default_requests_per_minute: env_or("PROMPTSTRIKE_DEFAULT_RPM", 60),
            default_tokens_per_minute: env_or("PROMPTSTRIKE_DEFAULT_TPM", 100_000),
            default_token_estimate: env_or("PROMPTSTRIKE_TOKEN_ESTIMATE", 1_000),
            governor_aging_interval: Duration::from_secs(env_or(
                "PROMPTSTRIKE_AGING_INTERVAL_SECS",
                5,
            )),
            breaker_failure_threshold: env_or("PROMPTSTRIKE_BREAKER_THRESHOLD", 5),
            breaker_cooldown: Duration::from_secs(env_or("PROMPTSTRIKE_BREAKER_COOLDOWN_SECS", 10)),
            breaker_cooldown_cap: Duration::from_secs(300),
            expansion_cap: env_or("PROMPTSTRIKE_EXPANSION_CAP", 1_000),
            subscription_capacity: env_or("PROMPTSTRIKE_SUBSCRIPTION_CAPACITY", 4_096),
            cold_start_pulls: env_or("PROMPTSTRIKE_COLD_START_PULLS", 2),
        }
    }
}

impl EngineConfig {
    /// Resolves the worker pool size for the given number of targets.
    #[must_use]
    pub fn worker_count(&self, target_count: usize) -> usize {
        self.workers.unwrap_or_else(|| {
            let parallelism = std::thread::available_parallelism().map_or(4, std::num::NonZero::get);
            let by_cpu = parallelism * 4;
            let by_target = self.per_target_concurrency * target_count.max(1);
            by_cpu.min(by_target).max(1)
        })
    }
}

/// Parses an environment variable with a default value.
fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry_base, Duration::from_millis(250));
        assert_eq!(config.retry_cap, Duration::from_secs(30));
        assert_eq!(config.default_retry_budget, 3);
        assert_eq!(config.max_response_bytes, 1024 * 1024);
    }

    #[test]
    fn test_worker_count_explicit() {
        let config = EngineConfig {
            workers: Some(7),
            ..EngineConfig::default()
        };
        assert_eq!(config.worker_count(1), 7);
    }

    #[test]
    fn test_worker_count_bounded_by_targets() {
        let config = EngineConfig {
            workers: None,
            per_target_concurrency: 2,
            ..EngineConfig::default()
        };
        // One target: at most 2 workers regardless of CPU count.
        assert!(config.worker_count(1) <= 2);
        assert!(config.worker_count(1) >= 1);
    }
}
