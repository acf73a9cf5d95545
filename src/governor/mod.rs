//! Rate governor.
//!
//! Per (provider, model, credential): two independent token buckets,
//! requests-per-minute and tokens-per-minute. Acquiring deducts one
//! request plus an estimated token count; the estimate is reconciled
//! once the provider reports actual usage.
//!
//! Waiters form a queue per bucket pair. Higher-priority jobs jump the
//! queue, but a background aging rule boosts every waiter by +1
//! effective priority per interval so nothing starves.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::trace;

use crate::config::EngineConfig;
use crate::observability::metrics;

// ============================================================================
// Keys and Limits
// ============================================================================

/// Identity of one bucket pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    /// Provider id
    pub provider: String,
    /// Model id
    pub model: String,
    /// Credential label, when multiple credentials fan out to the same
    /// provider
    pub credential: Option<String>,
}

impl RateKey {
    /// Key without a credential dimension.
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            credential: None,
        }
    }
}

/// Bucket sizes for one key.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    /// Requests admitted per minute
    pub requests_per_minute: u32,
    /// Tokens admitted per minute
    pub tokens_per_minute: u64,
}

// ============================================================================
// Token Bucket
// ============================================================================

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    level: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn per_minute(limit: f64) -> Self {
        Self {
            capacity: limit,
            level: limit,
            refill_per_sec: limit / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.level = (self.level + elapsed * self.refill_per_sec).min(self.capacity);
    }

    fn try_take(&mut self, amount: f64) -> bool {
        if self.level >= amount {
            self.level -= amount;
            true
        } else {
            false
        }
    }

    /// Seconds until `amount` will be available at the current level.
    fn time_until(&self, amount: f64) -> Duration {
        if self.level >= amount {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((amount - self.level) / self.refill_per_sec)
        }
    }

    /// Returns unused estimate to the bucket or charges an overdraft.
    /// The level may go negative after a debit; the floor bounds how
    /// far one reconciliation can push future waiters out.
    fn adjust(&mut self, delta: f64) {
        self.level = (self.level + delta).clamp(-self.capacity, self.capacity);
    }
}

// ============================================================================
// Waiters
// ============================================================================

#[derive(Debug)]
struct Waiter {
    id: u64,
    priority: i32,
    enqueued: Instant,
}

#[derive(Debug)]
struct PairState {
    requests: TokenBucket,
    tokens: TokenBucket,
    waiters: Vec<Waiter>,
}

#[derive(Debug)]
struct BucketPair {
    state: Mutex<PairState>,
    notify: Notify,
}

/// Outcome of a failed acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate governor wait exceeded the job deadline")]
pub struct AcquireTimeout;

// ============================================================================
// Governor
// ============================================================================

/// Token-bucket rate governor with fair, aging waiters.
pub struct RateGovernor {
    buckets: DashMap<RateKey, Arc<BucketPair>>,
    limits: DashMap<RateKey, RateLimits>,
    defaults: RateLimits,
    aging_interval: Duration,
    next_waiter_id: AtomicU64,
}

impl RateGovernor {
    /// Creates a governor with default limits from the engine config.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            limits: DashMap::new(),
            defaults: RateLimits {
                requests_per_minute: config.default_requests_per_minute,
                tokens_per_minute: config.default_tokens_per_minute,
            },
            aging_interval: config.governor_aging_interval,
            next_waiter_id: AtomicU64::new(0),
        }
    }

    /// Overrides the limits for one key. Takes effect when the bucket
    /// pair is first created; keys already admitted keep their buckets.
    pub fn configure(&self, key: RateKey, limits: RateLimits) {
        self.limits.insert(key, limits);
    }

    fn pair(&self, key: &RateKey) -> Arc<BucketPair> {
        if let Some(existing) = self.buckets.get(key) {
            return Arc::clone(&existing);
        }
        let limits = self
            .limits
            .get(key)
            .map_or(self.defaults, |entry| *entry.value());
        let pair = Arc::new(BucketPair {
            state: Mutex::new(PairState {
                requests: TokenBucket::per_minute(f64::from(limits.requests_per_minute)),
                #[allow(clippy::cast_precision_loss)]
                tokens: TokenBucket::per_minute(limits.tokens_per_minute as f64),
                waiters: Vec::new(),
            }),
            notify: Notify::new(),
        });
        self.buckets
            .entry(key.clone())
            .or_insert(pair)
            .value()
            .clone()
    }

    /// Acquires one request plus `token_estimate` tokens, waiting for
    /// refill when a bucket cannot satisfy the acquisition.
    ///
    /// Returns the time spent waiting.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireTimeout`] when the deadline passes first.
    pub async fn acquire(
        &self,
        key: &RateKey,
        priority: i32,
        token_estimate: u64,
        deadline: Instant,
    ) -> Result<Duration, AcquireTimeout> {
        let pair = self.pair(key);
        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        #[allow(clippy::cast_precision_loss)]
        let estimate = token_estimate as f64;

        {
            let mut state = pair
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.waiters.push(Waiter {
                id: waiter_id,
                priority,
                enqueued: started,
            });
        }
        let guard = WaiterGuard {
            pair: Arc::clone(&pair),
            waiter_id,
        };

        loop {
            let wait_step = {
                let mut state = pair
                    .state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state.requests.refill();
                state.tokens.refill();

                if self.is_head(&state.waiters, waiter_id)
                    && state.requests.level >= 1.0
                    && state.tokens.level >= estimate
                {
                    let took_request = state.requests.try_take(1.0);
                    let took_tokens = state.tokens.try_take(estimate);
                    debug_assert!(took_request && took_tokens);
                    state.waiters.retain(|w| w.id != waiter_id);
                    drop(state);
                    drop(guard);
                    pair.notify.notify_waiters();

                    let waited = started.elapsed();
                    if waited > Duration::from_millis(1) {
                        metrics::record_governor_wait(&key.provider, waited);
                    }
                    trace!(provider = %key.provider, model = %key.model, waited_ms = waited.as_millis() as u64, "governor acquired");
                    return Ok(waited);
                }

                // Wait for refill, a wakeup, or an aging tick, whichever
                // comes first.
                let until_ready = state
                    .requests
                    .time_until(1.0)
                    .max(state.tokens.time_until(estimate));
                until_ready
                    .max(Duration::from_millis(10))
                    .min(self.aging_interval)
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(AcquireTimeout);
            }
            let step = wait_step.min(deadline - now);

            tokio::select! {
                () = pair.notify.notified() => {}
                () = tokio::time::sleep(step) => {}
            }

            if Instant::now() >= deadline {
                return Err(AcquireTimeout);
            }
        }
    }

    /// Reconciles an estimate with the actual token usage reported by
    /// the provider.
    pub fn reconcile(&self, key: &RateKey, token_estimate: u64, actual: u64) {
        if token_estimate == actual {
            return;
        }
        let pair = self.pair(key);
        let mut state = pair
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        #[allow(clippy::cast_precision_loss)]
        let delta = token_estimate as f64 - actual as f64;
        state.tokens.adjust(delta);
        drop(state);
        if token_estimate > actual {
            // Credit returned capacity; a waiter may now fit.
            pair.notify.notify_waiters();
        }
    }

    /// Whether `waiter_id` has the best claim: highest effective
    /// priority (base + age boost), FIFO within ties.
    fn is_head(&self, waiters: &[Waiter], waiter_id: u64) -> bool {
        let effective = |w: &Waiter| {
            let boost = i32::try_from(
                w.enqueued.elapsed().as_millis() / self.aging_interval.as_millis().max(1),
            )
            .unwrap_or(i32::MAX);
            i64::from(w.priority.saturating_add(boost))
        };
        let Some(head) = waiters
            .iter()
            .max_by(|a, b| {
                effective(a)
                    .cmp(&effective(b))
                    .then_with(|| b.enqueued.cmp(&a.enqueued))
            })
        else {
            return false;
        };
        head.id == waiter_id
    }
}

/// Removes the waiter on drop so a cancelled acquisition never wedges
/// the queue head.
struct WaiterGuard {
    pair: Arc<BucketPair>,
    waiter_id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut state = self
            .pair
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.waiters.retain(|w| w.id != self.waiter_id);
        drop(state);
        self.pair.notify.notify_waiters();
    }
}
