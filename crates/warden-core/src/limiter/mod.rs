//! Request admission by key.
//!
//! Every algorithm keeps its state in the coordination store, so all processes sharing the store share one
//! budget per key. Store failures are returned as errors so callers fail closed.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use tracing::{debug, instrument};
use warden_model::{RateLimitAlgorithm, RateLimitDecision};

use crate::{
    clock::{Clock, ClockRef, system},
    error::{CoordinationError, CoordinationResult},
    store::{Command, CoordinationStore},
};

mod bucket;
mod window;

const DEFAULT_PREFIX: &str = "ratelimit:";

/// Limit definition: at most `limit` admissions per `window`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitOptions {
    pub limit: u64,
    pub window: Duration,
    pub algorithm: RateLimitAlgorithm,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(60),
            algorithm: RateLimitAlgorithm::default(),
        }
    }
}

impl RateLimitOptions {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            ..Self::default()
        }
    }

    pub fn with_algorithm(mut self, algorithm: RateLimitAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    fn validate(&self) -> CoordinationResult<()> {
        if self.limit == 0 {
            return Err(CoordinationError::InvalidArgument(
                "rate limit must be at least 1".into(),
            ));
        }
        if self.window_ms() == 0 {
            return Err(CoordinationError::InvalidArgument(
                "rate limit window must be at least 1ms".into(),
            ));
        }
        Ok(())
    }
}

pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
    clock: ClockRef,
    prefix: String,
    policies: RwLock<HashMap<String, RateLimitOptions>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            clock: system(),
            prefix: DEFAULT_PREFIX.to_string(),
            policies: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn base_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Would a request for `key` be admitted now? Never changes the budget.
    pub async fn check(
        &self,
        key: &str,
        opts: &RateLimitOptions,
    ) -> CoordinationResult<RateLimitDecision> {
        opts.validate()?;
        let now = self.clock.now_ms();
        let (limit, window_ms) = (opts.limit, opts.window_ms());
        let (store, base) = (self.store.as_ref(), self.base_key(key));

        let decision = match opts.algorithm {
            RateLimitAlgorithm::FixedWindow => {
                window::fixed_check(store, &base, limit, window_ms, now).await?
            }
            RateLimitAlgorithm::SlidingWindow => {
                window::sliding_check(store, &base, limit, window_ms, now).await?
            }
            RateLimitAlgorithm::TokenBucket => {
                bucket::token_check(store, &base, limit, window_ms, now).await?
            }
            RateLimitAlgorithm::LeakyBucket => {
                bucket::leaky_check(store, &base, limit, window_ms, now).await?
            }
        };
        Ok(decision)
    }

    /// Check and, if admitted, count the request against `key`'s budget.
    #[instrument(level = "debug", skip(self, opts), fields(algorithm = %opts.algorithm, limit = opts.limit))]
    pub async fn consume(
        &self,
        key: &str,
        opts: &RateLimitOptions,
    ) -> CoordinationResult<RateLimitDecision> {
        opts.validate()?;
        let now = self.clock.now_ms();
        let (limit, window_ms) = (opts.limit, opts.window_ms());
        let (store, base) = (self.store.as_ref(), self.base_key(key));

        let decision = match opts.algorithm {
            RateLimitAlgorithm::FixedWindow => {
                window::fixed_consume(store, &base, limit, window_ms, now).await?
            }
            RateLimitAlgorithm::SlidingWindow => {
                window::sliding_consume(store, &base, limit, window_ms, now).await?
            }
            RateLimitAlgorithm::TokenBucket => {
                bucket::token_consume(store, &base, limit, window_ms, now).await?
            }
            RateLimitAlgorithm::LeakyBucket => {
                bucket::leaky_consume(store, &base, limit, window_ms, now).await?
            }
        };

        if decision.allowed {
            debug!(remaining = decision.remaining, "request admitted");
        } else {
            debug!(
                retry_after_ms = decision.retry_after_ms,
                reset_at = decision.reset_at,
                "request rate limited"
            );
        }
        Ok(decision)
    }

    /// Forget all state for `key` under every algorithm, whichever process created it.
    pub async fn reset(&self, key: &str) -> CoordinationResult<()> {
        let base = self.base_key(key);

        let mut keys = window::fixed_counters(self.store.as_ref(), &base).await?;
        keys.extend([
            window::fixed_index_key(&base),
            window::sliding_key(&base),
            bucket::token_key(&base),
            bucket::leaky_key(&base),
        ]);
        self.store
            .pipeline(keys.into_iter().map(|key| Command::Del { key }).collect())
            .await?;
        debug!(key, "rate limit state reset");
        Ok(())
    }

    /// Register (or replace) a named limit.
    pub fn register_policy(
        &self,
        name: impl Into<String>,
        opts: RateLimitOptions,
    ) -> CoordinationResult<()> {
        opts.validate()?;
        let name = name.into();
        debug!(policy = %name, limit = opts.limit, algorithm = %opts.algorithm, "rate limit policy registered");
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, opts);
        Ok(())
    }

    pub fn policy(&self, name: &str) -> Option<RateLimitOptions> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub async fn check_policy(&self, policy: &str, key: &str) -> CoordinationResult<RateLimitDecision> {
        let opts = self.require_policy(policy)?;
        self.check(&policy_key(policy, key), &opts).await
    }

    pub async fn consume_policy(
        &self,
        policy: &str,
        key: &str,
    ) -> CoordinationResult<RateLimitDecision> {
        let opts = self.require_policy(policy)?;
        self.consume(&policy_key(policy, key), &opts).await
    }

    fn require_policy(&self, name: &str) -> CoordinationResult<RateLimitOptions> {
        self.policy(name)
            .ok_or_else(|| CoordinationError::not_found("rate limit policy", name))
    }
}

/// Policies get their own budget even when callers reuse the same key.
fn policy_key(policy: &str, key: &str) -> String {
    format!("{policy}:{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, store::MemoryStore};

    fn limiter(start_ms: u64) -> (RateLimiter, MemoryStore, ManualClock) {
        let clock = ManualClock::new(start_ms);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let limiter = RateLimiter::new(Arc::new(store.clone())).with_clock(Arc::new(clock.clone()));
        (limiter, store, clock)
    }

    fn opts(limit: u64, window_ms: u64, algorithm: RateLimitAlgorithm) -> RateLimitOptions {
        RateLimitOptions::new(limit, Duration::from_millis(window_ms)).with_algorithm(algorithm)
    }

    #[tokio::test]
    async fn fixed_window_admits_limit_then_rejects_until_next_window() {
        let (rl, _, clock) = limiter(10_000);
        let o = opts(5, 1_000, RateLimitAlgorithm::FixedWindow);

        for expected_remaining in (0..5).rev() {
            let d = rl.consume("api", &o).await.unwrap();
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }
        clock.advance_ms(300);
        let denied = rl.consume("api", &o).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, 11_000);
        assert_eq!(denied.retry_after_ms, Some(700));

        clock.advance_ms(700);
        assert!(rl.consume("api", &o).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn fixed_window_remaining_never_increases_within_window() {
        let (rl, _, clock) = limiter(0);
        let o = opts(3, 10_000, RateLimitAlgorithm::FixedWindow);

        let mut last = u64::MAX;
        for _ in 0..6 {
            let d = rl.consume("k", &o).await.unwrap();
            assert!(d.remaining <= last);
            last = d.remaining;
            clock.advance_ms(100);
        }
    }

    #[tokio::test]
    async fn check_never_spends_budget() {
        for alg in RateLimitAlgorithm::ALL {
            let (rl, store, _) = limiter(1_000);
            let o = opts(1, 1_000, alg);
            let writes = store.write_count();

            for _ in 0..3 {
                assert!(rl.check("k", &o).await.unwrap().allowed, "{alg}");
            }
            assert_eq!(store.write_count(), writes, "{alg}");
            assert!(rl.consume("k", &o).await.unwrap().allowed, "{alg}");
            assert!(!rl.check("k", &o).await.unwrap().allowed, "{alg}");
        }
    }

    #[tokio::test]
    async fn sliding_window_is_exact_across_boundaries() {
        let (rl, _, clock) = limiter(10_900);
        let o = opts(2, 1_000, RateLimitAlgorithm::SlidingWindow);

        assert!(rl.consume("k", &o).await.unwrap().allowed);
        assert!(rl.consume("k", &o).await.unwrap().allowed);
        // a fixed window would reset at 11_000
        clock.advance_ms(200);
        let denied = rl.consume("k", &o).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, Some(800));

        clock.advance_ms(800);
        let d = rl.consume("k", &o).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
    }

    #[tokio::test]
    async fn sliding_window_is_shared_between_limiters() {
        let (a, store, clock) = limiter(0);
        let b = RateLimiter::new(Arc::new(store.clone())).with_clock(Arc::new(clock.clone()));
        let o = opts(3, 1_000, RateLimitAlgorithm::SlidingWindow);

        assert!(a.consume("shared", &o).await.unwrap().allowed);
        assert!(b.consume("shared", &o).await.unwrap().allowed);
        assert!(a.consume("shared", &o).await.unwrap().allowed);
        assert!(!b.consume("shared", &o).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn every_algorithm_is_shared_between_limiters() {
        for alg in RateLimitAlgorithm::ALL {
            let (a, store, clock) = limiter(0);
            let b = RateLimiter::new(Arc::new(store.clone())).with_clock(Arc::new(clock.clone()));
            let o = opts(1, 60_000, alg);

            assert!(a.consume("user", &o).await.unwrap().allowed, "{alg}");
            assert!(!b.check("user", &o).await.unwrap().allowed, "{alg}");
            assert!(!b.consume("user", &o).await.unwrap().allowed, "{alg}");
        }
    }

    #[tokio::test]
    async fn token_bucket_refill_is_seen_by_other_limiter() {
        let (a, store, clock) = limiter(0);
        let b = RateLimiter::new(Arc::new(store.clone())).with_clock(Arc::new(clock.clone()));
        let o = opts(4, 1_000, RateLimitAlgorithm::TokenBucket);

        for _ in 0..2 {
            assert!(a.consume("k", &o).await.unwrap().allowed);
            assert!(b.consume("k", &o).await.unwrap().allowed);
        }
        assert!(!a.consume("k", &o).await.unwrap().allowed);

        clock.advance_ms(250);
        assert!(b.consume("k", &o).await.unwrap().allowed);
        assert!(!a.consume("k", &o).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn leaky_bucket_is_shared_between_limiters() {
        let (a, store, clock) = limiter(0);
        let b = RateLimiter::new(Arc::new(store.clone())).with_clock(Arc::new(clock.clone()));
        let o = opts(2, 1_000, RateLimitAlgorithm::LeakyBucket);

        assert!(a.consume("k", &o).await.unwrap().allowed);
        assert!(b.consume("k", &o).await.unwrap().allowed);
        let denied = a.consume("k", &o).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, Some(500));

        clock.advance_ms(500);
        assert!(a.consume("k", &o).await.unwrap().allowed);
        assert!(!b.consume("k", &o).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn reset_from_another_limiter_clears_shared_state() {
        let (a, store, clock) = limiter(5_000);
        for alg in RateLimitAlgorithm::ALL {
            assert!(a.consume("user", &opts(1, 60_000, alg)).await.unwrap().allowed, "{alg}");
        }

        // a fresh instance has never seen this key
        let ops = RateLimiter::new(Arc::new(store.clone())).with_clock(Arc::new(clock.clone()));
        ops.reset("user").await.unwrap();

        assert!(store.is_empty());
        for alg in RateLimitAlgorithm::ALL {
            assert!(a.consume("user", &opts(1, 60_000, alg)).await.unwrap().allowed, "{alg}");
        }
    }

    #[tokio::test]
    async fn reset_covers_every_window_size_used() {
        let (rl, store, _) = limiter(0);
        for window_ms in [1_000, 60_000] {
            let o = opts(1, window_ms, RateLimitAlgorithm::FixedWindow);
            assert!(rl.consume("k", &o).await.unwrap().allowed);
        }

        RateLimiter::new(Arc::new(store.clone())).reset("k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn token_bucket_burst_then_refill() {
        let (rl, _, clock) = limiter(0);
        let o = opts(10, 1_000, RateLimitAlgorithm::TokenBucket);

        for _ in 0..10 {
            assert!(rl.consume("burst", &o).await.unwrap().allowed);
        }
        assert!(!rl.consume("burst", &o).await.unwrap().allowed);

        clock.advance_ms(500);
        let mut admitted = 0;
        for _ in 0..10 {
            if rl.consume("burst", &o).await.unwrap().allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn leaky_bucket_smooths_bursts() {
        let (rl, _, clock) = limiter(0);
        let o = opts(2, 1_000, RateLimitAlgorithm::LeakyBucket);

        assert!(rl.consume("k", &o).await.unwrap().allowed);
        assert!(rl.consume("k", &o).await.unwrap().allowed);
        let denied = rl.consume("k", &o).await.unwrap();
        assert_eq!(denied.retry_after_ms, Some(500));

        clock.advance_ms(500);
        assert!(rl.consume("k", &o).await.unwrap().allowed);
        assert!(!rl.consume("k", &o).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn reset_clears_every_algorithm() {
        let (rl, store, _) = limiter(5_000);
        for alg in RateLimitAlgorithm::ALL {
            let o = opts(1, 60_000, alg);
            assert!(rl.consume("user-1", &o).await.unwrap().allowed);
            assert!(!rl.consume("user-1", &o).await.unwrap().allowed);
        }

        rl.reset("user-1").await.unwrap();
        assert!(store.is_empty());
        for alg in RateLimitAlgorithm::ALL {
            let o = opts(1, 60_000, alg);
            assert!(rl.consume("user-1", &o).await.unwrap().allowed, "{alg}");
        }
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let (rl, store, _) = limiter(0);
        store.set_unavailable(true);

        for alg in RateLimitAlgorithm::ALL {
            let err = rl.consume("k", &opts(5, 1_000, alg)).await.unwrap_err();
            assert!(err.is_store_failure(), "{alg}");
            let err = rl.check("k", &opts(5, 1_000, alg)).await.unwrap_err();
            assert!(err.is_store_failure(), "{alg}");
        }
    }

    #[tokio::test]
    async fn policies_are_looked_up_by_name() {
        let (rl, _, _) = limiter(0);
        rl.register_policy("login", opts(1, 60_000, RateLimitAlgorithm::FixedWindow))
            .unwrap();

        assert!(rl.consume_policy("login", "alice").await.unwrap().allowed);
        assert!(!rl.consume_policy("login", "alice").await.unwrap().allowed);
        assert!(rl.check_policy("login", "bob").await.unwrap().allowed);
        // same caller key, separate budget
        assert!(
            rl.consume("alice", &opts(1, 60_000, RateLimitAlgorithm::FixedWindow))
                .await
                .unwrap()
                .allowed
        );

        let err = rl.consume_policy("signup", "alice").await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotFound { kind: "rate limit policy", .. }));
    }

    #[tokio::test]
    async fn zero_limit_is_rejected() {
        let (rl, _, _) = limiter(0);
        let err = rl
            .consume("k", &opts(0, 1_000, RateLimitAlgorithm::FixedWindow))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidArgument(_)));
        assert!(rl.register_policy("p", opts(1, 0, RateLimitAlgorithm::TokenBucket)).is_err());
    }
}
