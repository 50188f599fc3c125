//! Bucket algorithms. Each bucket is a small JSON document in the coordination store, replaced by
//! compare-and-swap so concurrent processes apply their updates one at a time.

use std::{collections::VecDeque, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use warden_model::{EpochMs, RateLimitDecision};

use crate::{
    error::{CoordinationError, CoordinationResult},
    store::{CoordinationStore, StoreError},
};

/// Lost compare-and-swap races tolerated before giving up on one request.
const MAX_CAS_ATTEMPTS: u32 = 16;
const CAS_BACKOFF_INITIAL: Duration = Duration::from_millis(1);
const CAS_BACKOFF_MAX: Duration = Duration::from_millis(32);

pub(super) fn token_key(base: &str) -> String {
    format!("{base}:tb")
}

pub(super) fn leaky_key(base: &str) -> String {
    format!("{base}:lb")
}

/// Continuously refilling bucket: `limit` tokens per `window_ms`, burst up to `limit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TokenBucket {
    tokens: f64,
    last_refill: EpochMs,
}

impl TokenBucket {
    pub(super) fn full(limit: u64, now: EpochMs) -> Self {
        Self {
            tokens: limit as f64,
            last_refill: now,
        }
    }

    fn refilled(&self, limit: u64, window_ms: u64, now: EpochMs) -> f64 {
        let elapsed = now.saturating_sub(self.last_refill) as f64;
        (self.tokens + elapsed * limit as f64 / window_ms as f64).min(limit as f64)
    }

    pub(super) fn check(&self, limit: u64, window_ms: u64, now: EpochMs) -> RateLimitDecision {
        let tokens = self.refilled(limit, window_ms, now);
        decide(tokens, tokens, limit, window_ms, now)
    }

    pub(super) fn consume(&mut self, limit: u64, window_ms: u64, now: EpochMs) -> RateLimitDecision {
        let tokens = self.refilled(limit, window_ms, now);
        self.tokens = tokens;
        self.last_refill = now;

        if tokens >= 1.0 {
            self.tokens -= 1.0;
        }
        decide(tokens, self.tokens, limit, window_ms, now)
    }
}

fn decide(before: f64, after: f64, limit: u64, window_ms: u64, now: EpochMs) -> RateLimitDecision {
    let ms_per_token = window_ms as f64 / limit as f64;
    let reset_at = now + ((limit as f64 - after) * ms_per_token).ceil() as u64;
    if before >= 1.0 {
        RateLimitDecision::allow(limit, after.floor() as u64, reset_at)
    } else {
        let wait = ((1.0 - before) * ms_per_token).ceil() as u64;
        RateLimitDecision::deny(limit, reset_at, wait)
    }
}

/// Queue of admissions draining at a constant `limit / window_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LeakyBucket {
    queue: VecDeque<EpochMs>,
    last_leak: EpochMs,
}

impl LeakyBucket {
    pub(super) fn empty(now: EpochMs) -> Self {
        Self {
            queue: VecDeque::new(),
            last_leak: now,
        }
    }

    /// Queue length and leak clock after draining up to `now`, without touching `self`.
    fn leaked(&self, limit: u64, window_ms: u64, now: EpochMs) -> (usize, EpochMs) {
        let ms_per_leak = window_ms as f64 / limit as f64;
        let elapsed = now.saturating_sub(self.last_leak) as f64;
        let drained = (elapsed / ms_per_leak).floor() as usize;

        let len = self.queue.len().saturating_sub(drained);
        let last_leak = if len == 0 {
            now
        } else {
            self.last_leak + (drained as f64 * ms_per_leak) as u64
        };
        (len, last_leak)
    }

    fn decide(
        len: usize,
        last_leak: EpochMs,
        admitted: bool,
        limit: u64,
        window_ms: u64,
        now: EpochMs,
    ) -> RateLimitDecision {
        let ms_per_leak = window_ms as f64 / limit as f64;
        let reset_at = last_leak + (len as f64 * ms_per_leak).ceil() as u64;
        if admitted {
            RateLimitDecision::allow(limit, limit.saturating_sub(len as u64), reset_at)
        } else {
            let next_leak = last_leak + ms_per_leak.ceil() as u64;
            RateLimitDecision::deny(limit, reset_at, next_leak.saturating_sub(now))
        }
    }

    pub(super) fn check(&self, limit: u64, window_ms: u64, now: EpochMs) -> RateLimitDecision {
        let (len, last_leak) = self.leaked(limit, window_ms, now);
        Self::decide(len, last_leak, (len as u64) < limit, limit, window_ms, now)
    }

    pub(super) fn consume(&mut self, limit: u64, window_ms: u64, now: EpochMs) -> RateLimitDecision {
        let (len, last_leak) = self.leaked(limit, window_ms, now);
        let drained = self.queue.len() - len;
        self.queue.drain(..drained);
        self.last_leak = last_leak;

        let admitted = (self.queue.len() as u64) < limit;
        if admitted {
            self.queue.push_back(now);
        }
        Self::decide(self.queue.len(), last_leak, admitted, limit, window_ms, now)
    }
}

pub(super) async fn token_check(
    store: &dyn CoordinationStore,
    base: &str,
    limit: u64,
    window_ms: u64,
    now: EpochMs,
) -> CoordinationResult<RateLimitDecision> {
    let bucket = load::<TokenBucket>(store, &token_key(base))
        .await?
        .map_or_else(|| TokenBucket::full(limit, now), |(_, b)| b);
    Ok(bucket.check(limit, window_ms, now))
}

pub(super) async fn token_consume(
    store: &dyn CoordinationStore,
    base: &str,
    limit: u64,
    window_ms: u64,
    now: EpochMs,
) -> CoordinationResult<RateLimitDecision> {
    update(
        store,
        &token_key(base),
        window_ms,
        || TokenBucket::full(limit, now),
        |b| b.consume(limit, window_ms, now),
    )
    .await
}

pub(super) async fn leaky_check(
    store: &dyn CoordinationStore,
    base: &str,
    limit: u64,
    window_ms: u64,
    now: EpochMs,
) -> CoordinationResult<RateLimitDecision> {
    let bucket = load::<LeakyBucket>(store, &leaky_key(base))
        .await?
        .map_or_else(|| LeakyBucket::empty(now), |(_, b)| b);
    Ok(bucket.check(limit, window_ms, now))
}

pub(super) async fn leaky_consume(
    store: &dyn CoordinationStore,
    base: &str,
    limit: u64,
    window_ms: u64,
    now: EpochMs,
) -> CoordinationResult<RateLimitDecision> {
    update(
        store,
        &leaky_key(base),
        window_ms,
        || LeakyBucket::empty(now),
        |b| b.consume(limit, window_ms, now),
    )
    .await
}

/// Stored bucket under `key` with its raw value, the compare-and-swap witness.
async fn load<B: DeserializeOwned>(
    store: &dyn CoordinationStore,
    key: &str,
) -> CoordinationResult<Option<(String, B)>> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };
    let bucket = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupted {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Some((raw, bucket)))
}

/// Read-modify-write of one bucket.
///
/// A bucket left alone for a whole window is back at its initial state (full or empty), so the key expires
/// after `window_ms` and a missing key is the same as a fresh bucket.
async fn update<B, I, F>(
    store: &dyn CoordinationStore,
    key: &str,
    window_ms: u64,
    init: I,
    mut apply: F,
) -> CoordinationResult<RateLimitDecision>
where
    B: Serialize + DeserializeOwned,
    I: Fn() -> B,
    F: FnMut(&mut B) -> RateLimitDecision,
{
    let ttl = Duration::from_millis(window_ms);
    let mut backoff = CAS_BACKOFF_INITIAL;
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let (mut bucket, witness) = match load::<B>(store, key).await? {
            Some((raw, bucket)) => (bucket, Some(raw)),
            None => (init(), None),
        };
        let decision = apply(&mut bucket);
        let next = serde_json::to_string(&bucket)?;

        let stored = match witness {
            Some(raw) => store.compare_and_swap(key, &raw, &next, Some(ttl)).await?,
            None => store.set_if_absent(key, &next, ttl).await?,
        };
        if stored {
            return Ok(decision);
        }
        if attempt < MAX_CAS_ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(CAS_BACKOFF_MAX);
        }
    }
    Err(CoordinationError::Contended {
        resource: key.to_string(),
        attempts: MAX_CAS_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        clock::ManualClock,
        store::{Command, MemoryStore, Reply, StoreResult},
    };

    #[test]
    fn token_bucket_bursts_then_refills_linearly() {
        let mut bucket = TokenBucket::full(10, 0);
        for i in 0..10 {
            let d = bucket.consume(10, 1_000, 0);
            assert!(d.allowed, "request {i} should pass");
            assert_eq!(d.remaining, 9 - i);
        }
        let denied = bucket.consume(10, 1_000, 0);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, Some(100));

        let admitted = (0..10).filter(|_| bucket.consume(10, 1_000, 500).allowed).count();
        assert_eq!(admitted, 5);
    }

    #[test]
    fn token_bucket_check_does_not_spend() {
        let bucket = TokenBucket::full(2, 0);
        assert!(bucket.check(2, 1_000, 0).allowed);
        assert!(bucket.check(2, 1_000, 0).allowed);
        assert_eq!(bucket.check(2, 1_000, 0).remaining, 2);
    }

    #[test]
    fn leaky_bucket_drains_at_constant_rate() {
        let mut bucket = LeakyBucket::empty(0);
        for _ in 0..4 {
            assert!(bucket.consume(4, 1_000, 0).allowed);
        }
        let denied = bucket.consume(4, 1_000, 0);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, Some(250));

        // one slot leaks every 250ms
        assert!(!bucket.check(4, 1_000, 249).allowed);
        assert!(bucket.consume(4, 1_000, 250).allowed);
        assert!(!bucket.consume(4, 1_000, 260).allowed);

        let d = bucket.consume(4, 1_000, 1_000);
        assert!(d.allowed);
        assert_eq!(d.remaining, 2);
    }

    #[tokio::test]
    async fn bucket_state_lives_in_store_for_one_window() {
        let store = MemoryStore::with_clock(Arc::new(ManualClock::new(0)));
        token_consume(&store, "rl:k", 3, 2_000, 0).await.unwrap();
        leaky_consume(&store, "rl:k", 3, 2_000, 0).await.unwrap();

        assert_eq!(store.ttl("rl:k:tb"), Some(Duration::from_millis(2_000)));
        assert_eq!(store.ttl("rl:k:lb"), Some(Duration::from_millis(2_000)));
        let raw = store.get("rl:k:tb").await.unwrap().unwrap();
        let stored: TokenBucket = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored, TokenBucket { tokens: 2.0, last_refill: 0 });
        assert!(raw.contains("lastRefill"));
    }

    /// Store whose compare-and-swap always loses to a concurrent writer.
    struct AlwaysRaced(MemoryStore);

    #[async_trait::async_trait]
    impl CoordinationStore for AlwaysRaced {
        async fn execute(&self, command: Command) -> StoreResult<Reply> {
            match command {
                Command::CompareAndSwap { .. } => Ok(Reply::Bool(false)),
                other => self.0.execute(other).await,
            }
        }

        async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
            self.0.pipeline(commands).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn endless_contention_fails_closed() {
        let store = AlwaysRaced(MemoryStore::new());
        assert!(token_consume(&store, "rl:k", 5, 1_000, 0).await.unwrap().allowed);

        let err = token_consume(&store, "rl:k", 5, 1_000, 0).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::Contended { ref resource, attempts: MAX_CAS_ATTEMPTS } if resource == "rl:k:tb"
        ));
    }

    #[tokio::test]
    async fn corrupted_bucket_is_a_store_error() {
        let store = MemoryStore::new();
        store.set("rl:k:tb", "not json", None).await.unwrap();

        let err = token_consume(&store, "rl:k", 3, 1_000, 0).await.unwrap_err();
        assert!(err.is_store_failure());
    }

    #[test]
    fn leaky_bucket_resets_clock_when_empty() {
        let mut bucket = LeakyBucket::empty(0);
        assert!(bucket.consume(2, 1_000, 0).allowed);
        // long idle: queue empties and the next admissions start a fresh drain
        assert!(bucket.consume(2, 1_000, 10_000).allowed);
        assert!(bucket.consume(2, 1_000, 10_000).allowed);
        assert!(!bucket.consume(2, 1_000, 10_000).allowed);
    }
}
