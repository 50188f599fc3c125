//! Deduplication of identical operations across processes.
//!
//! The first caller for a key writes a `pending` record with `set_if_absent` before running the operation and
//! replaces it with the outcome by compare-and-swap against that exact pending record. Later callers replay the
//! stored outcome, or, while it is still pending, are rejected or suspended until it settles.

use std::{future::Future, sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use warden_model::{DuplicateStrategy, IdempotencyRecord, RecordStatus, RequestId};

use crate::{
    clock::{Clock, ClockRef, system},
    error::{CoordinationError, CoordinationResult},
    store::{CoordinationStore, StoreError},
};

mod waiters;
use waiters::{Settlement, Waiters};

const DEFAULT_PREFIX: &str = "idem:";

#[derive(Debug, Clone)]
pub struct IdempotencyOptions {
    /// How long a record (pending or settled) lives in the store.
    pub ttl: Duration,
    pub strategy: DuplicateStrategy,
    /// Longest a `Queue` duplicate waits for the original to settle.
    pub queue_timeout: Duration,
    /// Store polling interval while waiting on another process's execution.
    pub poll_interval: Duration,
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            strategy: DuplicateStrategy::default(),
            queue_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl IdempotencyOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_strategy(mut self, strategy: DuplicateStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Result of [`IdempotencyGuard::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyOutcome<T> {
    /// The operation was not run by this call.
    pub is_duplicate: bool,
    /// The operation's value; `None` for a rejected in-flight duplicate.
    pub result: Option<T>,
    /// Request id of the execution that produced (or is producing) the result.
    pub request_id: RequestId,
    pub status: RecordStatus,
}

/// What a duplicate found when it waited.
enum Waited<T> {
    Settled(IdempotencyOutcome<T>),
    /// The pending record expired or was invalidated; the caller may execute itself.
    Vanished,
}

pub struct IdempotencyGuard {
    store: Arc<dyn CoordinationStore>,
    clock: ClockRef,
    prefix: String,
    waiters: Waiters,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            clock: system(),
            prefix: DEFAULT_PREFIX.to_string(),
            waiters: Waiters::default(),
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

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Run `op` at most once per `key` within the record TTL.
    ///
    /// A failed original is reported to every duplicate as `ExecutionFailure` until the record expires or is
    /// invalidated.
    #[instrument(level = "debug", skip(self, opts, op), fields(strategy = %opts.strategy))]
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &str,
        opts: &IdempotencyOptions,
        op: F,
    ) -> CoordinationResult<IdempotencyOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        E: std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let store_key = self.store_key(key);
        let mut op = Some(op);

        loop {
            match self.read(&store_key).await? {
                Some(record) => match record.status {
                    RecordStatus::Completed => return replay(record),
                    RecordStatus::Failed => return Err(failure(&record)),
                    RecordStatus::Pending => match opts.strategy {
                        DuplicateStrategy::Reject | DuplicateStrategy::ReturnCached => {
                            debug!(key, request_id = %record.request_id, "duplicate of in-flight request");
                            return Ok(IdempotencyOutcome {
                                is_duplicate: true,
                                result: None,
                                request_id: record.request_id,
                                status: RecordStatus::Pending,
                            });
                        }
                        DuplicateStrategy::Queue => match self.wait(key, opts).await? {
                            Waited::Settled(outcome) => return Ok(outcome),
                            Waited::Vanished => continue,
                        },
                    },
                },
                None => {
                    let pending = IdempotencyRecord::pending(
                        key,
                        self.clock.now_ms(),
                        opts.ttl.as_millis() as u64,
                    );
                    let pending_json = serde_json::to_string(&pending)?;
                    // Claim before registering as owner so a local duplicate never joins a claim we lost.
                    if !self
                        .store
                        .set_if_absent(&store_key, &pending_json, opts.ttl)
                        .await?
                    {
                        continue;
                    }
                    let Some(op) = op.take() else {
                        return Err(CoordinationError::InvalidArgument(format!(
                            "operation for '{key}' already consumed"
                        )));
                    };
                    return self
                        .run(key, &store_key, pending, pending_json, opts, op)
                        .await;
                }
            }
        }
    }

    async fn run<T, E, F, Fut>(
        &self,
        key: &str,
        store_key: &str,
        pending: IdempotencyRecord,
        pending_json: String,
        opts: &IdempotencyOptions,
        op: F,
    ) -> CoordinationResult<IdempotencyOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        E: std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let flight = self.waiters.own(key);
        debug!(key, request_id = %pending.request_id, "executing idempotent operation");

        let outcome = op().await;
        let (settled, settlement) = match &outcome {
            Ok(value) => {
                let value = serde_json::to_value(value)?;
                (
                    pending.completed(value.clone()),
                    Ok((pending.request_id.clone(), value)),
                )
            }
            Err(e) => {
                let reason = e.to_string();
                (pending.failed(reason.clone()), Err(reason))
            }
        };

        let settled_json = serde_json::to_string(&settled)?;
        match self
            .store
            .compare_and_swap(store_key, &pending_json, &settled_json, Some(opts.ttl))
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                key,
                request_id = %pending.request_id,
                "pending record expired or was replaced before the result was stored"
            ),
            Err(e) => warn!(key, error = %e, "failed to store idempotent result"),
        }

        let woken = flight.settle(settlement);
        if woken > 0 {
            debug!(key, waiters = woken, "resolved queued duplicates");
        }

        match outcome {
            Ok(value) => Ok(IdempotencyOutcome {
                is_duplicate: false,
                result: Some(value),
                request_id: pending.request_id,
                status: RecordStatus::Completed,
            }),
            Err(_) => Err(failure(&settled)),
        }
    }

    /// Suspend until the in-flight execution of `key` settles.
    async fn wait<T>(&self, key: &str, opts: &IdempotencyOptions) -> CoordinationResult<Waited<T>>
    where
        T: DeserializeOwned,
    {
        let deadline = Instant::now() + opts.queue_timeout;
        let timeout_err = || CoordinationError::Timeout {
            operation: format!("wait for in-flight '{key}'"),
            timeout_ms: opts.queue_timeout.as_millis() as u64,
        };

        if let Some(rx) = self.waiters.join(key) {
            debug!(key, "queued behind local execution");
            match tokio::time::timeout_at(deadline, rx).await {
                Err(_) => return Err(timeout_err()),
                Ok(Ok(settlement)) => return settled_outcome(key, settlement).map(Waited::Settled),
                // owner abandoned the execution; fall through to the store
                Ok(Err(_)) => {}
            }
        }

        let store_key = self.store_key(key);
        loop {
            match self.read(&store_key).await? {
                None => return Ok(Waited::Vanished),
                Some(record) => match record.status {
                    RecordStatus::Completed => return replay(record).map(Waited::Settled),
                    RecordStatus::Failed => return Err(failure(&record)),
                    RecordStatus::Pending => {}
                },
            }
            if Instant::now() >= deadline {
                return Err(timeout_err());
            }
            tokio::time::sleep_until(deadline.min(Instant::now() + opts.poll_interval)).await;
        }
    }

    /// Current record for `key`, if any.
    pub async fn check(&self, key: &str) -> CoordinationResult<Option<IdempotencyRecord>> {
        self.read(&self.store_key(key)).await
    }

    /// Forget `key` so the next call executes again. Returns whether a record existed.
    pub async fn invalidate(&self, key: &str) -> CoordinationResult<bool> {
        let removed = self.store.del(&self.store_key(key)).await?;
        debug!(key, removed, "idempotency record invalidated");
        Ok(removed)
    }

    /// Stable key for a request body: SHA-256 hex of its JSON encoding.
    pub fn fingerprint<S: Serialize + ?Sized>(value: &S) -> CoordinationResult<String> {
        let bytes = serde_json::to_vec(value)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }

    async fn read(&self, store_key: &str) -> CoordinationResult<Option<IdempotencyRecord>> {
        let Some(raw) = self.store.get(store_key).await? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupted {
            key: store_key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(record))
    }
}

fn replay<T: DeserializeOwned>(record: IdempotencyRecord) -> CoordinationResult<IdempotencyOutcome<T>> {
    let value = record.result.unwrap_or(Value::Null);
    Ok(IdempotencyOutcome {
        is_duplicate: true,
        result: Some(serde_json::from_value(value)?),
        request_id: record.request_id,
        status: RecordStatus::Completed,
    })
}

fn settled_outcome<T: DeserializeOwned>(
    key: &str,
    settlement: Settlement,
) -> CoordinationResult<IdempotencyOutcome<T>> {
    match settlement {
        Ok((request_id, value)) => Ok(IdempotencyOutcome {
            is_duplicate: true,
            result: Some(serde_json::from_value(value)?),
            request_id,
            status: RecordStatus::Completed,
        }),
        Err(reason) => Err(CoordinationError::ExecutionFailure {
            key: key.to_string(),
            reason,
        }),
    }
}

fn failure(record: &IdempotencyRecord) -> CoordinationError {
    CoordinationError::ExecutionFailure {
        key: record.key.clone(),
        reason: record.error.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde::Deserialize;

    use super::*;
    use crate::{clock::ManualClock, store::MemoryStore};

    fn guard(store: &MemoryStore) -> IdempotencyGuard {
        IdempotencyGuard::new(Arc::new(store.clone()))
    }

    fn queue() -> IdempotencyOptions {
        IdempotencyOptions::default()
            .with_strategy(DuplicateStrategy::Queue)
            .with_poll_interval(Duration::from_millis(10))
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Receipt {
        charge_id: String,
        amount: u64,
    }

    #[tokio::test]
    async fn completed_result_is_replayed() {
        let store = MemoryStore::new();
        let g = guard(&store);
        let calls = AtomicU32::new(0);
        let charge = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(Receipt {
                charge_id: "ch_1".into(),
                amount: 500,
            })
        };

        let first = g
            .execute("order-1", &IdempotencyOptions::default(), charge)
            .await
            .unwrap();
        assert!(!first.is_duplicate);
        assert_eq!(first.status, RecordStatus::Completed);

        let second = g
            .execute("order-1", &IdempotencyOptions::default(), charge)
            .await
            .unwrap();
        assert!(second.is_duplicate);
        assert_eq!(second.result, first.result);
        assert_eq!(second.request_id, first.request_id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queued_duplicates_share_one_execution() {
        let store = MemoryStore::new();
        let g = Arc::new(guard(&store));
        let calls = Arc::new(AtomicU32::new(0));
        let release = Arc::new(tokio::sync::Notify::new());

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let (g, calls, release) = (Arc::clone(&g), Arc::clone(&calls), Arc::clone(&release));
            tasks.push(tokio::spawn(async move {
                g.execute("pay-42", &queue(), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok::<_, String>(42u64)
                })
                .await
            }));
        }
        // let every caller reach the store before the original finishes
        while g.waiters.waiting("pay-42") < 4 {
            tokio::task::yield_now().await;
        }
        release.notify_one();

        let mut originals = 0;
        let mut request_ids = Vec::new();
        for t in tasks {
            let outcome = t.await.unwrap().unwrap();
            assert_eq!(outcome.result, Some(42));
            if !outcome.is_duplicate {
                originals += 1;
            }
            request_ids.push(outcome.request_id);
        }
        assert_eq!(originals, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        request_ids.dedup();
        assert_eq!(request_ids.len(), 1);
    }

    #[tokio::test]
    async fn queued_duplicates_receive_the_original_failure() {
        let store = MemoryStore::new();
        let g = Arc::new(guard(&store));
        let calls = Arc::new(AtomicU32::new(0));
        let release = Arc::new(tokio::sync::Notify::new());

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let (g, calls, release) = (Arc::clone(&g), Arc::clone(&calls), Arc::clone(&release));
            tasks.push(tokio::spawn(async move {
                g.execute("refund-7", &queue(), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Err::<u64, _>("gateway down")
                })
                .await
            }));
        }
        while g.waiters.waiting("refund-7") < 3 {
            tokio::task::yield_now().await;
        }
        release.notify_one();

        for t in tasks {
            let err = t.await.unwrap().unwrap_err();
            assert!(
                matches!(&err, CoordinationError::ExecutionFailure { key, reason }
                    if key == "refund-7" && reason == "gateway down"),
                "{err}"
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(g.check("refund-7").await.unwrap().unwrap().status, RecordStatus::Failed);
    }

    #[tokio::test]
    async fn reject_strategy_returns_marker_while_in_flight() {
        let store = MemoryStore::new();
        let g = guard(&store);
        store
            .set(
                "idem:k",
                &serde_json::to_string(&IdempotencyRecord::pending("k", 0, 60_000)).unwrap(),
                None,
            )
            .await
            .unwrap();

        for strategy in [DuplicateStrategy::Reject, DuplicateStrategy::ReturnCached] {
            let opts = IdempotencyOptions::default().with_strategy(strategy);
            let out = g
                .execute("k", &opts, || async { Ok::<_, String>(1u32) })
                .await
                .unwrap();
            assert!(out.is_duplicate);
            assert_eq!(out.result, None);
            assert_eq!(out.status, RecordStatus::Pending);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_duplicate_polls_other_process_record() {
        let store = MemoryStore::new();
        let g = guard(&store);
        let pending = IdempotencyRecord::pending("k", 0, 60_000);
        let pending_json = serde_json::to_string(&pending).unwrap();
        store.set("idem:k", &pending_json, None).await.unwrap();

        // another process settles the record a little later
        let other = store.clone();
        let done_json = serde_json::to_string(&pending.completed(Value::from("remote"))).unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            other
                .compare_and_swap("idem:k", &pending_json, &done_json, None)
                .await
                .unwrap();
        });

        let out = g
            .execute("k", &queue(), || async { Ok::<_, String>("local".to_string()) })
            .await
            .unwrap();
        assert!(out.is_duplicate);
        assert_eq!(out.result.as_deref(), Some("remote"));
        assert_eq!(out.request_id, pending.request_id);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_duplicate_times_out() {
        let store = MemoryStore::new();
        let g = guard(&store);
        let pending = IdempotencyRecord::pending("k", 0, 60_000);
        store
            .set("idem:k", &serde_json::to_string(&pending).unwrap(), None)
            .await
            .unwrap();

        let opts = queue().with_queue_timeout(Duration::from_millis(200));
        let err = g
            .execute("k", &opts, || async { Ok::<_, String>(0u8) })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Timeout { timeout_ms: 200, .. }));
    }

    #[tokio::test]
    async fn failure_is_recorded_and_reported_to_duplicates() {
        let store = MemoryStore::new();
        let g = guard(&store);

        let err = g
            .execute("k", &IdempotencyOptions::default(), || async {
                Err::<u32, _>("card declined")
            })
            .await
            .unwrap_err();
        assert!(matches!(&err, CoordinationError::ExecutionFailure { reason, .. } if reason == "card declined"));

        let record = g.check("k").await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);

        let err = g
            .execute("k", &IdempotencyOptions::default(), || async { Ok::<_, String>(1u32) })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::ExecutionFailure { .. }));
    }

    #[tokio::test]
    async fn invalidate_allows_re_execution() {
        let store = MemoryStore::new();
        let g = guard(&store);
        let opts = IdempotencyOptions::default();

        g.execute("k", &opts, || async { Ok::<_, String>(1u32) }).await.unwrap();
        assert!(g.invalidate("k").await.unwrap());
        assert!(!g.invalidate("k").await.unwrap());

        let again = g.execute("k", &opts, || async { Ok::<_, String>(2u32) }).await.unwrap();
        assert!(!again.is_duplicate);
        assert_eq!(again.result, Some(2));
    }

    #[tokio::test]
    async fn record_expires_after_ttl() {
        let clock = ManualClock::new(0);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let g = guard(&store).with_clock(Arc::new(clock.clone()));
        let opts = IdempotencyOptions::default().with_ttl(Duration::from_secs(60));

        g.execute("k", &opts, || async { Ok::<_, String>(1u32) }).await.unwrap();
        clock.advance(Duration::from_secs(59));
        assert!(g.execute("k", &opts, || async { Ok::<_, String>(2u32) }).await.unwrap().is_duplicate);

        clock.advance(Duration::from_secs(1));
        assert!(g.check("k").await.unwrap().is_none());
        let fresh = g.execute("k", &opts, || async { Ok::<_, String>(3u32) }).await.unwrap();
        assert_eq!(fresh.result, Some(3));
    }

    #[tokio::test]
    async fn store_outage_is_an_error() {
        let store = MemoryStore::new();
        let g = guard(&store);
        store.set_unavailable(true);

        let err = g
            .execute("k", &IdempotencyOptions::default(), || async { Ok::<_, String>(1u32) })
            .await
            .unwrap_err();
        assert!(err.is_store_failure());
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let a = IdempotencyGuard::fingerprint(&serde_json::json!({"amount": 5, "to": "bob"})).unwrap();
        let b = IdempotencyGuard::fingerprint(&serde_json::json!({"to": "bob", "amount": 5})).unwrap();
        let c = IdempotencyGuard::fingerprint(&serde_json::json!({"amount": 6, "to": "bob"})).unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
