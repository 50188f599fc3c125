//! Distributed mutual exclusion keyed by name.
//!
//! Acquisition is a single `set_if_absent` of `"{owner_id}:{token}"` with the hold TTL. Release and extension
//! are owner-guarded compare-and-delete / compare-and-expire, so a handle whose lock expired and was taken by
//! someone else can never remove or prolong the new holder's lock. Reentrancy is tracked locally and costs no
//! store round trip.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use warden_model::LockInfo;

use crate::{
    clock::{Clock, ClockRef, system},
    error::CoordinationResult,
    store::CoordinationStore,
    system::process_owner_id,
};

mod handle;
pub use handle::Lock;
use handle::extend_in;

const DEFAULT_PREFIX: &str = "lock:";

/// Per-call acquisition options.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lock TTL in the store.
    pub hold_timeout: Duration,
    /// How long `acquire` keeps polling before giving up.
    pub acquire_timeout: Duration,
    /// Delay between polls.
    pub retry_interval: Duration,
    /// Re-acquiring a lock this process already holds bumps the reentry count instead of blocking.
    pub reentrant: bool,
    /// Keep extending the TTL in the background while held.
    pub auto_renew: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            hold_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(100),
            reentrant: false,
            auto_renew: false,
        }
    }
}

impl LockOptions {
    pub fn with_hold_timeout(mut self, ttl: Duration) -> Self {
        self.hold_timeout = ttl;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn reentrant(mut self, reentrant: bool) -> Self {
        self.reentrant = reentrant;
        self
    }

    pub fn auto_renew(mut self, auto_renew: bool) -> Self {
        self.auto_renew = auto_renew;
        self
    }
}

/// Lock manager for one process (one owner id).
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
    clock: ClockRef,
    owner_id: String,
    prefix: String,
    held: Mutex<HashMap<String, Lock>>,
    /// Parent of every renewal task; cancelled on shutdown and drop.
    renewals: CancellationToken,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            clock: system(),
            owner_id: process_owner_id().to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            held: Mutex::new(HashMap::new()),
            renewals: CancellationToken::new(),
        }
    }

    /// Override the owner id (one manager per simulated process in tests).
    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Acquire `name`, polling every `retry_interval` until `acquire_timeout`.
    ///
    /// Returns `Ok(None)` on timeout; only store failures are errors.
    #[instrument(level = "debug", skip(self, opts), fields(owner = %self.owner_id))]
    pub async fn acquire(&self, name: &str, opts: &LockOptions) -> CoordinationResult<Option<Lock>> {
        if opts.reentrant
            && let Some(lock) = self.local(name)
        {
            let depth = lock.enter_reentry();
            debug!(lock = name, reentry_count = depth, "reentrant acquire");
            return Ok(Some(lock));
        }

        let deadline = Instant::now() + opts.acquire_timeout;
        loop {
            if let Some(lock) = self.attempt(name, opts).await? {
                return Ok(Some(lock));
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    lock = name,
                    timeout_ms = opts.acquire_timeout.as_millis() as u64,
                    "lock acquire timed out"
                );
                return Ok(None);
            }
            tokio::time::sleep(opts.retry_interval.min(deadline - now)).await;
        }
    }

    /// Single non-blocking attempt with the given TTL.
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> CoordinationResult<Option<Lock>> {
        let opts = LockOptions::default().with_hold_timeout(ttl);
        self.attempt(name, &opts).await
    }

    async fn attempt(&self, name: &str, opts: &LockOptions) -> CoordinationResult<Option<Lock>> {
        let key = self.key(name);
        let lock = Lock::new(
            name,
            key.clone(),
            &self.owner_id,
            opts.hold_timeout,
            Arc::clone(&self.clock),
        );

        let acquired = self
            .store
            .set_if_absent(&key, &lock.inner.value, opts.hold_timeout)
            .await?;
        if !acquired {
            return Ok(None);
        }

        if opts.auto_renew {
            lock.start_renew(Arc::clone(&self.store), &self.renewals);
        }
        let replaced = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), lock.clone());
        if let Some(stale) = replaced {
            stale.stop_renew();
        }

        debug!(
            lock = name,
            token = %lock.token(),
            ttl_ms = opts.hold_timeout.as_millis() as u64,
            auto_renew = opts.auto_renew,
            "lock acquired"
        );
        Ok(Some(lock))
    }

    /// Release one hold on `lock`.
    ///
    /// Reentrant holds are dropped locally. The last hold performs an owner-guarded delete; `Ok(false)` means the
    /// store no longer held this acquisition (expired, lost or already released).
    pub async fn release(&self, lock: &Lock) -> CoordinationResult<bool> {
        if lock.is_released() {
            return Ok(false);
        }
        if lock.leave_reentry() {
            debug!(lock = %lock.name(), reentry_count = lock.reentry_count(), "reentrant release");
            return Ok(true);
        }

        let deleted = self
            .store
            .compare_and_delete(&lock.inner.key, &lock.inner.value)
            .await?;
        lock.mark_released();
        self.forget(lock);

        if deleted {
            debug!(lock = %lock.name(), "lock released");
        } else {
            warn!(lock = %lock.name(), "lock release rejected: not held by this owner");
        }
        Ok(deleted)
    }

    /// Owner-guarded TTL update; `Ok(false)` if this acquisition no longer holds the lock.
    pub async fn extend(&self, lock: &Lock, ttl: Duration) -> CoordinationResult<bool> {
        let ok = extend_in(self.store.as_ref(), lock, ttl).await?;
        if ok {
            debug!(lock = %lock.name(), ttl_ms = ttl.as_millis() as u64, "lock extended");
        } else {
            warn!(lock = %lock.name(), "lock extend rejected: not held by this owner");
        }
        Ok(ok)
    }

    /// Run `f` while holding `name`. Returns `Ok(None)` when the lock could not be acquired.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        opts: &LockOptions,
        f: F,
    ) -> CoordinationResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(lock) = self.acquire(name, opts).await? else {
            return Ok(None);
        };
        let out = f().await;
        if let Err(e) = self.release(&lock).await {
            warn!(lock = name, error = %e, "release after critical section failed; lock will expire via TTL");
        }
        Ok(Some(out))
    }

    /// Whether anyone currently holds `name` in the store.
    pub async fn is_locked(&self, name: &str) -> CoordinationResult<bool> {
        Ok(self.store.get(&self.key(name)).await?.is_some())
    }

    /// Owner id of the current holder of `name`, if any.
    pub async fn holder(&self, name: &str) -> CoordinationResult<Option<String>> {
        let value = self.store.get(&self.key(name)).await?;
        Ok(value.and_then(|v| v.rsplit_once(':').map(|(owner, _)| owner.to_string())))
    }

    /// Locks this process believes it holds.
    pub fn held_locks(&self) -> Vec<LockInfo> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|l| l.is_held())
            .map(Lock::info)
            .collect()
    }

    /// Best-effort release of every lock held by this process. Returns how many were deleted from the store.
    pub async fn shutdown(&self) -> usize {
        self.renewals.cancel();
        let locks: Vec<Lock> = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, l)| l)
            .collect();

        let mut released = 0;
        for lock in locks {
            if lock.is_released() {
                continue;
            }
            match self
                .store
                .compare_and_delete(&lock.inner.key, &lock.inner.value)
                .await
            {
                Ok(true) => released += 1,
                Ok(false) => debug!(lock = %lock.name(), "lock already gone at shutdown"),
                Err(e) => warn!(lock = %lock.name(), error = %e, "lock release at shutdown failed"),
            }
            lock.mark_released();
        }
        debug!(released, "lock manager shut down");
        released
    }

    /// Locally held, still-valid handle for `name`. Stale entries are dropped.
    fn local(&self, name: &str) -> Option<Lock> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.get(name) {
            Some(lock) if lock.is_held() => Some(lock.clone()),
            Some(_) => {
                if let Some(stale) = held.remove(name) {
                    stale.stop_renew();
                }
                None
            }
            None => None,
        }
    }

    fn forget(&self, lock: &Lock) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held
            .get(lock.name())
            .is_some_and(|l| l.same_acquisition(lock))
        {
            held.remove(lock.name());
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        self.renewals.cancel();
        let locks: Vec<Lock> = self
            .held
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, l)| l)
            .filter(|l| !l.is_released())
            .collect();
        if locks.is_empty() {
            return;
        }

        // Without a runtime the locks simply expire via TTL.
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        rt.spawn(async move {
            for lock in locks {
                let res = store
                    .compare_and_delete(&lock.inner.key, &lock.inner.value)
                    .await;
                lock.mark_released();
                match res {
                    Ok(_) => debug!(lock = %lock.name(), "lock released on drop"),
                    Err(e) => debug!(lock = %lock.name(), error = %e, "lock release on drop failed (will expire via TTL)"),
                }
            }
        });
    }
}
