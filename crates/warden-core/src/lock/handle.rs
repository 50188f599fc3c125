use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warden_model::{EpochMs, LockInfo};

use crate::{
    clock::ClockRef,
    store::{CoordinationStore, StoreResult},
};

/// Consecutive failed renewals after which a lock is considered lost.
const MAX_RENEW_FAILURES: u32 = 2;

/// Handle to an acquired lock.
///
/// Clones share state: a reentrant acquisition hands back a clone of the original handle.
/// The handle never assumes it still owns the lock. [`Lock::is_held`] turns false once the lock is released,
/// its TTL elapses, or auto-renew fails twice in a row.
#[derive(Clone)]
pub struct Lock {
    pub(super) inner: Arc<LockState>,
}

pub(super) struct LockState {
    pub(super) name: String,
    pub(super) key: String,
    pub(super) owner_id: String,
    pub(super) token: String,
    /// `"{owner_id}:{token}"`, the exact value written to the store.
    pub(super) value: String,
    pub(super) acquired_at: EpochMs,
    pub(super) ttl_ms: AtomicU64,
    pub(super) expires_at: AtomicU64,
    pub(super) reentry: AtomicU32,
    pub(super) released: AtomicBool,
    pub(super) lost: AtomicBool,
    pub(super) renew: Mutex<Option<CancellationToken>>,
    pub(super) clock: ClockRef,
}

impl Lock {
    pub(super) fn new(
        name: &str,
        key: String,
        owner_id: &str,
        ttl: Duration,
        clock: ClockRef,
    ) -> Self {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let now = clock.now_ms();
        let ttl_ms = ttl.as_millis() as u64;
        Self {
            inner: Arc::new(LockState {
                name: name.to_string(),
                key,
                owner_id: owner_id.to_string(),
                value: format!("{owner_id}:{token}"),
                token,
                acquired_at: now,
                ttl_ms: AtomicU64::new(ttl_ms),
                expires_at: AtomicU64::new(now.saturating_add(ttl_ms)),
                reentry: AtomicU32::new(0),
                released: AtomicBool::new(false),
                lost: AtomicBool::new(false),
                renew: Mutex::new(None),
                clock,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    pub fn token(&self) -> &str {
        &self.inner.token
    }

    pub fn acquired_at(&self) -> EpochMs {
        self.inner.acquired_at
    }

    pub fn expires_at(&self) -> EpochMs {
        self.inner.expires_at.load(Ordering::SeqCst)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.inner.ttl_ms.load(Ordering::SeqCst))
    }

    pub fn reentry_count(&self) -> u32 {
        self.inner.reentry.load(Ordering::SeqCst)
    }

    /// TTL elapsed according to the last successful acquire/extend.
    pub fn is_expired(&self) -> bool {
        self.inner.clock.now_ms() >= self.expires_at()
    }

    /// Auto-renew gave up after consecutive failures.
    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Local view of ownership: not released, not lost, not expired.
    pub fn is_held(&self) -> bool {
        !self.is_released() && !self.is_lost() && !self.is_expired()
    }

    pub fn info(&self) -> LockInfo {
        LockInfo {
            name: self.inner.name.clone(),
            owner_id: self.inner.owner_id.clone(),
            token: self.inner.token.clone(),
            acquired_at: self.inner.acquired_at,
            expires_at: self.expires_at(),
            reentry_count: self.reentry_count(),
        }
    }

    pub(super) fn same_acquisition(&self, other: &Lock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(super) fn mark_extended(&self, ttl: Duration) {
        let ttl_ms = ttl.as_millis() as u64;
        self.inner.ttl_ms.store(ttl_ms, Ordering::SeqCst);
        self.inner.expires_at.store(
            self.inner.clock.now_ms().saturating_add(ttl_ms),
            Ordering::SeqCst,
        );
    }

    pub(super) fn mark_released(&self) {
        self.stop_renew();
        self.inner.reentry.store(0, Ordering::SeqCst);
        self.inner.released.store(true, Ordering::SeqCst);
    }

    fn mark_lost(&self) {
        self.inner.lost.store(true, Ordering::SeqCst);
    }

    /// Take one reentrant hold off the count; `false` when the count was already zero.
    pub(super) fn leave_reentry(&self) -> bool {
        self.inner
            .reentry
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
            .is_ok()
    }

    pub(super) fn enter_reentry(&self) -> u32 {
        self.inner.reentry.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(super) fn stop_renew(&self) {
        let token = self
            .inner
            .renew
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Start the background renewal task at 0.7x the hold TTL.
    pub(super) fn start_renew(&self, store: Arc<dyn CoordinationStore>, parent: &CancellationToken) {
        let cancel = parent.child_token();
        *self
            .inner
            .renew
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());

        let interval = self.ttl().mul_f64(0.7).max(Duration::from_millis(1));
        tokio::spawn(renew_loop(store, self.clone(), interval, cancel));
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.inner.name)
            .field("owner_id", &self.inner.owner_id)
            .field("token", &self.inner.token)
            .field("expires_at", &self.expires_at())
            .field("reentry_count", &self.reentry_count())
            .field("held", &self.is_held())
            .finish()
    }
}

/// Owner-guarded TTL refresh shared by `extend` and the renewal task.
pub(super) async fn extend_in(
    store: &dyn CoordinationStore,
    lock: &Lock,
    ttl: Duration,
) -> StoreResult<bool> {
    if lock.is_released() {
        return Ok(false);
    }
    let ok = store
        .compare_and_expire(&lock.inner.key, &lock.inner.value, ttl)
        .await?;
    if ok {
        lock.mark_extended(ttl);
    }
    Ok(ok)
}

async fn renew_loop(
    store: Arc<dyn CoordinationStore>,
    lock: Lock,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if !lock.is_held() {
            break;
        }

        match extend_in(store.as_ref(), &lock, lock.ttl()).await {
            Ok(true) => {
                failures = 0;
                debug!(lock = %lock.name(), expires_at = lock.expires_at(), "lock renewed");
            }
            Ok(false) => {
                failures += 1;
                warn!(lock = %lock.name(), failures, "lock renewal rejected: no longer owner");
            }
            Err(e) => {
                failures += 1;
                warn!(lock = %lock.name(), failures, error = %e, "lock renewal failed");
            }
        }

        if failures >= MAX_RENEW_FAILURES {
            lock.mark_lost();
            warn!(lock = %lock.name(), "lock lost; auto-renew stopped");
            break;
        }
    }
}
