use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;
use tokio::sync::oneshot;
use warden_model::RequestId;

/// How an in-flight execution settled, as delivered to local waiters.
pub(super) type Settlement = Result<(RequestId, Value), String>;

struct Flight {
    generation: u64,
    senders: Vec<oneshot::Sender<Settlement>>,
}

/// Callers of this process suspended on executions this process owns, keyed by dedup key.
///
/// An entry exists exactly while this process runs the operation for that key. Each execution is stamped with
/// a generation so that a finished one can never clear the entry of a later execution of the same key.
#[derive(Clone, Default)]
pub(super) struct Waiters {
    inner: Arc<Mutex<HashMap<String, Flight>>>,
    generations: Arc<AtomicU64>,
}

impl Waiters {
    /// Mark `key` as executing here. The returned guard settles or abandons the waiters exactly once.
    ///
    /// Waiters of an earlier execution still registered under `key` are closed and fall back to the store.
    pub fn own(&self, key: &str) -> InFlight {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).insert(
            key.to_string(),
            Flight {
                generation,
                senders: Vec::new(),
            },
        );
        InFlight {
            waiters: self.clone(),
            key: key.to_string(),
            generation,
            settled: false,
        }
    }

    /// Join a local execution of `key`; `None` when no execution of it is running in this process.
    pub fn join(&self, key: &str) -> Option<oneshot::Receiver<Settlement>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let flight = map.get_mut(key)?;
        let (tx, rx) = oneshot::channel();
        flight.senders.push(tx);
        Some(rx)
    }

    pub fn waiting(&self, key: &str) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |f| f.senders.len())
    }

    fn take(&self, key: &str, generation: u64) -> Vec<oneshot::Sender<Settlement>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(key).is_some_and(|f| f.generation == generation) {
            map.remove(key).map(|f| f.senders).unwrap_or_default()
        } else {
            Vec::new()
        }
    }
}

/// Ownership of one local execution.
///
/// Dropping it without `settle` (the caller's future was cancelled) drops the senders, so waiters fall back to
/// polling the store.
pub(super) struct InFlight {
    waiters: Waiters,
    key: String,
    generation: u64,
    settled: bool,
}

impl InFlight {
    /// Deliver the outcome to every waiter and release the key. Returns how many were woken.
    pub fn settle(mut self, outcome: Settlement) -> usize {
        let senders = self.waiters.take(&self.key, self.generation);
        self.settled = true;
        let n = senders.len();
        for tx in senders {
            // a waiter that gave up has dropped its receiver
            let _ = tx.send(outcome.clone());
        }
        n
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.settled {
            drop(self.waiters.take(&self.key, self.generation));
        }
    }
}
