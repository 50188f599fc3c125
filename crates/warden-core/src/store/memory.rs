use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tracing::trace;

use super::{Command, CoordinationStore, Reply, StoreError, StoreResult};
use crate::clock::{Clock, ClockRef, system};

/// Linearizable in-process coordination store.
///
/// Every command (and every pipeline) runs under one mutex, so it offers the same atomicity the components
/// expect from a real store. Expired keys are purged lazily on access using the injected clock. Clones share
/// the same data, which lets tests model several processes talking to one store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
    clock: ClockRef,
    unavailable: Arc<AtomicBool>,
    writes: Arc<AtomicU64>,
}

#[derive(Clone)]
struct Entry {
    data: Data,
    expires_at: Option<u64>,
}

#[derive(Clone)]
enum Data {
    Str(String),
    /// Sorted ascending by `(score, member)`.
    ZSet(Vec<(String, f64)>),
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(system())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Simulate losing connectivity: every command fails with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of state-changing commands executed so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.values().filter(|e| !is_expired(e, now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of `key`, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_ms();
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(key)
            .filter(|e| !is_expired(e, now))
            .and_then(|e| e.expires_at)
            .map(|at| Duration::from_millis(at.saturating_sub(now)))
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn apply(&self, map: &mut HashMap<String, Entry>, cmd: Command, now: u64) -> StoreResult<Reply> {
        if cmd.is_write() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        trace!(command = cmd.name(), "memory store apply");

        match cmd {
            Command::Get { key } => match live(map, &key, now) {
                Some(Entry {
                    data: Data::Str(s), ..
                }) => Ok(Reply::Str(s.clone())),
                Some(_) => Err(StoreError::WrongType(key)),
                None => Ok(Reply::Nil),
            },
            Command::Set { key, value, ttl } => {
                map.insert(key, Entry::string(value, deadline(now, ttl)));
                Ok(Reply::Ok)
            }
            Command::SetIfAbsent { key, value, ttl } => {
                if live(map, &key, now).is_some() {
                    return Ok(Reply::Bool(false));
                }
                map.insert(key, Entry::string(value, deadline(now, Some(ttl))));
                Ok(Reply::Bool(true))
            }
            Command::Del { key } => {
                let existed = live(map, &key, now).is_some();
                map.remove(&key);
                Ok(Reply::Bool(existed))
            }
            Command::Expire { key, ttl } => match live_mut(map, &key, now) {
                Some(entry) => {
                    entry.expires_at = deadline(now, Some(ttl));
                    Ok(Reply::Bool(true))
                }
                None => Ok(Reply::Bool(false)),
            },
            Command::Incr { key, ttl } => {
                let next = match live_mut(map, &key, now) {
                    Some(Entry {
                        data: Data::Str(s), ..
                    }) => {
                        let current: i64 = s.parse().map_err(|_| StoreError::Corrupted {
                            key: key.clone(),
                            reason: format!("not an integer: {s}"),
                        })?;
                        let next = current + 1;
                        *s = next.to_string();
                        next
                    }
                    Some(_) => return Err(StoreError::WrongType(key)),
                    None => {
                        map.insert(key, Entry::string("1".into(), deadline(now, ttl)));
                        1
                    }
                };
                Ok(Reply::Int(next))
            }
            Command::CompareAndDelete { key, expected } => {
                if holds(map, &key, &expected, now) {
                    map.remove(&key);
                    return Ok(Reply::Bool(true));
                }
                Ok(Reply::Bool(false))
            }
            Command::CompareAndExpire { key, expected, ttl } => {
                if !holds(map, &key, &expected, now) {
                    return Ok(Reply::Bool(false));
                }
                if let Some(entry) = map.get_mut(&key) {
                    entry.expires_at = deadline(now, Some(ttl));
                }
                Ok(Reply::Bool(true))
            }
            Command::CompareAndSwap {
                key,
                expected,
                value,
                ttl,
            } => {
                if !holds(map, &key, &expected, now) {
                    return Ok(Reply::Bool(false));
                }
                map.insert(key, Entry::string(value, deadline(now, ttl)));
                Ok(Reply::Bool(true))
            }
            Command::ZAdd { key, score, member } => {
                purge(map, &key, now);
                let entry = map.entry(key.clone()).or_insert_with(|| Entry {
                    data: Data::ZSet(Vec::new()),
                    expires_at: None,
                });
                let Data::ZSet(set) = &mut entry.data else {
                    return Err(StoreError::WrongType(key));
                };
                let added = match set.iter().position(|(m, _)| *m == member) {
                    Some(idx) => {
                        set.remove(idx);
                        false
                    }
                    None => true,
                };
                let at = set
                    .iter()
                    .position(|(m, s)| (*s, m.as_str()) > (score, member.as_str()))
                    .unwrap_or(set.len());
                set.insert(at, (member, score));
                Ok(Reply::Bool(added))
            }
            Command::ZRem { key, member } => {
                let removed = match live_mut(map, &key, now) {
                    Some(Entry {
                        data: Data::ZSet(set),
                        ..
                    }) => {
                        let before = set.len();
                        set.retain(|(m, _)| *m != member);
                        before != set.len()
                    }
                    Some(_) => return Err(StoreError::WrongType(key)),
                    None => false,
                };
                Ok(Reply::Bool(removed))
            }
            Command::ZRemRangeByScore { key, min, max } => {
                let removed = match live_mut(map, &key, now) {
                    Some(Entry {
                        data: Data::ZSet(set),
                        ..
                    }) => {
                        let before = set.len();
                        set.retain(|(_, s)| *s < min || *s > max);
                        (before - set.len()) as i64
                    }
                    Some(_) => return Err(StoreError::WrongType(key)),
                    None => 0,
                };
                Ok(Reply::Int(removed))
            }
            Command::ZCard { key } => match live(map, &key, now) {
                Some(Entry {
                    data: Data::ZSet(set),
                    ..
                }) => Ok(Reply::Int(set.len() as i64)),
                Some(_) => Err(StoreError::WrongType(key)),
                None => Ok(Reply::Int(0)),
            },
            Command::ZRange { key, start, stop } => match live(map, &key, now) {
                Some(Entry {
                    data: Data::ZSet(set),
                    ..
                }) => Ok(Reply::Members(slice_by_rank(set, start, stop))),
                Some(_) => Err(StoreError::WrongType(key)),
                None => Ok(Reply::Members(Vec::new())),
            },
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn execute(&self, command: Command) -> StoreResult<Reply> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.apply(&mut map, command, now)
    }

    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let before: Vec<(String, Option<Entry>)> = commands
            .iter()
            .filter(|cmd| cmd.is_write())
            .map(|cmd| (cmd.key().to_string(), map.get(cmd.key()).cloned()))
            .collect();

        let mut replies = Vec::with_capacity(commands.len());
        for cmd in commands {
            match self.apply(&mut map, cmd, now) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    for (key, entry) in before.into_iter().rev() {
                        match entry {
                            Some(entry) => map.insert(key, entry),
                            None => map.remove(&key),
                        };
                    }
                    return Err(e);
                }
            }
        }
        Ok(replies)
    }
}

impl Entry {
    fn string(value: String, expires_at: Option<u64>) -> Self {
        Self {
            data: Data::Str(value),
            expires_at,
        }
    }
}

fn deadline(now: u64, ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|t| now.saturating_add(t.as_millis() as u64))
}

fn is_expired(entry: &Entry, now: u64) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

fn purge(map: &mut HashMap<String, Entry>, key: &str, now: u64) {
    if map.get(key).is_some_and(|e| is_expired(e, now)) {
        map.remove(key);
    }
}

fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str, now: u64) -> Option<&'a Entry> {
    purge(map, key, now);
    map.get(key)
}

fn live_mut<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
    now: u64,
) -> Option<&'a mut Entry> {
    purge(map, key, now);
    map.get_mut(key)
}

fn holds(map: &mut HashMap<String, Entry>, key: &str, expected: &str, now: u64) -> bool {
    matches!(
        live(map, key, now),
        Some(Entry { data: Data::Str(s), .. }) if s == expected
    )
}

fn slice_by_rank(set: &[(String, f64)], start: i64, stop: i64) -> Vec<(String, f64)> {
    let len = set.len() as i64;
    let norm = |i: i64| if i < 0 { len + i } else { i };
    let start = norm(start).max(0);
    let stop = norm(stop).min(len - 1);
    if len == 0 || start > stop {
        return Vec::new();
    }
    set[start as usize..=stop as usize].to_vec()
}
