//! Boundary to the shared coordination store.
//!
//! The components only need a handful of primitives with single-node linearizability: conditional set,
//! owner-guarded delete/expire/swap, atomic increment, time-ordered sets, and a pipeline that applies a batch
//! of commands atomically in one round trip. An adapter for a concrete store implements [`CoordinationStore::execute`]
//! and [`CoordinationStore::pipeline`]; the typed helpers are provided on top.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
pub use memory::MemoryStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),
    #[error("corrupted value under '{key}': {reason}")]
    Corrupted { key: String, reason: String },
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: &'static str, reply: String },
}

/// One store primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String, ttl: Option<Duration> },
    SetIfAbsent { key: String, value: String, ttl: Duration },
    Del { key: String },
    Expire { key: String, ttl: Duration },
    /// Increment an integer counter; `ttl` is applied only when the increment creates the key.
    Incr { key: String, ttl: Option<Duration> },
    CompareAndDelete { key: String, expected: String },
    CompareAndExpire { key: String, expected: String, ttl: Duration },
    CompareAndSwap { key: String, expected: String, value: String, ttl: Option<Duration> },
    ZAdd { key: String, score: f64, member: String },
    ZRem { key: String, member: String },
    /// Remove members with `min <= score <= max`.
    ZRemRangeByScore { key: String, min: f64, max: f64 },
    ZCard { key: String },
    /// Members by rank, ascending by score; negative indices count from the end.
    ZRange { key: String, start: i64, stop: i64 },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::SetIfAbsent { .. } => "SETNX",
            Command::Del { .. } => "DEL",
            Command::Expire { .. } => "PEXPIRE",
            Command::Incr { .. } => "INCR",
            Command::CompareAndDelete { .. } => "CAD",
            Command::CompareAndExpire { .. } => "CAEXPIRE",
            Command::CompareAndSwap { .. } => "CAS",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRem { .. } => "ZREM",
            Command::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Command::ZCard { .. } => "ZCARD",
            Command::ZRange { .. } => "ZRANGE",
        }
    }

    /// The key the command operates on.
    pub fn key(&self) -> &str {
        match self {
            Command::Get { key }
            | Command::Set { key, .. }
            | Command::SetIfAbsent { key, .. }
            | Command::Del { key }
            | Command::Expire { key, .. }
            | Command::Incr { key, .. }
            | Command::CompareAndDelete { key, .. }
            | Command::CompareAndExpire { key, .. }
            | Command::CompareAndSwap { key, .. }
            | Command::ZAdd { key, .. }
            | Command::ZRem { key, .. }
            | Command::ZRemRangeByScore { key, .. }
            | Command::ZCard { key }
            | Command::ZRange { key, .. } => key,
        }
    }

    /// Whether the command can change store state.
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Command::Get { .. } | Command::ZCard { .. } | Command::ZRange { .. }
        )
    }
}

/// Reply to one [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Bool(bool),
    Int(i64),
    Str(String),
    Members(Vec<(String, f64)>),
}

impl Reply {
    pub fn into_bool(self, command: &'static str) -> StoreResult<bool> {
        match self {
            Reply::Bool(b) => Ok(b),
            other => Err(unexpected(command, other)),
        }
    }

    pub fn into_int(self, command: &'static str) -> StoreResult<i64> {
        match self {
            Reply::Int(n) => Ok(n),
            other => Err(unexpected(command, other)),
        }
    }

    pub fn into_opt_string(self, command: &'static str) -> StoreResult<Option<String>> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Str(s) => Ok(Some(s)),
            other => Err(unexpected(command, other)),
        }
    }

    pub fn into_members(self, command: &'static str) -> StoreResult<Vec<(String, f64)>> {
        match self {
            Reply::Members(m) => Ok(m),
            other => Err(unexpected(command, other)),
        }
    }
}

fn unexpected(command: &'static str, reply: Reply) -> StoreError {
    StoreError::UnexpectedReply {
        command,
        reply: format!("{reply:?}"),
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Execute a single command.
    async fn execute(&self, command: Command) -> StoreResult<Reply>;

    /// Execute a batch atomically: no other command observes a partial application, and a batch that fails
    /// part-way leaves the store as it was.
    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.execute(Command::Get { key: key.into() })
            .await?
            .into_opt_string("GET")
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.execute(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        })
        .await
        .map(|_| ())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.execute(Command::SetIfAbsent {
            key: key.into(),
            value: value.into(),
            ttl,
        })
        .await?
        .into_bool("SETNX")
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.execute(Command::Del { key: key.into() })
            .await?
            .into_bool("DEL")
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.execute(Command::Expire {
            key: key.into(),
            ttl,
        })
        .await?
        .into_bool("PEXPIRE")
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> StoreResult<i64> {
        self.execute(Command::Incr {
            key: key.into(),
            ttl,
        })
        .await?
        .into_int("INCR")
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.execute(Command::CompareAndDelete {
            key: key.into(),
            expected: expected.into(),
        })
        .await?
        .into_bool("CAD")
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.execute(Command::CompareAndExpire {
            key: key.into(),
            expected: expected.into(),
            ttl,
        })
        .await?
        .into_bool("CAEXPIRE")
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.execute(Command::CompareAndSwap {
            key: key.into(),
            expected: expected.into(),
            value: value.into(),
            ttl,
        })
        .await?
        .into_bool("CAS")
    }

    async fn z_add(&self, key: &str, score: f64, member: &str) -> StoreResult<bool> {
        self.execute(Command::ZAdd {
            key: key.into(),
            score,
            member: member.into(),
        })
        .await?
        .into_bool("ZADD")
    }

    async fn z_rem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.execute(Command::ZRem {
            key: key.into(),
            member: member.into(),
        })
        .await?
        .into_bool("ZREM")
    }

    async fn z_rem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<i64> {
        self.execute(Command::ZRemRangeByScore {
            key: key.into(),
            min,
            max,
        })
        .await?
        .into_int("ZREMRANGEBYSCORE")
    }

    async fn z_card(&self, key: &str) -> StoreResult<i64> {
        self.execute(Command::ZCard { key: key.into() })
            .await?
            .into_int("ZCARD")
    }

    async fn z_range(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<(String, f64)>> {
        self.execute(Command::ZRange {
            key: key.into(),
            start,
            stop,
        })
        .await?
        .into_members("ZRANGE")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_conversion_rejects_wrong_shape() {
        assert_eq!(Reply::Bool(true).into_bool("X"), Ok(true));
        assert!(matches!(
            Reply::Int(1).into_bool("X"),
            Err(StoreError::UnexpectedReply { command: "X", .. })
        ));
        assert_eq!(Reply::Nil.into_opt_string("GET"), Ok(None));
    }

    #[test]
    fn read_commands_are_not_writes() {
        assert!(!Command::Get { key: "a".into() }.is_write());
        assert!(!Command::ZCard { key: "a".into() }.is_write());
        assert!(Command::Del { key: "a".into() }.is_write());
        assert_eq!(Command::ZCard { key: "a".into() }.name(), "ZCARD");
    }
}
