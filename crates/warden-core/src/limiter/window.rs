//! Store-backed window algorithms. State lives in the coordination store so every process sharing it sees one
//! budget per key.

use uuid::Uuid;
use warden_model::{EpochMs, RateLimitDecision};

use crate::store::{Command, CoordinationStore, StoreError, StoreResult};

/// Start of the fixed window containing `now`.
pub(super) fn window_start(now: EpochMs, window_ms: u64) -> EpochMs {
    (now / window_ms) * window_ms
}

pub(super) fn fixed_key(base: &str, window_ms: u64, now: EpochMs) -> String {
    format!("{base}:fw:{window_ms}:{}", window_start(now, window_ms))
}

/// Sorted set of the live fixed-window counters for `base`, scored by counter expiry.
pub(super) fn fixed_index_key(base: &str) -> String {
    format!("{base}:fw")
}

pub(super) fn sliding_key(base: &str) -> String {
    format!("{base}:sw")
}

pub(super) async fn fixed_check(
    store: &dyn CoordinationStore,
    base: &str,
    limit: u64,
    window_ms: u64,
    now: EpochMs,
) -> StoreResult<RateLimitDecision> {
    let key = fixed_key(base, window_ms, now);
    let count = match store.get(&key).await? {
        Some(raw) => raw.parse::<u64>().map_err(|_| StoreError::Corrupted {
            key: key.clone(),
            reason: format!("window counter is not an integer: {raw}"),
        })?,
        None => 0,
    };
    let reset_at = window_start(now, window_ms) + window_ms;

    Ok(if count < limit {
        RateLimitDecision::allow(limit, limit - count, reset_at)
    } else {
        RateLimitDecision::deny(limit, reset_at, reset_at - now)
    })
}

/// Count the request and record its counter in the per-key index, in one atomic pipeline.
pub(super) async fn fixed_consume(
    store: &dyn CoordinationStore,
    base: &str,
    limit: u64,
    window_ms: u64,
    now: EpochMs,
) -> StoreResult<RateLimitDecision> {
    let key = fixed_key(base, window_ms, now);
    let index = fixed_index_key(base);
    let reset_at = window_start(now, window_ms) + window_ms;
    // The counter only has to outlive its own window.
    let ttl = std::time::Duration::from_millis(reset_at - now);

    let replies = store
        .pipeline(vec![
            Command::Incr {
                key: key.clone(),
                ttl: Some(ttl),
            },
            Command::ZRemRangeByScore {
                key: index.clone(),
                min: f64::NEG_INFINITY,
                max: now as f64,
            },
            Command::ZAdd {
                key: index.clone(),
                score: reset_at as f64,
                member: key,
            },
            Command::Expire {
                key: index,
                ttl: std::time::Duration::from_millis(window_ms),
            },
        ])
        .await?;
    let count = replies
        .into_iter()
        .next()
        .ok_or_else(|| short_pipeline("INCR"))?
        .into_int("INCR")?
        .max(0) as u64;

    Ok(if count <= limit {
        RateLimitDecision::allow(limit, limit - count, reset_at)
    } else {
        RateLimitDecision::deny(limit, reset_at, reset_at - now)
    })
}

/// Counter keys recorded in the fixed-window index of `base`.
pub(super) async fn fixed_counters(
    store: &dyn CoordinationStore,
    base: &str,
) -> StoreResult<Vec<String>> {
    Ok(store
        .z_range(&fixed_index_key(base), 0, -1)
        .await?
        .into_iter()
        .map(|(key, _)| key)
        .collect())
}

pub(super) async fn sliding_check(
    store: &dyn CoordinationStore,
    base: &str,
    limit: u64,
    window_ms: u64,
    now: EpochMs,
) -> StoreResult<RateLimitDecision> {
    let cutoff = now as f64 - window_ms as f64;
    let members = store.z_range(&sliding_key(base), 0, -1).await?;
    let in_window: Vec<f64> = members
        .into_iter()
        .map(|(_, score)| score)
        .filter(|score| *score > cutoff)
        .collect();

    let count = in_window.len() as u64;
    let oldest = in_window.first().copied();
    Ok(sliding_decision(count, count < limit, oldest, limit, window_ms, now))
}

/// Prune, record, count and refresh in one atomic pipeline; roll the entry back when over the limit.
pub(super) async fn sliding_consume(
    store: &dyn CoordinationStore,
    base: &str,
    limit: u64,
    window_ms: u64,
    now: EpochMs,
) -> StoreResult<RateLimitDecision> {
    let key = sliding_key(base);
    let member = format!("{now}:{}", Uuid::new_v4().simple());
    let replies = store
        .pipeline(vec![
            Command::ZRemRangeByScore {
                key: key.clone(),
                min: f64::NEG_INFINITY,
                max: now as f64 - window_ms as f64,
            },
            Command::ZAdd {
                key: key.clone(),
                score: now as f64,
                member: member.clone(),
            },
            Command::ZCard { key: key.clone() },
            Command::Expire {
                key: key.clone(),
                ttl: std::time::Duration::from_millis(window_ms),
            },
            Command::ZRange {
                key: key.clone(),
                start: 0,
                stop: 0,
            },
        ])
        .await?;

    let mut replies = replies.into_iter();
    let count = replies
        .nth(2)
        .ok_or_else(|| short_pipeline("ZCARD"))?
        .into_int("ZCARD")?
        .max(0) as u64;
    let oldest = replies
        .nth(1)
        .ok_or_else(|| short_pipeline("ZRANGE"))?
        .into_members("ZRANGE")?
        .first()
        .map(|(_, score)| *score);

    if count > limit {
        store.z_rem(&key, &member).await?;
        return Ok(sliding_decision(limit, false, oldest, limit, window_ms, now));
    }
    Ok(sliding_decision(count, true, oldest, limit, window_ms, now))
}

fn sliding_decision(
    count: u64,
    allowed: bool,
    oldest: Option<f64>,
    limit: u64,
    window_ms: u64,
    now: EpochMs,
) -> RateLimitDecision {
    // The window frees a slot when its oldest entry ages out.
    let reset_at = oldest.map_or(now + window_ms, |ts| ts as u64 + window_ms);
    if allowed {
        RateLimitDecision::allow(limit, limit.saturating_sub(count), reset_at)
    } else {
        RateLimitDecision::deny(limit, reset_at, reset_at.saturating_sub(now))
    }
}

fn short_pipeline(command: &'static str) -> StoreError {
    StoreError::UnexpectedReply {
        command,
        reply: "missing reply in pipeline".into(),
    }
}
