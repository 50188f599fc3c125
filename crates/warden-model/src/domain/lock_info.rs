use serde::{Deserialize, Serialize};

use crate::EpochMs;

/// Snapshot of a lock held by this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub name: String,
    /// Process-unique owner identifier.
    pub owner_id: String,
    /// Per-acquisition token; the stored value is `"{owner_id}:{token}"`.
    pub token: String,
    pub acquired_at: EpochMs,
    pub expires_at: EpochMs,
    /// Extra acquisitions on top of the first one (reentrant locks only).
    pub reentry_count: u32,
}

impl LockInfo {
    /// The value written to the coordination store for this acquisition.
    pub fn store_value(&self) -> String {
        format!("{}:{}", self.owner_id, self.token)
    }

    pub fn is_expired_at(&self, now: EpochMs) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_ms(&self, now: EpochMs) -> u64 {
        self.expires_at.saturating_sub(now)
    }
}
