use serde::{Deserialize, Serialize};

use crate::EpochMs;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    /// Admissions left in the current window (or bucket) after this call.
    pub remaining: u64,
    /// When the current window resets or the bucket is full again.
    pub reset_at: EpochMs,
    /// How long to wait before the next call can succeed; set only when rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl RateLimitDecision {
    pub fn allow(limit: u64, remaining: u64, reset_at: EpochMs) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
            retry_after_ms: None,
        }
    }

    pub fn deny(limit: u64, reset_at: EpochMs, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
            retry_after_ms: Some(retry_after_ms.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_always_reports_positive_retry_after() {
        let d = RateLimitDecision::deny(5, 1_000, 0);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.retry_after_ms, Some(1));
    }

    #[test]
    fn allow_has_no_retry_after() {
        let d = RateLimitDecision::allow(5, 4, 1_000);
        let json = serde_json::to_string(&d).unwrap();
        assert!(!json.contains("retryAfterMs"));
        assert!(json.contains("\"resetAt\":1000"));
    }
}
