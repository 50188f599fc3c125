use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EpochMs, RequestId};

/// State of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordStatus {
    Pending,
    Completed,
    Failed,
}

/// Persisted state of one deduplicated operation.
///
/// Written to the coordination store as JSON; a `completed` record's `result` never changes until the record expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub request_id: RequestId,
    pub key: String,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: EpochMs,
    pub ttl_ms: u64,
}

impl IdempotencyRecord {
    pub fn pending(key: impl Into<String>, created_at: EpochMs, ttl_ms: u64) -> Self {
        Self {
            request_id: RequestId::generate(),
            key: key.into(),
            status: RecordStatus::Pending,
            result: None,
            error: None,
            created_at,
            ttl_ms,
        }
    }

    /// Same request, resolved with `result`.
    pub fn completed(&self, result: Value) -> Self {
        Self {
            status: RecordStatus::Completed,
            result: Some(result),
            error: None,
            ..self.clone()
        }
    }

    /// Same request, resolved with `error`.
    pub fn failed(&self, error: impl Into<String>) -> Self {
        Self {
            status: RecordStatus::Failed,
            result: None,
            error: Some(error.into()),
            ..self.clone()
        }
    }

    pub fn expires_at(&self) -> EpochMs {
        self.created_at.saturating_add(self.ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_keeps_request_identity() {
        let pending = IdempotencyRecord::pending("order-1", 100, 60_000);
        let done = pending.completed(serde_json::json!({"charged": true}));

        assert_eq!(done.request_id, pending.request_id);
        assert_eq!(done.status, RecordStatus::Completed);
        assert_eq!(done.expires_at(), 60_100);

        let failed = pending.failed("card declined");
        assert_eq!(failed.status, RecordStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("card declined"));
        assert!(failed.result.is_none());
    }

    #[test]
    fn json_roundtrip() {
        let rec = IdempotencyRecord::pending("k", 1, 2).completed(Value::from(7));
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"status\":\"completed\""));
        assert!(!json.contains("error"));

        let back: IdempotencyRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
