//! Audit records — one immutable row per inference turn.
//!
//! Records are append-only and retained for reporting. Writing them is
//! best-effort and must never block or fail the user-visible turn; the
//! assembler crate provides a buffered writer that feeds an `AuditStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuditError;

/// An immutable record of one inference turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record ID
    pub id: String,

    /// Owning tenant
    pub tenant_id: i64,

    /// The agent that handled the turn
    pub agent_id: i64,

    /// Normalized contact key (digits only)
    pub contact: String,

    /// The inbound user message
    pub incoming_message: String,

    /// The assembled request, serialized for later inspection
    pub assembled_prompt: serde_json::Value,

    /// The inference service's reply (empty on failure)
    pub response: String,

    /// Whether the turn produced a usable reply
    pub success: bool,

    /// End-to-end latency of the inference call
    pub latency_ms: u64,

    /// Error description when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Whether the turn proceeded with partial context
    pub reduced_context: bool,

    /// When the record was created
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Construct a record with a fresh id and timestamp.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: i64,
        agent_id: i64,
        contact: impl Into<String>,
        incoming_message: impl Into<String>,
        assembled_prompt: serde_json::Value,
        response: impl Into<String>,
        success: bool,
        latency_ms: u64,
        error: Option<String>,
        reduced_context: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            agent_id,
            contact: contact.into(),
            incoming_message: incoming_message.into(),
            assembled_prompt,
            response: response.into(),
            success,
            latency_ms,
            error,
            reduced_context,
            created_at: Utc::now(),
        }
    }
}

/// The core AuditStore trait. Append-only; records are never mutated.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Persist one record.
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;

    /// Recent records for a tenant, newest first, optionally filtered by agent.
    async fn recent(
        &self,
        tenant_id: i64,
        agent_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, AuditError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serialization_round_trip() {
        let record = AuditRecord::new(
            1,
            7,
            "5511987654321",
            "hello",
            serde_json::json!({"history": []}),
            "hi there",
            true,
            230,
            None,
            false,
        );
        let json = serde_json::to_string(&record).unwrap();
        let back: AuditRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.latency_ms, 230);
        assert!(back.success);
    }

    #[test]
    fn failed_turn_carries_error() {
        let record = AuditRecord::new(
            1,
            7,
            "551198",
            "hello",
            serde_json::json!({}),
            "",
            false,
            5000,
            Some("upstream timeout".into()),
            true,
        );
        assert!(!record.success);
        assert!(record.reduced_context);
        assert_eq!(record.error.as_deref(), Some("upstream timeout"));
    }
}
