//! The inference boundary — the abstraction over the external service that
//! actually reasons about a turn.
//!
//! The assembler builds an [`AssembledRequest`]; an `InferenceService`
//! implementation ships it over the wire and returns the raw reply.
//! Implementations: HTTP client (production), mock (tests).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::InferenceError;
use crate::feedback::FeedbackExample;
use crate::ledger::LedgerMessage;

/// Everything the inference service needs for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledRequest {
    /// Owning tenant
    pub tenant_id: i64,

    /// The agent handling the turn
    pub agent_id: i64,

    /// Normalized contact key (digits only)
    pub contact: String,

    /// Recent conversation window, oldest first
    pub recent_history: Vec<LedgerMessage>,

    /// Rolling conversation summary, if one exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Ranked few-shot examples, strongest first
    pub few_shot_examples: Vec<FeedbackExample>,

    /// Identifiers of the agent's linked knowledge documents
    pub knowledge_document_ids: BTreeSet<i64>,

    /// The inbound user message for this turn
    pub incoming_message: String,

    /// True when examples or knowledge links could not be fetched and the
    /// turn proceeded with partial context.
    pub reduced_context: bool,
}

/// The raw reply from the inference service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceReply {
    /// The generated response text
    pub response: String,

    /// Which agent the service actually used (may differ from requested)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_used: Option<String>,

    /// Service-reported processing time
    pub latency_ms: u64,
}

/// The outcome of one turn, as fed back into `record_result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceOutcome {
    /// The reply text (empty on failure)
    pub response: String,

    /// Whether a usable reply was produced
    pub success: bool,

    /// End-to-end latency of the inference call
    pub latency_ms: u64,

    /// Error description when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InferenceOutcome {
    pub fn success(response: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            response: response.into(),
            success: true,
            latency_ms,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            response: String::new(),
            success: false,
            latency_ms,
            error: Some(error.into()),
        }
    }
}

/// The boundary to the external inference service.
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// The service name (e.g., "http", "mock").
    fn name(&self) -> &str;

    /// Run one turn. Transport failures map to `Unavailable`/`Timeout`;
    /// non-2xx replies map to `Api`.
    async fn complete(&self, request: &AssembledRequest) -> Result<InferenceReply, InferenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_constructors() {
        let ok = InferenceOutcome::success("hello", 120);
        assert!(ok.success);
        assert!(ok.error.is_none());

        let err = InferenceOutcome::failure("boom", 5000);
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert!(err.response.is_empty());
    }

    #[test]
    fn assembled_request_serialization() {
        let req = AssembledRequest {
            tenant_id: 1,
            agent_id: 7,
            contact: "5511987654321".into(),
            recent_history: vec![],
            summary: Some("10 messages so far".into()),
            few_shot_examples: vec![],
            knowledge_document_ids: BTreeSet::from([3, 5]),
            incoming_message: "hi".into(),
            reduced_context: false,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("knowledge_document_ids"));
        assert!(json.contains("incoming_message"));
    }
}
