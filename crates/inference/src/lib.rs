//! HTTP client for the external inference service.
//!
//! The assembled request is rendered into the service's wire format: the
//! recent history as explicit role/content pairs, few-shot examples with
//! their corrections applied, and the linked document ids. The service does
//! the reasoning; this crate only ships bytes and maps failures onto
//! [`InferenceError`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use attune_core::error::InferenceError;
use attune_core::inference::{AssembledRequest, InferenceReply, InferenceService};
use attune_core::ledger::{LedgerMessage, LedgerRole};

pub mod mock;

pub use mock::MockInference;

/// HTTP implementation of the inference boundary.
pub struct HttpInference {
    base_url: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl HttpInference {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_secs,
            client,
        }
    }

    fn to_wire(request: &AssembledRequest) -> WireRequest {
        WireRequest {
            tenant_id: request.tenant_id,
            agent_id: request.agent_id,
            message: request.incoming_message.clone(),
            history: request.recent_history.iter().map(wire_message).collect(),
            summary: request.summary.clone(),
            examples: request
                .few_shot_examples
                .iter()
                .map(|ex| WireExample {
                    user_message: ex.user_message.clone(),
                    // The correction, when present, is the reply worth
                    // imitating; the original stays behind.
                    agent_response: ex
                        .corrected_response
                        .clone()
                        .unwrap_or_else(|| ex.agent_response.clone()),
                    priority: ex.priority,
                })
                .collect(),
            document_ids: request.knowledge_document_ids.iter().copied().collect(),
            reduced_context: request.reduced_context,
        }
    }
}

fn wire_message(message: &LedgerMessage) -> WireMessage {
    WireMessage {
        role: match message.role {
            LedgerRole::User => "user".into(),
            LedgerRole::Agent => "assistant".into(),
        },
        content: message.body.clone(),
    }
}

#[async_trait]
impl InferenceService for HttpInference {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete(&self, request: &AssembledRequest) -> Result<InferenceReply, InferenceError> {
        let url = format!("{}/v1/respond", self.base_url);
        let wire = Self::to_wire(request);

        debug!(
            tenant = request.tenant_id,
            agent = request.agent_id,
            history = wire.history.len(),
            examples = wire.examples.len(),
            "Sending inference request"
        );

        let started = std::time::Instant::now();
        let response = self.client.post(&url).json(&wire).send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    timeout_secs: self.timeout_secs,
                }
            } else {
                InferenceError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            warn!(status, body = %body, "Inference service returned error");
            return Err(InferenceError::Api {
                status_code: status,
                message: body,
            });
        }

        let reply: WireReply = response.json().await.map_err(|e| InferenceError::Api {
            status_code: 200,
            message: format!("Failed to parse response: {e}"),
        })?;

        Ok(InferenceReply {
            response: reply.response,
            agent_used: reply.agent_used,
            latency_ms: reply
                .processing_time_ms
                .unwrap_or(started.elapsed().as_millis() as u64),
        })
    }
}

#[derive(Debug, Serialize)]
struct WireRequest {
    tenant_id: i64,
    agent_id: i64,
    message: String,
    history: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    examples: Vec<WireExample>,
    document_ids: Vec<i64>,
    reduced_context: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireExample {
    user_message: String,
    agent_response: String,
    priority: i32,
}

#[derive(Debug, Deserialize)]
struct WireReply {
    response: String,
    #[serde(default)]
    agent_used: Option<String>,
    #[serde(default)]
    processing_time_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use attune_core::feedback::{FeedbackExample, FeedbackType};
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn example(corrected: Option<&str>) -> FeedbackExample {
        FeedbackExample {
            id: "x".into(),
            tenant_id: 1,
            agent_id: 7,
            team_id: None,
            user_message: "opening hours?".into(),
            agent_response: "9-5".into(),
            corrected_response: corrected.map(String::from),
            feedback_type: if corrected.is_some() {
                FeedbackType::Corrected
            } else {
                FeedbackType::Approved
            },
            rating: None,
            notes: None,
            priority: 5,
            used_in_prompt: true,
            context: None,
            created_at: Utc::now(),
        }
    }

    fn request() -> AssembledRequest {
        AssembledRequest {
            tenant_id: 1,
            agent_id: 7,
            contact: "551198".into(),
            recent_history: vec![
                LedgerMessage {
                    role: LedgerRole::User,
                    body: "hi".into(),
                    at: Utc::now(),
                },
                LedgerMessage {
                    role: LedgerRole::Agent,
                    body: "hello".into(),
                    at: Utc::now(),
                },
            ],
            summary: None,
            few_shot_examples: vec![example(Some("9-6 on weekdays")), example(None)],
            knowledge_document_ids: BTreeSet::from([3, 5]),
            incoming_message: "opening hours?".into(),
            reduced_context: false,
        }
    }

    #[test]
    fn history_renders_with_explicit_roles() {
        let wire = HttpInference::to_wire(&request());
        assert_eq!(wire.history[0].role, "user");
        assert_eq!(wire.history[1].role, "assistant");
        assert_eq!(wire.history[1].content, "hello");
    }

    #[test]
    fn corrections_replace_the_original_reply() {
        let wire = HttpInference::to_wire(&request());
        assert_eq!(wire.examples[0].agent_response, "9-6 on weekdays");
        assert_eq!(wire.examples[1].agent_response, "9-5");
    }

    #[test]
    fn document_ids_are_sorted() {
        let wire = HttpInference::to_wire(&request());
        assert_eq!(wire.document_ids, vec![3, 5]);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = HttpInference::new("http://localhost:8001/", 120);
        assert_eq!(client.base_url, "http://localhost:8001");
    }
}
