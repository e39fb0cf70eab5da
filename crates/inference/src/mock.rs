//! Mock inference service for tests and offline runs.

use async_trait::async_trait;
use std::sync::Mutex;

use attune_core::error::InferenceError;
use attune_core::inference::{AssembledRequest, InferenceReply, InferenceService};

/// Scripted inference service. Replies with a canned response, or fails with
/// a canned error, and remembers every request it saw.
pub struct MockInference {
    reply: Option<String>,
    error: Option<InferenceError>,
    requests: Mutex<Vec<AssembledRequest>>,
}

impl MockInference {
    /// A mock that always succeeds with `reply`.
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            error: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A mock that always fails with `error`.
    pub fn failing(error: InferenceError) -> Self {
        Self {
            reply: None,
            error: Some(error),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request this mock has received.
    pub fn seen(&self) -> Vec<AssembledRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl InferenceService for MockInference {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &AssembledRequest) -> Result<InferenceReply, InferenceError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        match (&self.reply, &self.error) {
            (_, Some(error)) => Err(error.clone()),
            (Some(reply), None) => Ok(InferenceReply {
                response: reply.clone(),
                agent_used: Some("mock".into()),
                latency_ms: 1,
            }),
            (None, None) => Err(InferenceError::Unavailable("mock not scripted".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn request() -> AssembledRequest {
        AssembledRequest {
            tenant_id: 1,
            agent_id: 7,
            contact: "551198".into(),
            recent_history: vec![],
            summary: None,
            few_shot_examples: vec![],
            knowledge_document_ids: BTreeSet::new(),
            incoming_message: "hi".into(),
            reduced_context: false,
        }
    }

    #[tokio::test]
    async fn replying_mock_records_requests() {
        let mock = MockInference::replying("hello");
        let reply = mock.complete(&request()).await.unwrap();
        assert_eq!(reply.response, "hello");
        assert_eq!(mock.seen().len(), 1);
    }

    #[tokio::test]
    async fn failing_mock_returns_the_error() {
        let mock = MockInference::failing(InferenceError::Timeout { timeout_secs: 9 });
        let err = mock.complete(&request()).await.unwrap_err();
        assert!(matches!(err, InferenceError::Timeout { timeout_secs: 9 }));
    }
}
