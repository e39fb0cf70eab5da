//! In-memory feedback example store.

use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::HashMap;
use tokio::sync::RwLock;

use attune_core::error::CuratorError;
use attune_core::feedback::{
    self, ExamplesExport, ExampleStore, ExportedExample, FeedbackExample, FeedbackFilter,
    FeedbackInput, FeedbackPage, FeedbackPatch, FeedbackType,
};

/// Example store backed by process memory. Contents vanish on restart.
#[derive(Default)]
pub struct InMemoryExamples {
    examples: RwLock<HashMap<String, FeedbackExample>>,
}

impl InMemoryExamples {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ranked(
        &self,
        tenant_id: i64,
        agent_id: i64,
        limit: usize,
    ) -> Vec<FeedbackExample> {
        let examples = self.examples.read().await;
        let mut matched: Vec<FeedbackExample> = examples
            .values()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.agent_id == agent_id
                    && e.used_in_prompt
                    && e.feedback_type != FeedbackType::Rejected
            })
            .cloned()
            .collect();
        matched.sort_by_key(|e| Reverse((e.priority, e.created_at, e.id.clone())));
        matched.truncate(limit);
        matched
    }
}

#[async_trait]
impl ExampleStore for InMemoryExamples {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn record(&self, input: FeedbackInput) -> Result<FeedbackExample, CuratorError> {
        let example = feedback::normalize(input)?;
        self.examples
            .write()
            .await
            .insert(example.id.clone(), example.clone());
        Ok(example)
    }

    async fn update(
        &self,
        id: &str,
        tenant_id: i64,
        patch: FeedbackPatch,
    ) -> Result<FeedbackExample, CuratorError> {
        let mut examples = self.examples.write().await;
        let current = examples
            .get(id)
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| CuratorError::NotFound(format!("feedback example {id}")))?;
        let updated = feedback::apply_patch(current, patch)?;
        examples.insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn ranked_examples(
        &self,
        tenant_id: i64,
        agent_id: i64,
        limit: usize,
    ) -> Result<Vec<FeedbackExample>, CuratorError> {
        Ok(self.ranked(tenant_id, agent_id, limit).await)
    }

    async fn export(
        &self,
        tenant_id: i64,
        agent_id: i64,
        limit: usize,
    ) -> Result<ExamplesExport, CuratorError> {
        let examples = self.ranked(tenant_id, agent_id, limit).await;
        Ok(ExamplesExport {
            agent_id,
            total: examples.len(),
            examples: examples.iter().map(ExportedExample::from).collect(),
        })
    }

    async fn list(
        &self,
        tenant_id: i64,
        filter: FeedbackFilter,
    ) -> Result<FeedbackPage, CuratorError> {
        if filter.limit == 0 {
            return Err(CuratorError::InvalidInput(
                "limit must be at least 1".into(),
            ));
        }
        let examples = self.examples.read().await;
        let mut matched: Vec<FeedbackExample> = examples
            .values()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && filter.agent_id.is_none_or(|a| e.agent_id == a)
                    && filter.team_id.is_none_or(|t| e.team_id == Some(t))
                    && filter.feedback_type.is_none_or(|f| e.feedback_type == f)
                    && filter.used_in_prompt.is_none_or(|u| e.used_in_prompt == u)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|e| Reverse((e.created_at, e.id.clone())));
        let total = matched.len();
        let page = matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect();
        Ok(FeedbackPage {
            examples: page,
            total,
        })
    }

    async fn remove(&self, id: &str, tenant_id: i64) -> Result<(), CuratorError> {
        let mut examples = self.examples.write().await;
        match examples.get(id) {
            Some(e) if e.tenant_id == tenant_id => {
                examples.remove(id);
                Ok(())
            }
            _ => Err(CuratorError::NotFound(format!("feedback example {id}"))),
        }
    }
}
