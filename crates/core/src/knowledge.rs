//! Knowledge links — which documents an agent may draw on.
//!
//! Only identifiers cross this boundary; fetching and interpreting document
//! content belongs to the external retrieval service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::KnowledgeError;

/// One agent→document association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeLink {
    pub tenant_id: i64,
    pub agent_id: i64,
    pub document_id: i64,
    pub created_at: DateTime<Utc>,
}

/// The core KnowledgeLinkStore trait.
///
/// `set_links` has replace-all semantics and must be atomic from a reader's
/// point of view: a concurrent `links_for` observes the fully-old or
/// fully-new set, never a partial mix.
#[async_trait]
pub trait KnowledgeLinkStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Replace the agent's entire document set.
    async fn set_links(
        &self,
        tenant_id: i64,
        agent_id: i64,
        document_ids: BTreeSet<i64>,
    ) -> Result<(), KnowledgeError>;

    /// The agent's linked document identifiers.
    async fn links_for(
        &self,
        tenant_id: i64,
        agent_id: i64,
    ) -> Result<BTreeSet<i64>, KnowledgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_serialization() {
        let link = KnowledgeLink {
            tenant_id: 1,
            agent_id: 7,
            document_id: 42,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&link).unwrap();
        let back: KnowledgeLink = serde_json::from_str(&json).unwrap();
        assert_eq!(back, link);
    }
}
