//! In-memory knowledge link store.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

use attune_core::error::KnowledgeError;
use attune_core::knowledge::KnowledgeLinkStore;

/// Link store backed by process memory. The whole set is swapped under the
/// write lock, so readers get all-old or all-new.
#[derive(Default)]
pub struct InMemoryLinks {
    links: RwLock<HashMap<(i64, i64), BTreeSet<i64>>>,
}

impl InMemoryLinks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KnowledgeLinkStore for InMemoryLinks {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn set_links(
        &self,
        tenant_id: i64,
        agent_id: i64,
        document_ids: BTreeSet<i64>,
    ) -> Result<(), KnowledgeError> {
        let mut links = self.links.write().await;
        if document_ids.is_empty() {
            links.remove(&(tenant_id, agent_id));
        } else {
            links.insert((tenant_id, agent_id), document_ids);
        }
        Ok(())
    }

    async fn links_for(
        &self,
        tenant_id: i64,
        agent_id: i64,
    ) -> Result<BTreeSet<i64>, KnowledgeError> {
        let links = self.links.read().await;
        Ok(links.get(&(tenant_id, agent_id)).cloned().unwrap_or_default())
    }
}
