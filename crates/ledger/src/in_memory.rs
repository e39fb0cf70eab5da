//! In-memory ledger backend.
//!
//! Same semantics as the SQLite backend, held in a `RwLock`-guarded map.
//! Appends take the write lock for their whole critical section, so the
//! retry budget never comes into play here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use attune_core::error::LedgerError;
use attune_core::ledger::{AppendResult, LedgerKey, LedgerMessage, LedgerRole, LedgerStore};

use crate::summarizer::Summarizer;
use crate::LedgerSettings;

#[derive(Debug, Clone)]
struct Ledger {
    messages: Vec<LedgerMessage>,
    summary: Option<String>,
    entities: serde_json::Map<String, serde_json::Value>,
    expires_at: DateTime<Utc>,
}

/// Ledger store backed by process memory. Contents vanish on restart.
pub struct InMemoryLedger {
    ledgers: RwLock<HashMap<LedgerKey, Ledger>>,
    settings: LedgerSettings,
    summarizer: Arc<dyn Summarizer>,
}

impl InMemoryLedger {
    pub fn new(settings: LedgerSettings, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            ledgers: RwLock::new(HashMap::new()),
            settings,
            summarizer,
        }
    }

    fn tail(messages: &[LedgerMessage], limit: usize) -> Vec<LedgerMessage> {
        let start = messages.len().saturating_sub(limit);
        messages[start..].to_vec()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn append(
        &self,
        tenant_id: i64,
        contact_id: &str,
        role: LedgerRole,
        body: &str,
    ) -> Result<AppendResult, LedgerError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(LedgerError::InvalidInput(
                "message body must not be empty".into(),
            ));
        }
        let key = LedgerKey::new(tenant_id, contact_id);
        let now = Utc::now();

        let mut ledgers = self.ledgers.write().await;
        let ledger = ledgers.entry(key.clone()).or_insert_with(|| Ledger {
            messages: Vec::new(),
            summary: None,
            entities: serde_json::Map::new(),
            expires_at: now,
        });
        if ledger.expires_at <= now && !ledger.messages.is_empty() {
            debug!("Recycling expired ledger {key}");
            ledger.messages.clear();
            ledger.summary = None;
            ledger.entities.clear();
        }

        let at = ledger
            .messages
            .last()
            .map(|m| m.at.max(now))
            .unwrap_or(now);
        ledger.messages.push(LedgerMessage {
            role,
            body: body.to_string(),
            at,
        });
        ledger.expires_at = now + self.settings.retention();

        let count = ledger.messages.len();
        let triggered_summary = count % self.settings.summarize_every as usize == 0;
        if triggered_summary {
            let window = Self::tail(
                &ledger.messages,
                self.settings.summary_source_window as usize,
            );
            match self
                .summarizer
                .summarize(&window, ledger.summary.as_deref())
                .await
            {
                Ok(summary) => ledger.summary = Some(summary),
                Err(e) => warn!("Summarization failed for ledger {key}: {e}"),
            }
        }

        Ok(AppendResult {
            messages: Self::tail(&ledger.messages, self.settings.recent_window),
            triggered_summary,
        })
    }

    async fn recent_messages(
        &self,
        tenant_id: i64,
        contact_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerMessage>, LedgerError> {
        let key = LedgerKey::new(tenant_id, contact_id);
        let ledgers = self.ledgers.read().await;
        Ok(ledgers
            .get(&key)
            .filter(|l| l.expires_at > Utc::now())
            .map(|l| Self::tail(&l.messages, limit))
            .unwrap_or_default())
    }

    async fn summary(
        &self,
        tenant_id: i64,
        contact_id: &str,
    ) -> Result<Option<String>, LedgerError> {
        let key = LedgerKey::new(tenant_id, contact_id);
        let ledgers = self.ledgers.read().await;
        Ok(ledgers
            .get(&key)
            .filter(|l| l.expires_at > Utc::now())
            .and_then(|l| l.summary.clone())
            .filter(|s| !s.is_empty()))
    }

    async fn entities(
        &self,
        tenant_id: i64,
        contact_id: &str,
    ) -> Result<Option<serde_json::Map<String, serde_json::Value>>, LedgerError> {
        let key = LedgerKey::new(tenant_id, contact_id);
        let ledgers = self.ledgers.read().await;
        Ok(ledgers
            .get(&key)
            .filter(|l| l.expires_at > Utc::now() && !l.entities.is_empty())
            .map(|l| l.entities.clone()))
    }

    async fn update_entities(
        &self,
        tenant_id: i64,
        contact_id: &str,
        entities: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), LedgerError> {
        let key = LedgerKey::new(tenant_id, contact_id);
        let mut ledgers = self.ledgers.write().await;
        if let Some(ledger) = ledgers
            .get_mut(&key)
            .filter(|l| l.expires_at > Utc::now())
        {
            ledger.entities.extend(entities);
        } else {
            debug!("Skipping entity update for absent ledger {key}");
        }
        Ok(())
    }

    async fn delete_ledger(&self, tenant_id: i64, contact_id: &str) -> Result<(), LedgerError> {
        let key = LedgerKey::new(tenant_id, contact_id);
        self.ledgers.write().await.remove(&key);
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize, LedgerError> {
        let now = Utc::now();
        let mut ledgers = self.ledgers.write().await;
        let before = ledgers.len();
        ledgers.retain(|_, l| l.expires_at > now);
        Ok(before - ledgers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarizer::NaiveSummarizer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store(settings: LedgerSettings) -> InMemoryLedger {
        InMemoryLedger::new(settings, Arc::new(NaiveSummarizer))
    }

    #[derive(Default)]
    struct CountingSummarizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(
            &self,
            messages: &[LedgerMessage],
            previous: Option<&str>,
        ) -> Result<String, LedgerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            NaiveSummarizer.summarize(messages, previous).await
        }
    }

    #[tokio::test]
    async fn append_returns_recent_window() {
        let store = store(LedgerSettings {
            recent_window: 3,
            ..LedgerSettings::default()
        });
        for i in 1..=5 {
            store
                .append(1, "551100", LedgerRole::User, &format!("m{i}"))
                .await
                .unwrap();
        }
        let result = store
            .append(1, "551100", LedgerRole::Agent, "reply")
            .await
            .unwrap();
        assert_eq!(result.messages.len(), 3);
        assert_eq!(result.messages[2].body, "reply");
    }

    #[tokio::test]
    async fn expired_ledger_is_invisible_until_rewritten() {
        let store = store(LedgerSettings::default());
        store
            .append(1, "551100", LedgerRole::User, "old")
            .await
            .unwrap();

        store
            .ledgers
            .write()
            .await
            .values_mut()
            .for_each(|l| l.expires_at = Utc::now() - chrono::Duration::minutes(1));

        assert!(store.recent_messages(1, "551100", 10).await.unwrap().is_empty());
        assert!(store.entities(1, "551100").await.unwrap().is_none());

        store
            .append(1, "551100", LedgerRole::User, "new")
            .await
            .unwrap();
        let messages = store.recent_messages(1, "551100", 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "new");
    }

    #[tokio::test]
    async fn summary_interval_counts_whole_history() {
        let store = store(LedgerSettings {
            summarize_every: 4,
            ..LedgerSettings::default()
        });
        let mut triggers = 0;
        for i in 1..=9 {
            let result = store
                .append(1, "551100", LedgerRole::User, &format!("m{i}"))
                .await
                .unwrap();
            if result.triggered_summary {
                triggers += 1;
            }
        }
        assert_eq!(triggers, 2);
        assert!(store.summary(1, "551100").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_appends_summarize_once_per_interval() {
        let summarizer = Arc::new(CountingSummarizer::default());
        let store = Arc::new(InMemoryLedger::new(
            LedgerSettings::default(),
            Arc::clone(&summarizer) as Arc<dyn Summarizer>,
        ));

        let mut handles = Vec::new();
        for i in 0..45 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append(1, "551100", LedgerRole::User, &format!("m{i}"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let messages = store.recent_messages(1, "551100", 100).await.unwrap();
        assert_eq!(messages.len(), 45);
        // Exactly one append saw count 20 and one saw count 40.
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sweep_counts_removed() {
        let store = store(LedgerSettings::default());
        store.append(1, "1", LedgerRole::User, "a").await.unwrap();
        store.append(1, "2", LedgerRole::User, "b").await.unwrap();
        store
            .ledgers
            .write()
            .await
            .values_mut()
            .for_each(|l| l.expires_at = Utc::now() - chrono::Duration::minutes(1));
        assert_eq!(store.sweep_expired().await.unwrap(), 2);
        assert_eq!(store.sweep_expired().await.unwrap(), 0);
    }
}
