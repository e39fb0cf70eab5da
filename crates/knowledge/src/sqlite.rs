//! SQLite knowledge link store.
//!
//! `set_links` deletes and reinserts inside one transaction, so a concurrent
//! reader sees either the old set or the new set in full.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use attune_core::error::KnowledgeError;
use attune_core::knowledge::KnowledgeLinkStore;

/// Production SQLite link store.
pub struct SqliteLinks {
    pool: SqlitePool,
}

impl SqliteLinks {
    /// Open (or create) a SQLite link database at `path`.
    pub async fn new(path: &str) -> Result<Self, KnowledgeError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| KnowledgeError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| KnowledgeError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite knowledge link store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for sharing one database file).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, KnowledgeError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), KnowledgeError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS knowledge_links (
                tenant_id   INTEGER NOT NULL,
                agent_id    INTEGER NOT NULL,
                document_id INTEGER NOT NULL,
                created_at  TEXT NOT NULL,
                PRIMARY KEY (tenant_id, agent_id, document_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| KnowledgeError::MigrationFailed(format!("knowledge_links table: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl KnowledgeLinkStore for SqliteLinks {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn set_links(
        &self,
        tenant_id: i64,
        agent_id: i64,
        document_ids: BTreeSet<i64>,
    ) -> Result<(), KnowledgeError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KnowledgeError::Storage(format!("begin set_links: {e}")))?;

        sqlx::query("DELETE FROM knowledge_links WHERE tenant_id = ? AND agent_id = ?")
            .bind(tenant_id)
            .bind(agent_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| KnowledgeError::QueryFailed(format!("clear links: {e}")))?;

        for document_id in &document_ids {
            sqlx::query(
                "INSERT INTO knowledge_links (tenant_id, agent_id, document_id, created_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(tenant_id)
            .bind(agent_id)
            .bind(document_id)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| KnowledgeError::QueryFailed(format!("insert link: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| KnowledgeError::Storage(format!("commit set_links: {e}")))?;
        debug!(
            "Set {} knowledge links for agent {agent_id} (tenant {tenant_id})",
            document_ids.len()
        );
        Ok(())
    }

    async fn links_for(
        &self,
        tenant_id: i64,
        agent_id: i64,
    ) -> Result<BTreeSet<i64>, KnowledgeError> {
        let rows = sqlx::query(
            "SELECT document_id FROM knowledge_links WHERE tenant_id = ? AND agent_id = ?",
        )
        .bind(tenant_id)
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KnowledgeError::QueryFailed(format!("read links: {e}")))?;
        Ok(rows.iter().map(|row| row.get("document_id")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> SqliteLinks {
        let path = dir.path().join("links.db");
        SqliteLinks::new(&format!("sqlite://{}", path.display()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn set_replaces_whole_set() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        store
            .set_links(1, 7, BTreeSet::from([1, 2, 3]))
            .await
            .unwrap();
        store.set_links(1, 7, BTreeSet::from([3, 9])).await.unwrap();

        assert_eq!(store.links_for(1, 7).await.unwrap(), BTreeSet::from([3, 9]));
    }

    #[tokio::test]
    async fn empty_set_clears_links() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.set_links(1, 7, BTreeSet::from([5])).await.unwrap();
        store.set_links(1, 7, BTreeSet::new()).await.unwrap();
        assert!(store.links_for(1, 7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn links_are_tenant_and_agent_scoped() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.set_links(1, 7, BTreeSet::from([1])).await.unwrap();
        store.set_links(2, 7, BTreeSet::from([2])).await.unwrap();
        store.set_links(1, 8, BTreeSet::from([3])).await.unwrap();

        assert_eq!(store.links_for(1, 7).await.unwrap(), BTreeSet::from([1]));
        assert_eq!(store.links_for(2, 7).await.unwrap(), BTreeSet::from([2]));
        assert_eq!(store.links_for(1, 8).await.unwrap(), BTreeSet::from([3]));
        assert!(store.links_for(3, 7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn readers_never_see_partial_replacement() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(open(&dir).await);
        let old: BTreeSet<i64> = (0..20).collect();
        let new: BTreeSet<i64> = (100..120).collect();
        store.set_links(1, 7, old.clone()).await.unwrap();

        let writer = {
            let store = std::sync::Arc::clone(&store);
            let new = new.clone();
            tokio::spawn(async move { store.set_links(1, 7, new).await })
        };
        for _ in 0..10 {
            let seen = store.links_for(1, 7).await.unwrap();
            assert!(seen == old || seen == new, "partial set observed: {seen:?}");
        }
        writer.await.unwrap().unwrap();
        assert_eq!(store.links_for(1, 7).await.unwrap(), new);
    }
}
