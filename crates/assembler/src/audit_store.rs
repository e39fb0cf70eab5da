//! Audit record backends.
//!
//! The SQLite store follows the same conventions as the other stores:
//! inline migrations, WAL, text timestamps. The in-memory store backs tests.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::RwLock;
use tracing::info;

use attune_core::audit::{AuditRecord, AuditStore};
use attune_core::error::AuditError;

/// Audit store backed by process memory.
#[derive(Default)]
pub struct InMemoryAudit {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for InMemoryAudit {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn recent(
        &self,
        tenant_id: i64,
        agent_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let records = self.records.read().await;
        let mut matched: Vec<AuditRecord> = records
            .iter()
            .filter(|r| r.tenant_id == tenant_id && agent_id.is_none_or(|a| r.agent_id == a))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matched.truncate(limit);
        Ok(matched)
    }
}

/// Production SQLite audit store.
#[cfg(feature = "sqlite")]
pub struct SqliteAudit {
    pool: sqlx::SqlitePool,
}

#[cfg(feature = "sqlite")]
impl SqliteAudit {
    /// Open (or create) a SQLite audit database at `path`.
    pub async fn new(path: &str) -> Result<Self, AuditError> {
        use sqlx::sqlite::{
            SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
        };
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| AuditError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| AuditError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite audit store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for sharing one database file).
    pub async fn from_pool(pool: sqlx::SqlitePool) -> Result<Self, AuditError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_records (
                id               TEXT PRIMARY KEY,
                tenant_id        INTEGER NOT NULL,
                agent_id         INTEGER NOT NULL,
                contact          TEXT NOT NULL,
                incoming_message TEXT NOT NULL,
                assembled_prompt TEXT NOT NULL,
                response         TEXT NOT NULL,
                success          INTEGER NOT NULL,
                latency_ms       INTEGER NOT NULL,
                error            TEXT,
                reduced_context  INTEGER NOT NULL,
                created_at       TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuditError::MigrationFailed(format!("audit_records table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_tenant
             ON audit_records(tenant_id, agent_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuditError::MigrationFailed(format!("audit index: {e}")))?;

        Ok(())
    }
}

#[cfg(feature = "sqlite")]
#[async_trait]
impl AuditStore for SqliteAudit {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let prompt = serde_json::to_string(&record.assembled_prompt)
            .map_err(|e| AuditError::Storage(format!("encode prompt: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO audit_records
                (id, tenant_id, agent_id, contact, incoming_message,
                 assembled_prompt, response, success, latency_ms, error,
                 reduced_context, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.tenant_id)
        .bind(record.agent_id)
        .bind(&record.contact)
        .bind(&record.incoming_message)
        .bind(prompt)
        .bind(&record.response)
        .bind(record.success)
        .bind(record.latency_ms as i64)
        .bind(&record.error)
        .bind(record.reduced_context)
        .bind(record.created_at.to_rfc3339_opts(SecondsFormat::Millis, true))
        .execute(&self.pool)
        .await
        .map_err(|e| AuditError::Storage(format!("insert audit record: {e}")))?;
        Ok(())
    }

    async fn recent(
        &self,
        tenant_id: i64,
        agent_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        use sqlx::Row;

        let rows = match agent_id {
            Some(agent_id) => {
                sqlx::query(
                    "SELECT * FROM audit_records WHERE tenant_id = ? AND agent_id = ?
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(tenant_id)
                .bind(agent_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM audit_records WHERE tenant_id = ?
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(tenant_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| AuditError::Storage(format!("read audit records: {e}")))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let prompt: String = row.get("assembled_prompt");
            let created_at: String = row.get("created_at");
            records.push(AuditRecord {
                id: row.get("id"),
                tenant_id: row.get("tenant_id"),
                agent_id: row.get("agent_id"),
                contact: row.get("contact"),
                incoming_message: row.get("incoming_message"),
                assembled_prompt: serde_json::from_str(&prompt)
                    .map_err(|e| AuditError::Storage(format!("corrupt prompt: {e}")))?,
                response: row.get("response"),
                success: row.get("success"),
                latency_ms: row.get::<i64, _>("latency_ms") as u64,
                error: row.get("error"),
                reduced_context: row.get("reduced_context"),
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| AuditError::Storage(format!("corrupt timestamp: {e}")))?,
            });
        }
        Ok(records)
    }
}
