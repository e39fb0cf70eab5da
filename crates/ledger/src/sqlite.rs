//! SQLite ledger backend.
//!
//! Two tables:
//! - `ledgers` — one row per (tenant, contact) conversation, carrying the
//!   message counter, rolling summary, tracked entities, and expiry.
//! - `ledger_messages` — the append-only message log, ordered by rowid.
//!
//! Appends run inside a transaction whose first statement is a conditional
//! `UPDATE`, so the write lock is taken before any read and concurrent
//! appends to the same key serialize instead of clobbering each other.
//! Expired rows are recycled in place on the next write.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use attune_core::error::LedgerError;
use attune_core::ledger::{AppendResult, LedgerKey, LedgerMessage, LedgerRole, LedgerStore};

use crate::summarizer::Summarizer;
use crate::LedgerSettings;

/// Production SQLite ledger store.
pub struct SqliteLedger {
    pool: SqlitePool,
    settings: LedgerSettings,
    summarizer: Arc<dyn Summarizer>,
}

impl SqliteLedger {
    /// Open (or create) a SQLite ledger database at `path`.
    pub async fn new(
        path: &str,
        settings: LedgerSettings,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| LedgerError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self {
            pool,
            settings,
            summarizer,
        };
        store.run_migrations().await?;
        info!("SQLite ledger store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for sharing one database file).
    pub async fn from_pool(
        pool: SqlitePool,
        settings: LedgerSettings,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self, LedgerError> {
        let store = Self {
            pool,
            settings,
            summarizer,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledgers (
                id            TEXT PRIMARY KEY,
                tenant_id     INTEGER NOT NULL,
                contact       TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                version       INTEGER NOT NULL DEFAULT 0,
                summary       TEXT,
                entities      TEXT NOT NULL DEFAULT '{}',
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL,
                expires_at    TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::MigrationFailed(format!("ledgers table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_messages (
                iid       INTEGER PRIMARY KEY AUTOINCREMENT,
                ledger_id TEXT NOT NULL,
                role      TEXT NOT NULL,
                body      TEXT NOT NULL,
                at        TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::MigrationFailed(format!("ledger_messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_messages_ledger
             ON ledger_messages(ledger_id, iid)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::MigrationFailed(format!("message index: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ledgers_expires ON ledgers(expires_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| LedgerError::MigrationFailed(format!("expiry index: {e}")))?;

        Ok(())
    }

    /// One append attempt. Returns the post-append message count, or `None`
    /// when a create race means the attempt should be retried.
    async fn try_append(
        &self,
        key: &LedgerKey,
        role: LedgerRole,
        body: &str,
    ) -> Result<Option<i64>, LedgerError> {
        let id = key.to_string();
        let now = Utc::now();
        let expires = fmt_ts(now + self.settings.retention());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::Storage(format!("begin append: {e}")))?;

        // Write-first: a live ledger is bumped in one conditional statement,
        // which also takes the transaction's write lock before any read.
        let bumped = sqlx::query(
            r#"
            UPDATE ledgers
            SET message_count = message_count + 1,
                version = version + 1,
                updated_at = MAX(updated_at, ?1),
                expires_at = ?2
            WHERE id = ?3 AND expires_at > ?1
            "#,
        )
        .bind(fmt_ts(now))
        .bind(&expires)
        .bind(&id)
        .execute(&mut *tx)
        .await
        .map_err(|e| LedgerError::QueryFailed(format!("bump ledger: {e}")))?
        .rows_affected();

        let (new_count, at) = if bumped == 1 {
            let row = sqlx::query("SELECT message_count, updated_at FROM ledgers WHERE id = ?")
                .bind(&id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| LedgerError::QueryFailed(format!("read ledger: {e}")))?;
            let count: i64 = row.get("message_count");
            let at = parse_ts(row.get("updated_at"))?;
            (count, at)
        } else {
            // No live row. Either the ledger never existed or it expired and
            // gets recycled: dead messages are dropped, the counter restarts.
            let stale = sqlx::query("DELETE FROM ledgers WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(|e| LedgerError::QueryFailed(format!("recycle ledger: {e}")))?
                .rows_affected();
            if stale > 0 {
                debug!("Recycling expired ledger {id}");
                sqlx::query("DELETE FROM ledger_messages WHERE ledger_id = ?")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| LedgerError::QueryFailed(format!("recycle messages: {e}")))?;
            }

            let created = sqlx::query(
                r#"
                INSERT INTO ledgers
                    (id, tenant_id, contact, message_count, version,
                     entities, created_at, updated_at, expires_at)
                VALUES (?, ?, ?, 1, 1, '{}', ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&id)
            .bind(key.tenant_id)
            .bind(&key.contact)
            .bind(fmt_ts(now))
            .bind(fmt_ts(now))
            .bind(&expires)
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::QueryFailed(format!("create ledger: {e}")))?
            .rows_affected();

            if created == 0 {
                tx.rollback()
                    .await
                    .map_err(|e| LedgerError::Storage(format!("rollback append: {e}")))?;
                return Ok(None);
            }
            (1, now)
        };

        sqlx::query("INSERT INTO ledger_messages (ledger_id, role, body, at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(role.as_str())
            .bind(body)
            .bind(fmt_ts(at))
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::QueryFailed(format!("insert message: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| LedgerError::Storage(format!("commit append: {e}")))?;

        Ok(Some(new_count))
    }

    async fn refresh_summary(&self, id: &str) {
        let result = self.build_summary(id).await;
        if let Err(e) = result {
            warn!("Summarization failed for ledger {id}: {e}");
        }
    }

    async fn build_summary(&self, id: &str) -> Result<(), LedgerError> {
        let previous: Option<String> = sqlx::query("SELECT summary FROM ledgers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::QueryFailed(format!("read summary: {e}")))?
            .and_then(|row| row.get("summary"));

        let window = self
            .tail_messages(id, self.settings.summary_source_window as usize)
            .await?;

        let summary = self
            .summarizer
            .summarize(&window, previous.as_deref())
            .await?;

        sqlx::query("UPDATE ledgers SET summary = ? WHERE id = ?")
            .bind(&summary)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| LedgerError::QueryFailed(format!("store summary: {e}")))?;

        debug!("Refreshed summary for ledger {id}");
        Ok(())
    }

    /// The most recent `limit` messages for `id`, oldest first. No liveness
    /// check; callers gate on the ledger row themselves.
    async fn tail_messages(&self, id: &str, limit: usize) -> Result<Vec<LedgerMessage>, LedgerError> {
        let rows = sqlx::query(
            "SELECT role, body, at FROM ledger_messages
             WHERE ledger_id = ? ORDER BY iid DESC LIMIT ?",
        )
        .bind(id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::QueryFailed(format!("read messages: {e}")))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows.into_iter().rev() {
            let role: String = row.get("role");
            messages.push(LedgerMessage {
                role: role.parse()?,
                body: row.get("body"),
                at: parse_ts(row.get("at"))?,
            });
        }
        Ok(messages)
    }

    /// Fetch the ledger row only if it is still live.
    async fn live_row(&self, id: &str) -> Result<Option<sqlx::sqlite::SqliteRow>, LedgerError> {
        sqlx::query("SELECT summary, entities FROM ledgers WHERE id = ? AND expires_at > ?")
            .bind(id)
            .bind(fmt_ts(Utc::now()))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::QueryFailed(format!("read ledger: {e}")))
    }
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    fn name(&self) -> &str {
        "sqlite"
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
        let id = key.to_string();

        let mut new_count = None;
        for attempt in 0..self.settings.append_retries {
            match self.try_append(&key, role, body).await? {
                Some(count) => {
                    new_count = Some(count);
                    break;
                }
                None => debug!("Append race on ledger {id}, attempt {attempt}"),
            }
        }
        let new_count = new_count.ok_or(LedgerError::Conflict {
            retries: self.settings.append_retries,
        })?;

        let interval = i64::from(self.settings.summarize_every);
        let triggered_summary = new_count % interval == 0;
        if triggered_summary {
            self.refresh_summary(&id).await;
        }

        let messages = self.tail_messages(&id, self.settings.recent_window).await?;
        Ok(AppendResult {
            messages,
            triggered_summary,
        })
    }

    async fn recent_messages(
        &self,
        tenant_id: i64,
        contact_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerMessage>, LedgerError> {
        let id = LedgerKey::new(tenant_id, contact_id).to_string();
        if self.live_row(&id).await?.is_none() {
            return Ok(Vec::new());
        }
        self.tail_messages(&id, limit).await
    }

    async fn summary(
        &self,
        tenant_id: i64,
        contact_id: &str,
    ) -> Result<Option<String>, LedgerError> {
        let id = LedgerKey::new(tenant_id, contact_id).to_string();
        let Some(row) = self.live_row(&id).await? else {
            return Ok(None);
        };
        let summary: Option<String> = row.get("summary");
        Ok(summary.filter(|s| !s.is_empty()))
    }

    async fn entities(
        &self,
        tenant_id: i64,
        contact_id: &str,
    ) -> Result<Option<serde_json::Map<String, serde_json::Value>>, LedgerError> {
        let id = LedgerKey::new(tenant_id, contact_id).to_string();
        let Some(row) = self.live_row(&id).await? else {
            return Ok(None);
        };
        let raw: String = row.get("entities");
        let entities: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)
            .map_err(|e| LedgerError::Storage(format!("corrupt entities for {id}: {e}")))?;
        if entities.is_empty() {
            Ok(None)
        } else {
            Ok(Some(entities))
        }
    }

    async fn update_entities(
        &self,
        tenant_id: i64,
        contact_id: &str,
        entities: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), LedgerError> {
        let id = LedgerKey::new(tenant_id, contact_id).to_string();
        let Some(row) = self.live_row(&id).await? else {
            debug!("Skipping entity update for absent ledger {id}");
            return Ok(());
        };
        let raw: String = row.get("entities");
        let mut merged: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)
            .map_err(|e| LedgerError::Storage(format!("corrupt entities for {id}: {e}")))?;
        merged.extend(entities);

        let encoded = serde_json::to_string(&merged)
            .map_err(|e| LedgerError::Storage(format!("encode entities: {e}")))?;
        sqlx::query("UPDATE ledgers SET entities = ? WHERE id = ?")
            .bind(encoded)
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(|e| LedgerError::QueryFailed(format!("store entities: {e}")))?;
        Ok(())
    }

    async fn delete_ledger(&self, tenant_id: i64, contact_id: &str) -> Result<(), LedgerError> {
        let id = LedgerKey::new(tenant_id, contact_id).to_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::Storage(format!("begin delete: {e}")))?;
        sqlx::query("DELETE FROM ledger_messages WHERE ledger_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::QueryFailed(format!("delete messages: {e}")))?;
        sqlx::query("DELETE FROM ledgers WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::QueryFailed(format!("delete ledger: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| LedgerError::Storage(format!("commit delete: {e}")))?;
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize, LedgerError> {
        let now = fmt_ts(Utc::now());
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::Storage(format!("begin sweep: {e}")))?;
        sqlx::query(
            "DELETE FROM ledger_messages WHERE ledger_id IN
             (SELECT id FROM ledgers WHERE expires_at <= ?)",
        )
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| LedgerError::QueryFailed(format!("sweep messages: {e}")))?;
        let removed = sqlx::query("DELETE FROM ledgers WHERE expires_at <= ?")
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::QueryFailed(format!("sweep ledgers: {e}")))?
            .rows_affected();
        tx.commit()
            .await
            .map_err(|e| LedgerError::Storage(format!("commit sweep: {e}")))?;
        if removed > 0 {
            info!("Swept {removed} expired ledgers");
        }
        Ok(removed as usize)
    }
}

/// Fixed-width RFC 3339 with millisecond precision, so stored timestamps
/// compare correctly as text.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::Storage(format!("corrupt timestamp '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarizer::NaiveSummarizer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn open_with(
        dir: &TempDir,
        settings: LedgerSettings,
        summarizer: Arc<dyn Summarizer>,
    ) -> SqliteLedger {
        let path = dir.path().join("ledger.db");
        SqliteLedger::new(&format!("sqlite://{}", path.display()), settings, summarizer)
            .await
            .unwrap()
    }

    async fn open(dir: &TempDir, settings: LedgerSettings) -> SqliteLedger {
        open_with(dir, settings, Arc::new(NaiveSummarizer)).await
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
    async fn append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, LedgerSettings::default()).await;

        store
            .append(1, "+55 (11) 98765-4321", LedgerRole::User, "hello")
            .await
            .unwrap();
        store
            .append(1, "5511987654321", LedgerRole::Agent, "hi, how can I help?")
            .await
            .unwrap();

        // Both formats normalize to the same ledger.
        let messages = store.recent_messages(1, "5511987654321", 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, LedgerRole::User);
        assert_eq!(messages[0].body, "hello");
        assert_eq!(messages[1].role, LedgerRole::Agent);
        assert!(messages[0].at <= messages[1].at);
    }

    #[tokio::test]
    async fn empty_body_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, LedgerSettings::default()).await;
        let err = store
            .append(1, "551100", LedgerRole::User, "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, LedgerSettings::default()).await;
        store
            .append(1, "551100", LedgerRole::User, "tenant one")
            .await
            .unwrap();
        assert!(store.recent_messages(2, "551100", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summary_triggers_on_interval() {
        let dir = TempDir::new().unwrap();
        let settings = LedgerSettings {
            summarize_every: 5,
            ..LedgerSettings::default()
        };
        let store = open(&dir, settings).await;

        for i in 1..=4 {
            let result = store
                .append(1, "551100", LedgerRole::User, &format!("message {i}"))
                .await
                .unwrap();
            assert!(!result.triggered_summary);
        }
        assert!(store.summary(1, "551100").await.unwrap().is_none());

        let result = store
            .append(1, "551100", LedgerRole::Agent, "message 5")
            .await
            .unwrap();
        assert!(result.triggered_summary);
        let summary = store.summary(1, "551100").await.unwrap().unwrap();
        assert!(summary.contains("5 messages"));
    }

    #[tokio::test]
    async fn concurrent_appends_all_land() {
        let dir = TempDir::new().unwrap();
        let summarizer = Arc::new(CountingSummarizer::default());
        let store = Arc::new(
            open_with(
                &dir,
                LedgerSettings::default(),
                Arc::clone(&summarizer) as Arc<dyn Summarizer>,
            )
            .await,
        );

        let mut handles = Vec::new();
        for i in 0..45 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append(7, "551199", LedgerRole::User, &format!("msg {i}"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let messages = store.recent_messages(7, "551199", 100).await.unwrap();
        assert_eq!(messages.len(), 45);
        // Timestamps never go backwards within a ledger.
        for pair in messages.windows(2) {
            assert!(pair[0].at <= pair[1].at);
        }
        // Exactly one append saw count 20 and one saw count 40.
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 2);
        assert!(store.summary(7, "551199").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_ledger_reads_empty_and_recycles_on_write() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, LedgerSettings::default()).await;
        store
            .append(1, "551100", LedgerRole::User, "old conversation")
            .await
            .unwrap();

        // Force expiry.
        sqlx::query("UPDATE ledgers SET expires_at = ?")
            .bind(fmt_ts(Utc::now() - chrono::Duration::days(1)))
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(store.recent_messages(1, "551100", 10).await.unwrap().is_empty());
        assert!(store.summary(1, "551100").await.unwrap().is_none());

        // A write starts over instead of resurrecting the dead history.
        store
            .append(1, "551100", LedgerRole::User, "fresh start")
            .await
            .unwrap();
        let messages = store.recent_messages(1, "551100", 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "fresh start");
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, LedgerSettings::default()).await;
        store
            .append(1, "551100", LedgerRole::User, "stale")
            .await
            .unwrap();
        store
            .append(1, "551199", LedgerRole::User, "live")
            .await
            .unwrap();

        sqlx::query("UPDATE ledgers SET expires_at = ? WHERE contact = '551100'")
            .bind(fmt_ts(Utc::now() - chrono::Duration::hours(1)))
            .execute(&store.pool)
            .await
            .unwrap();

        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert!(store.recent_messages(1, "551199", 10).await.unwrap().len() == 1);

        let orphans: i64 = sqlx::query("SELECT COUNT(*) AS n FROM ledger_messages")
            .fetch_one(&store.pool)
            .await
            .map(|row| row.get("n"))
            .unwrap();
        assert_eq!(orphans, 1);
    }

    #[tokio::test]
    async fn entities_merge_not_replace() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, LedgerSettings::default()).await;
        store
            .append(1, "551100", LedgerRole::User, "hi")
            .await
            .unwrap();

        let mut first = serde_json::Map::new();
        first.insert("name".into(), serde_json::json!("Ana"));
        store.update_entities(1, "551100", first).await.unwrap();

        let mut second = serde_json::Map::new();
        second.insert("order".into(), serde_json::json!(4412));
        store.update_entities(1, "551100", second).await.unwrap();

        let entities = store.entities(1, "551100").await.unwrap().unwrap();
        assert_eq!(entities["name"], serde_json::json!("Ana"));
        assert_eq!(entities["order"], serde_json::json!(4412));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, LedgerSettings::default()).await;
        store
            .append(1, "551100", LedgerRole::User, "hi")
            .await
            .unwrap();
        store.delete_ledger(1, "551100").await.unwrap();
        store.delete_ledger(1, "551100").await.unwrap();
        assert!(store.recent_messages(1, "551100", 10).await.unwrap().is_empty());
    }
}
