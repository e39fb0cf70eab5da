//! SQLite feedback example store.
//!
//! One table, indexed for the ranked few-shot query. Ordering is fully
//! deterministic: priority descending, then `created_at` descending, then id
//! descending, so two reads over the same rows always agree.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use attune_core::error::CuratorError;
use attune_core::feedback::{
    self, ExamplesExport, ExampleStore, ExportedExample, FeedbackExample, FeedbackFilter,
    FeedbackInput, FeedbackPage, FeedbackPatch,
};

/// Production SQLite example store.
pub struct SqliteExamples {
    pool: SqlitePool,
}

impl SqliteExamples {
    /// Open (or create) a SQLite example database at `path`.
    pub async fn new(path: &str) -> Result<Self, CuratorError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| CuratorError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| CuratorError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite example store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for sharing one database file).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, CuratorError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), CuratorError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feedback_examples (
                id                 TEXT PRIMARY KEY,
                tenant_id          INTEGER NOT NULL,
                agent_id           INTEGER NOT NULL,
                team_id            INTEGER,
                user_message       TEXT NOT NULL,
                agent_response     TEXT NOT NULL,
                corrected_response TEXT,
                feedback_type      TEXT NOT NULL,
                rating             INTEGER,
                notes              TEXT,
                priority           INTEGER NOT NULL,
                used_in_prompt     INTEGER NOT NULL,
                context            TEXT,
                created_at         TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CuratorError::MigrationFailed(format!("feedback_examples table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_examples_ranked
             ON feedback_examples(tenant_id, agent_id, used_in_prompt, priority)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CuratorError::MigrationFailed(format!("ranked index: {e}")))?;

        Ok(())
    }

    async fn fetch(&self, id: &str, tenant_id: i64) -> Result<FeedbackExample, CuratorError> {
        let row = sqlx::query("SELECT * FROM feedback_examples WHERE id = ? AND tenant_id = ?")
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CuratorError::QueryFailed(format!("fetch example: {e}")))?;
        match row {
            Some(row) => row_to_example(&row),
            None => Err(CuratorError::NotFound(format!("feedback example {id}"))),
        }
    }

    async fn write(&self, ex: &FeedbackExample) -> Result<(), CuratorError> {
        let context = match &ex.context {
            Some(value) => Some(
                serde_json::to_string(value)
                    .map_err(|e| CuratorError::Storage(format!("encode context: {e}")))?,
            ),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO feedback_examples
                (id, tenant_id, agent_id, team_id, user_message, agent_response,
                 corrected_response, feedback_type, rating, notes, priority,
                 used_in_prompt, context, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                corrected_response = excluded.corrected_response,
                feedback_type = excluded.feedback_type,
                rating = excluded.rating,
                notes = excluded.notes,
                priority = excluded.priority,
                used_in_prompt = excluded.used_in_prompt
            "#,
        )
        .bind(&ex.id)
        .bind(ex.tenant_id)
        .bind(ex.agent_id)
        .bind(ex.team_id)
        .bind(&ex.user_message)
        .bind(&ex.agent_response)
        .bind(&ex.corrected_response)
        .bind(ex.feedback_type.as_str())
        .bind(ex.rating.map(i64::from))
        .bind(&ex.notes)
        .bind(i64::from(ex.priority))
        .bind(ex.used_in_prompt)
        .bind(context)
        .bind(fmt_ts(ex.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| CuratorError::QueryFailed(format!("write example: {e}")))?;
        Ok(())
    }

    async fn ranked_rows(
        &self,
        tenant_id: i64,
        agent_id: i64,
        limit: usize,
    ) -> Result<Vec<FeedbackExample>, CuratorError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM feedback_examples
            WHERE tenant_id = ? AND agent_id = ?
              AND used_in_prompt = 1
              AND feedback_type IN ('approved', 'corrected')
            ORDER BY priority DESC, created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(tenant_id)
        .bind(agent_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CuratorError::QueryFailed(format!("ranked examples: {e}")))?;
        rows.iter().map(row_to_example).collect()
    }
}

#[async_trait]
impl ExampleStore for SqliteExamples {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn record(&self, input: FeedbackInput) -> Result<FeedbackExample, CuratorError> {
        let example = feedback::normalize(input)?;
        self.write(&example).await?;
        debug!(
            "Recorded {} feedback {} for agent {}",
            example.feedback_type.as_str(),
            example.id,
            example.agent_id
        );
        Ok(example)
    }

    async fn update(
        &self,
        id: &str,
        tenant_id: i64,
        patch: FeedbackPatch,
    ) -> Result<FeedbackExample, CuratorError> {
        let current = self.fetch(id, tenant_id).await?;
        let updated = feedback::apply_patch(current, patch)?;
        self.write(&updated).await?;
        Ok(updated)
    }

    async fn ranked_examples(
        &self,
        tenant_id: i64,
        agent_id: i64,
        limit: usize,
    ) -> Result<Vec<FeedbackExample>, CuratorError> {
        self.ranked_rows(tenant_id, agent_id, limit).await
    }

    async fn export(
        &self,
        tenant_id: i64,
        agent_id: i64,
        limit: usize,
    ) -> Result<ExamplesExport, CuratorError> {
        let examples = self.ranked_rows(tenant_id, agent_id, limit).await?;
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
        let mut count_query: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS n FROM feedback_examples");
        let mut page_query: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT * FROM feedback_examples");

        for builder in [&mut count_query, &mut page_query] {
            builder.push(" WHERE tenant_id = ").push_bind(tenant_id);
            if let Some(agent_id) = filter.agent_id {
                builder.push(" AND agent_id = ").push_bind(agent_id);
            }
            if let Some(team_id) = filter.team_id {
                builder.push(" AND team_id = ").push_bind(team_id);
            }
            if let Some(ft) = filter.feedback_type {
                builder.push(" AND feedback_type = ").push_bind(ft.as_str());
            }
            if let Some(used) = filter.used_in_prompt {
                builder.push(" AND used_in_prompt = ").push_bind(used);
            }
        }

        let total: i64 = count_query
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| CuratorError::QueryFailed(format!("count examples: {e}")))?
            .get("n");

        page_query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(filter.limit as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset as i64);

        let rows = page_query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CuratorError::QueryFailed(format!("list examples: {e}")))?;

        Ok(FeedbackPage {
            examples: rows.iter().map(row_to_example).collect::<Result<_, _>>()?,
            total: total as usize,
        })
    }

    async fn remove(&self, id: &str, tenant_id: i64) -> Result<(), CuratorError> {
        let removed = sqlx::query("DELETE FROM feedback_examples WHERE id = ? AND tenant_id = ?")
            .bind(id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CuratorError::QueryFailed(format!("remove example: {e}")))?
            .rows_affected();
        if removed == 0 {
            return Err(CuratorError::NotFound(format!("feedback example {id}")));
        }
        Ok(())
    }
}

fn row_to_example(row: &SqliteRow) -> Result<FeedbackExample, CuratorError> {
    let feedback_type: String = row.get("feedback_type");
    let context: Option<String> = row.get("context");
    let context = match context {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| CuratorError::Storage(format!("corrupt context: {e}")))?,
        ),
        None => None,
    };
    Ok(FeedbackExample {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        agent_id: row.get("agent_id"),
        team_id: row.get("team_id"),
        user_message: row.get("user_message"),
        agent_response: row.get("agent_response"),
        corrected_response: row.get("corrected_response"),
        feedback_type: feedback_type.parse()?,
        rating: row.get::<Option<i64>, _>("rating").map(|r| r as u8),
        notes: row.get("notes"),
        priority: row.get::<i64, _>("priority") as i32,
        used_in_prompt: row.get("used_in_prompt"),
        context,
        created_at: parse_ts(row.get("created_at"))?,
    })
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, CuratorError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CuratorError::Storage(format!("corrupt timestamp '{raw}': {e}")))
}
