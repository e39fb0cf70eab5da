//! Buffered, best-effort audit writing.
//!
//! Turns submit records into a bounded channel; a background task drains it
//! and writes through an [`AuditStore`], retrying each record a few times
//! before logging a terminal failure. Nothing here can fail or block a turn.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use attune_core::audit::{AuditRecord, AuditStore};

/// Handle for submitting audit records to the background writer.
#[derive(Clone)]
pub struct AuditWriter {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditWriter {
    /// Spawn the writer task. `buffer` bounds the in-flight queue; `retries`
    /// is the per-record write budget.
    pub fn spawn(
        store: Arc<dyn AuditStore>,
        buffer: usize,
        retries: u32,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(buffer.max(1));
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                write_with_retries(store.as_ref(), &record, retries).await;
            }
            debug!("Audit writer shutting down");
        });
        (Self { tx }, handle)
    }

    /// Submit one record. Never blocks; a full or closed channel is logged
    /// as a terminal failure for that record.
    pub fn submit(&self, record: AuditRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                error!("Audit buffer full, dropping record {}", record.id);
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                error!("Audit channel closed, dropping record {}", record.id);
            }
        }
    }
}

async fn write_with_retries(store: &dyn AuditStore, record: &AuditRecord, retries: u32) {
    for attempt in 1..=retries.max(1) {
        match store.append(record).await {
            Ok(()) => return,
            Err(e) if attempt < retries => {
                warn!(
                    "Audit write for {} failed (attempt {attempt}/{retries}): {e}",
                    record.id
                );
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
            }
            Err(e) => {
                error!(
                    "Dropping audit record {} after {retries} attempts: {e}",
                    record.id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_store::InMemoryAudit;
    use attune_core::error::AuditError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record() -> AuditRecord {
        AuditRecord::new(
            1,
            7,
            "551198",
            "hello",
            serde_json::json!({}),
            "hi",
            true,
            100,
            None,
            false,
        )
    }

    #[tokio::test]
    async fn records_reach_the_store() {
        let store = Arc::new(InMemoryAudit::new());
        let (writer, handle) = AuditWriter::spawn(store.clone(), 16, 3);
        writer.submit(record());
        writer.submit(record());
        drop(writer);
        handle.await.unwrap();

        let recent = store.recent(1, None, 10).await.unwrap();
        assert_eq!(recent.len(), 2);
    }

    struct FlakyAudit {
        inner: InMemoryAudit,
        failures_left: AtomicU32,
    }

    #[async_trait::async_trait]
    impl AuditStore for FlakyAudit {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(AuditError::Storage("transient".into()));
            }
            self.inner.append(record).await
        }
        async fn recent(
            &self,
            tenant_id: i64,
            agent_id: Option<i64>,
            limit: usize,
        ) -> Result<Vec<AuditRecord>, AuditError> {
            self.inner.recent(tenant_id, agent_id, limit).await
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(FlakyAudit {
            inner: InMemoryAudit::new(),
            failures_left: AtomicU32::new(2),
        });
        let (writer, handle) = AuditWriter::spawn(store.clone(), 16, 3);
        writer.submit(record());
        drop(writer);
        handle.await.unwrap();

        assert_eq!(store.recent(1, None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_drop_the_record() {
        let store = Arc::new(FlakyAudit {
            inner: InMemoryAudit::new(),
            failures_left: AtomicU32::new(100),
        });
        let (writer, handle) = AuditWriter::spawn(store.clone(), 16, 2);
        writer.submit(record());
        drop(writer);
        handle.await.unwrap();

        assert!(store.recent(1, None, 10).await.unwrap().is_empty());
    }
}
