//! Conversation ledger backends for Attune.
//!
//! Implements [`attune_core::LedgerStore`] twice: a SQLite backend for
//! production and an in-memory backend for tests and ephemeral runs. Both
//! share the same append semantics: TTL refresh on every write, periodic
//! summarization, and reads that treat expired ledgers as absent.

pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod summarizer;

pub use in_memory::InMemoryLedger;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedger;
pub use summarizer::{NaiveSummarizer, Summarizer};

/// Tunables shared by every ledger backend.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Days a ledger survives after its last write.
    pub retention_days: u32,

    /// Summarize once every N appended messages.
    pub summarize_every: u32,

    /// How many of the most recent messages feed the summarizer.
    pub summary_source_window: u32,

    /// Message window returned from a successful append.
    pub recent_window: usize,

    /// Retry budget for conflicted appends.
    pub append_retries: u32,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            retention_days: 30,
            summarize_every: 20,
            summary_source_window: 100,
            recent_window: 10,
            append_retries: 5,
        }
    }
}

impl LedgerSettings {
    pub(crate) fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}
