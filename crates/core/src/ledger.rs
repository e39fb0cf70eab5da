//! Conversation ledger — the per-contact message history.
//!
//! One ledger exists per (tenant, contact) pair. It is append-only, carries a
//! rolling summary and tracked entities, and expires 30 days after the last
//! write. Implementations: SQLite (production), in-memory (tests and
//! ephemeral deployments).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Who sent a ledger message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerRole {
    /// The end user (contact)
    User,
    /// The conversational agent
    Agent,
}

impl LedgerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerRole::User => "user",
            LedgerRole::Agent => "agent",
        }
    }
}

impl std::str::FromStr for LedgerRole {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(LedgerRole::User),
            "agent" => Ok(LedgerRole::Agent),
            other => Err(LedgerError::InvalidInput(format!(
                "unknown ledger role: '{other}'"
            ))),
        }
    }
}

/// A single message in a conversation ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerMessage {
    /// Who sent this message
    pub role: LedgerRole,

    /// The text content
    pub body: String,

    /// When it was appended (non-decreasing within a ledger)
    pub at: DateTime<Utc>,
}

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct AppendResult {
    /// The recent message window after the append (most-recent-last).
    pub messages: Vec<LedgerMessage>,

    /// Whether this append crossed a summarization threshold.
    pub triggered_summary: bool,
}

/// The deterministic key identifying one conversation ledger.
///
/// Two callers presenting the same logical contact in different formats
/// (`"+55 (11) 98765-4321"` vs `"5511987654321"`) resolve to the same key:
/// normalization strips every non-digit character from the contact id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub tenant_id: i64,
    pub contact: String,
}

impl LedgerKey {
    pub fn new(tenant_id: i64, contact_id: &str) -> Self {
        let contact: String = contact_id.chars().filter(|c| c.is_ascii_digit()).collect();
        Self { tenant_id, contact }
    }
}

impl std::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.tenant_id, self.contact)
    }
}

/// The core LedgerStore trait.
///
/// Every operation is tenant-scoped; the contact id is normalized internally
/// via [`LedgerKey`]. Reads against a missing or expired ledger return empty
/// results, never errors. Writes against an expired ledger start a fresh one.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Append a message, refresh the TTL, and trigger summarization when the
    /// post-append count crosses a multiple of the summarize interval.
    ///
    /// Fails with `InvalidInput` if `body` is empty. Concurrent appends to
    /// the same key are serialized; `Conflict` surfaces only after the
    /// internal retry budget is exhausted.
    async fn append(
        &self,
        tenant_id: i64,
        contact_id: &str,
        role: LedgerRole,
        body: &str,
    ) -> Result<AppendResult, LedgerError>;

    /// The most recent `limit` messages, oldest first.
    async fn recent_messages(
        &self,
        tenant_id: i64,
        contact_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerMessage>, LedgerError>;

    /// The stored conversation summary, if one has been generated.
    async fn summary(
        &self,
        tenant_id: i64,
        contact_id: &str,
    ) -> Result<Option<String>, LedgerError>;

    /// Tracked entities for this conversation.
    async fn entities(
        &self,
        tenant_id: i64,
        contact_id: &str,
    ) -> Result<Option<serde_json::Map<String, serde_json::Value>>, LedgerError>;

    /// Merge (not replace) tracked entities into the ledger.
    async fn update_entities(
        &self,
        tenant_id: i64,
        contact_id: &str,
        entities: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), LedgerError>;

    /// Explicitly purge a ledger. Idempotent.
    async fn delete_ledger(&self, tenant_id: i64, contact_id: &str) -> Result<(), LedgerError>;

    /// Physically remove expired ledgers. Returns how many were removed.
    async fn sweep_expired(&self) -> Result<usize, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_normalization_strips_non_digits() {
        let a = LedgerKey::new(42, "+55 (11) 98765-4321");
        let b = LedgerKey::new(42, "5511987654321");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "42_5511987654321");
    }

    #[test]
    fn key_is_tenant_scoped() {
        let a = LedgerKey::new(1, "5511987654321");
        let b = LedgerKey::new(2, "5511987654321");
        assert_ne!(a, b);
    }

    #[test]
    fn role_round_trip() {
        assert_eq!("user".parse::<LedgerRole>().unwrap(), LedgerRole::User);
        assert_eq!("agent".parse::<LedgerRole>().unwrap(), LedgerRole::Agent);
        assert!("system".parse::<LedgerRole>().is_err());
    }

    #[test]
    fn message_serialization() {
        let msg = LedgerMessage {
            role: LedgerRole::User,
            body: "Hello there".into(),
            at: Utc::now(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"role\":\"user\""));
        assert!(json.contains("Hello there"));
    }
}
