//! Error types for the Attune domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Attune operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Ledger errors ---
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    // --- Curator errors ---
    #[error("Curator error: {0}")]
    Curator(#[from] CuratorError),

    // --- Knowledge link errors ---
    #[error("Knowledge error: {0}")]
    Knowledge(#[from] KnowledgeError),

    // --- Audit errors ---
    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    // --- Inference boundary errors ---
    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Concurrent append conflict after {retries} retries")]
    Conflict { retries: u32 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Error)]
pub enum CuratorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Example not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Audit channel closed")]
    ChannelClosed,

    #[error("Audit buffer full")]
    BufferFull,

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("Inference service unreachable: {0}")]
    Unavailable(String),

    #[error("Inference request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Inference API error: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },
}
