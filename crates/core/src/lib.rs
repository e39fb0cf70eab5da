//! # Attune Core
//!
//! Domain types, traits, and error definitions for the Attune context
//! pipeline. This crate has **zero framework dependencies** — it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every store is defined as a trait here. Implementations (SQLite,
//! in-memory) live in their respective crates. This enables:
//! - Swapping the backing store without touching assembly logic
//! - Easy testing with in-memory implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod audit;
pub mod error;
pub mod feedback;
pub mod inference;
pub mod knowledge;
pub mod ledger;

// Re-export key types at crate root for ergonomics
pub use audit::{AuditRecord, AuditStore};
pub use error::{Error, Result};
pub use feedback::{
    ExampleStore, FeedbackExample, FeedbackFilter, FeedbackInput, FeedbackPatch, FeedbackType,
};
pub use inference::{InferenceOutcome, InferenceService};
pub use knowledge::KnowledgeLinkStore;
pub use ledger::{AppendResult, LedgerKey, LedgerMessage, LedgerRole, LedgerStore};
