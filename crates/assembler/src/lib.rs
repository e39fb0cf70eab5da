//! Context assembly for Attune.
//!
//! [`ContextAssembler`] orchestrates the ledger, example, and knowledge-link
//! stores into one outbound inference request per turn, and persists the
//! outcome once the reply comes back. Audit records flow through a buffered
//! background writer so they never sit on the response path.

pub mod assembler;
pub mod audit_store;
pub mod audit_writer;

pub use assembler::{AssemblerSettings, ContextAssembler, TurnError};
pub use audit_store::InMemoryAudit;
#[cfg(feature = "sqlite")]
pub use audit_store::SqliteAudit;
pub use audit_writer::AuditWriter;
