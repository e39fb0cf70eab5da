//! Knowledge link backends for Attune.
//!
//! Implements [`attune_core::KnowledgeLinkStore`]: which document ids an
//! agent may draw on. Replace-all writes are atomic; readers never observe
//! a half-replaced set.

pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryLinks;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLinks;
