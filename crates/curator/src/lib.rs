//! Feedback example backends for Attune.
//!
//! Implements [`attune_core::ExampleStore`] over SQLite and process memory.
//! All normalization rules live in `attune_core::feedback`; the stores here
//! only persist, filter, and order.

pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryExamples;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteExamples;
