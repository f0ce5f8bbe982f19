//! Persistence backends for Loupe.
//!
//! Implements the `loupe-core` storage traits:
//! - [`InMemoryStore`] — sessions, messages, and usage events in process
//!   memory; the default for tests and ephemeral runs.
//! - [`InMemoryKnowledgeStore`] — a seedable knowledge-store fixture with
//!   substring-scored search.
//! - `SqliteStore` — durable storage via `sqlx` (feature `sqlite`, on by
//!   default).

pub mod in_memory;
pub mod knowledge;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;
pub use knowledge::InMemoryKnowledgeStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
