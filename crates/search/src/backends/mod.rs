//! Bundled [`ResourceStore`](crate::store::ResourceStore) implementations.
//!
//! - [`MemoryResourceStore`] evaluates specifications in process and supports
//!   latency and failure injection.
//! - `SqliteResourceStore` (feature `sqlite`) executes the generated SQL.

mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{FailurePlan, IndexValue, MemoryResourceStore, StoredRecord};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteResourceStore, SqliteStoreConfig};
