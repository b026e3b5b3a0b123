//! SQLite backend.
//!
//! Executes generated SQL against a `resources` / `search_index` schema over an
//! r2d2 connection pool. Rows are read on a blocking thread and streamed to the
//! async cursor through a bounded channel.

mod schema;
mod store;

pub use schema::{SCHEMA_VERSION, initialize_schema};
pub use store::{SqliteResourceStore, SqliteStoreConfig};
