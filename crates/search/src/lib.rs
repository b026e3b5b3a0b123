//! Helios Search Coordination
//!
//! This crate executes structured searches against a resource store in the
//! background, materializes the matching record identifiers into a result
//! cache, and serves them back in pages, possibly long after the search was
//! started and while it is still growing.
//!
//! # Features
//!
//! - **Dialect-aware query generation**: SQLite, PostgreSQL, SQL Server,
//!   Oracle, Derby and legacy `TOP`-only databases
//! - **Background producers**: bounded windows, per-window timeouts,
//!   cooperative cancellation
//! - **Single producer per search**: identical concurrent requests share one
//!   search, and continuations go through the same claim
//! - **Deterministic paging**: contiguous, append-only batches and opaque
//!   page tokens
//!
//! # Backend Features
//!
//! - `sqlite` (default) - SQLite resource store over an r2d2 pool
//!
//! # Architecture
//!
//! - [`query`] - Parameter catalog, dialect table and query builder
//! - [`cache`] - Search bookkeeping and materialized results over a key-value backing
//! - [`tasks`] - Search and continuation producers
//! - [`paging`] - Page reads that launch continuations on demand
//! - [`coordinator`] - The entry point combining all of the above
//! - [`store`] / [`backends`] - The resource store contract and bundled stores
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use helios_search::backends::{IndexValue, MemoryResourceStore, StoredRecord};
//! use helios_search::context::SearchContext;
//! use helios_search::types::{SearchPredicate, SearchSpecification};
//! use helios_search::{SearchConfig, SearchCoordinator};
//!
//! # async fn run() -> Result<(), helios_search::SearchError> {
//! let store = Arc::new(MemoryResourceStore::new());
//! store.insert(
//!     StoredRecord::new("Observation", "obs-1")
//!         .with_index("code", IndexValue::token(Some("http://loinc.org"), "8867-4")),
//! );
//!
//! let coordinator = SearchCoordinator::new(store, SearchConfig::default())?;
//! let spec = SearchSpecification::new("Observation")
//!     .with_predicate(SearchPredicate::eq("code", "http://loinc.org|8867-4"));
//!
//! let id = coordinator.start_search(spec, &SearchContext::new()).await?;
//! let page = coordinator.get_page(&id, 0, 20).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod backends;
pub mod cache;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod paging;
pub mod query;
pub mod store;
pub mod tasks;
pub mod types;

pub use config::SearchConfig;
pub use context::{CacheControl, SearchContext};
pub use coordinator::SearchCoordinator;
pub use error::{SearchError, SearchResult};
pub use paging::PagingProvider;
pub use store::{RecordCursor, ResourceStore};
pub use types::{Page, PageToken, SearchEntry, SearchId, SearchSpecification, SearchStatus};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initializes logging with the given level.
///
/// `RUST_LOG` overrides the level when set.
pub fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("helios_search={}", level)));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
