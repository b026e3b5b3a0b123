//! Search bookkeeping and result caching.
//!
//! - [`SearchCache`] tracks every search, its status and its single producer
//! - [`ResultCache`] stores the materialized identifiers in append-only batches
//! - [`KeyValueStore`] is the backing both persist through

mod kv;
mod result_cache;
mod search_cache;

pub use kv::{KeyValueStore, MemoryKvStore};
pub use result_cache::{ResultCache, ResultProgress};
pub use search_cache::{PRODUCER_LOST, Registration, SearchCache, TaskHandle};
