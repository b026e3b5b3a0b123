//! Resource store contract.
//!
//! The search engine never reads or writes domain records. It only asks a
//! [`ResourceStore`] to execute a [`GeneratedQuery`] and streams the matching
//! identifiers out of the returned [`RecordCursor`].

use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::query::{BackendDialect, GeneratedQuery};

/// A forward-only stream of record identifiers in backend order.
#[async_trait]
pub trait RecordCursor: Send {
    /// Fetches up to `max` further identifiers.
    ///
    /// An empty vector means the cursor is exhausted.
    ///
    /// # Errors
    ///
    /// * `StoreError::QueryFailed` - If the backend failed mid-stream
    async fn next_batch(&mut self, max: usize) -> StoreResult<Vec<String>>;
}

/// A backend able to execute generated queries.
#[async_trait]
pub trait ResourceStore: Send + Sync + Debug {
    /// Returns a short name for logging.
    fn backend_name(&self) -> &'static str;

    /// Returns the SQL dialect queries for this store must target.
    fn dialect(&self) -> BackendDialect;

    /// Executes an identifier query and returns a cursor over its rows.
    ///
    /// # Arguments
    ///
    /// * `query` - A query built for [`ResourceStore::dialect`]
    ///
    /// # Errors
    ///
    /// * `StoreError::ConnectionFailed` - If no connection could be acquired
    /// * `StoreError::QueryFailed` - If the statement was rejected
    async fn execute_query(&self, query: GeneratedQuery) -> StoreResult<Box<dyn RecordCursor>>;

    /// Executes a count query and returns the number of matches.
    async fn count(&self, query: GeneratedQuery) -> StoreResult<u64>;
}

/// A cursor over identifiers already held in memory.
#[derive(Debug, Default)]
pub struct VecCursor {
    ids: std::vec::IntoIter<String>,
}

impl VecCursor {
    /// Creates a cursor yielding `ids` in order.
    pub fn new(ids: Vec<String>) -> Self {
        Self {
            ids: ids.into_iter(),
        }
    }
}

#[async_trait]
impl RecordCursor for VecCursor {
    async fn next_batch(&mut self, max: usize) -> StoreResult<Vec<String>> {
        Ok(self.ids.by_ref().take(max).collect())
    }
}
