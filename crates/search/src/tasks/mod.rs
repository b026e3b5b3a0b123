//! Background producers that materialize search results.
//!
//! A [`SearchTask`] performs the initial load of a registered search; a
//! [`ContinuationTask`] resumes a finished search that still has rows left in
//! the backend. Both run the same windowed fetch loop and report through the
//! search cache, never to the caller that launched them.

mod continuation;
mod producer;
mod search_task;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::cache::{ResultCache, SearchCache};
use crate::error::ExecutionError;
use crate::query::QueryBuilder;
use crate::store::ResourceStore;
use crate::types::SearchId;

pub use continuation::ContinuationTask;
pub use search_task::SearchTask;

/// Shared collaborators and limits every producer needs.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Backend the queries run against.
    pub store: Arc<dyn ResourceStore>,
    /// Bookkeeping of search status.
    pub search_cache: Arc<SearchCache>,
    /// Materialized identifiers.
    pub result_cache: Arc<ResultCache>,
    /// Compiles specifications for the store's dialect.
    pub builder: Arc<QueryBuilder>,
    /// Identifiers pulled from the cursor per window.
    pub batch_size: usize,
    /// Upper bound on a single backend round trip.
    pub window_timeout: Duration,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("store", &self.store.backend_name())
            .field("batch_size", &self.batch_size)
            .field("window_timeout", &self.window_timeout)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of one producer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Constructed, not yet started.
    Created,
    /// Waiting on the backend.
    Fetching,
    /// At least one batch appended; loops back to `Fetching`.
    BatchWritten,
    /// Load finished; the search is `FINISHED`.
    Complete,
    /// Backend or consistency failure; the search is `FAILED`.
    Failed,
    /// Stopped on request; the search is `CANCELLED`.
    Cancelled,
}

impl TaskState {
    /// Returns true for `Complete`, `Failed` and `Cancelled`.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TaskState::Complete | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::Fetching => "fetching",
            TaskState::BatchWritten => "batch-written",
            TaskState::Complete => "complete",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Spawns a producer and records a panic inside it as a failed search.
pub(crate) fn spawn_supervised<F>(
    search_cache: Arc<SearchCache>,
    search_id: SearchId,
    task: F,
) -> JoinHandle<TaskState>
where
    F: Future<Output = TaskState> + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::spawn(task).await {
            Ok(state) => state,
            Err(e) => {
                let cause = ExecutionError::Aborted {
                    message: e.to_string(),
                };
                error!(search_id = %search_id, error = %cause, "Search task aborted");
                if let Err(e) = search_cache.fail(&search_id, cause.to_string()) {
                    warn!(search_id = %search_id, error = %e, "Failed to record aborted task");
                }
                TaskState::Failed
            }
        }
    })
}
