//! Error types for the search coordination layer.
//!
//! Errors are grouped by when they surface: build-time errors are returned
//! synchronously before any task is launched, bookkeeping errors tell the
//! caller the search must be re-issued, execution errors are recorded on the
//! failed search, and consistency errors indicate a broken single-producer
//! invariant.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use thiserror::Error;

use crate::types::{SearchId, SearchStatus};

/// The primary error type for all search coordination operations.
#[derive(Error, Debug)]
pub enum SearchError {
    /// Query generation errors
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Search bookkeeping errors
    #[error(transparent)]
    Bookkeeping(#[from] BookkeepingError),

    /// Background execution errors
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Result cache consistency errors
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    /// Resource store and cache backing errors
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised while compiling a search specification into a query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The predicate/operator combination has no backend representation.
    #[error("unsupported predicate on '{parameter}': {reason}")]
    UnsupportedPredicate { parameter: String, reason: String },

    /// The sort field is unknown or not sortable.
    #[error("invalid sort on '{parameter}': {reason}")]
    InvalidSort { parameter: String, reason: String },

    /// The specification itself is malformed.
    #[error("invalid search specification: {message}")]
    InvalidSpecification { message: String },

    /// A catalog parameter code is not a safe SQL literal.
    #[error("invalid parameter code: '{code}'")]
    InvalidParameterCode { code: String },
}

/// Errors related to search bookkeeping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookkeepingError {
    /// The search identifier is absent from the search cache.
    #[error("unknown search: {search_id}")]
    UnknownSearch { search_id: SearchId },

    /// The search was evicted and must be re-issued.
    #[error("search expired: {search_id}")]
    SearchExpired { search_id: SearchId },

    /// A status change would move a search backwards.
    #[error("illegal status transition for {search_id}: {from} -> {to}")]
    IllegalTransition {
        search_id: SearchId,
        from: SearchStatus,
        to: SearchStatus,
    },

    /// The supplied page token could not be decoded.
    #[error("invalid page token: {token}")]
    InvalidPageToken { token: String },
}

/// Errors raised while a search task executes against the backend.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// A window fetch exceeded the configured maximum.
    #[error("window fetch timed out after {timeout_ms}ms")]
    WindowTimeout { timeout_ms: u64 },

    /// The backend reported a failure.
    #[error(transparent)]
    Backend(#[from] StoreError),

    /// The task was aborted before it could record an outcome.
    #[error("search task aborted: {message}")]
    Aborted { message: String },
}

/// Errors indicating a broken single-producer invariant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    /// A batch did not start where the previous batch ended.
    #[error("out of order batch for {search_id}: expected offset {expected}, got {actual}")]
    OutOfOrderBatch {
        search_id: SearchId,
        expected: u64,
        actual: u64,
    },

    /// A batch was appended after the result set was marked complete.
    #[error("result set for {search_id} is already complete")]
    AlreadyComplete { search_id: SearchId },
}

/// Errors originating from the resource store or the cache backing.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection to the backend failed.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// Query execution error.
    #[error("query execution failed: {message}")]
    QueryFailed { message: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Internal backend error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Errors in the search configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// One or more settings are invalid.
    #[error("invalid configuration: {}", .errors.join("; "))]
    Invalid { errors: Vec<String> },
}

/// Result type alias for search coordination operations.
pub type SearchResult<T> = Result<T, SearchError>;

/// Result type alias for query building.
pub type BuildResult<T> = Result<T, BuildError>;

/// Result type alias for resource store and cache backing operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SearchError {
    fn from(err: serde_json::Error) -> Self {
        SearchError::Store(err.into())
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Internal {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::ConnectionFailed {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
        }
    }
}

impl SearchError {
    /// Returns true if the caller should re-issue the search from scratch.
    pub fn requires_reissue(&self) -> bool {
        matches!(
            self,
            SearchError::Bookkeeping(
                BookkeepingError::UnknownSearch { .. } | BookkeepingError::SearchExpired { .. }
            )
        )
    }
}
