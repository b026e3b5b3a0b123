//! Search bookkeeping records.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::specification::SearchSpecification;

/// Opaque, globally unique identifier of one logical search.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchId(String);

impl SearchId {
    /// Creates a new random search ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the ID as a string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SearchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SearchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SearchId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SearchId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SearchStatus {
    /// Registered, producer not started yet.
    Queued,
    /// A producer is materializing results.
    Running,
    /// The last producer finished; more data may remain to fetch.
    Finished,
    /// The producer failed; see the recorded cause.
    Failed,
    /// The producer was cancelled.
    Cancelled,
}

impl SearchStatus {
    /// Returns true while a producer owns the search.
    pub fn is_active(&self) -> bool {
        matches!(self, SearchStatus::Queued | SearchStatus::Running)
    }

    /// Returns true for statuses no producer will leave on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SearchStatus::Finished | SearchStatus::Failed | SearchStatus::Cancelled
        )
    }

    /// Returns true if moving from `self` to `next` is allowed.
    ///
    /// `Finished -> Running` is only legal for continuations, which use
    /// [`SearchStatus::can_reopen`] instead.
    pub fn can_transition_to(&self, next: SearchStatus) -> bool {
        use SearchStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Running)
                | (Running, Finished)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Returns true if a continuation may re-open this status as `Running`.
    pub fn can_reopen(&self) -> bool {
        *self == SearchStatus::Finished
    }
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchStatus::Queued => write!(f, "QUEUED"),
            SearchStatus::Running => write!(f, "RUNNING"),
            SearchStatus::Finished => write!(f, "FINISHED"),
            SearchStatus::Failed => write!(f, "FAILED"),
            SearchStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl FromStr for SearchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Ok(SearchStatus::Queued),
            "RUNNING" => Ok(SearchStatus::Running),
            "FINISHED" => Ok(SearchStatus::Finished),
            "FAILED" => Ok(SearchStatus::Failed),
            "CANCELLED" => Ok(SearchStatus::Cancelled),
            _ => Err(format!("unknown search status: {}", s)),
        }
    }
}

/// Serializable bookkeeping record of one search.
///
/// This is the metadata half of a cached search; the live producer handle is
/// kept beside it by the search cache and never serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchEntry {
    /// The search identifier.
    pub search_id: SearchId,

    /// Current status.
    pub status: SearchStatus,

    /// Fingerprint of the specification, used for deduplication.
    pub fingerprint: String,

    /// The specification this search executes.
    pub specification: Arc<SearchSpecification>,

    /// When the search was registered.
    pub created_at: DateTime<Utc>,

    /// When the status or counts last changed.
    pub updated_at: DateTime<Utc>,

    /// Identifier of the task currently or last producing results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,

    /// Whether `total_count` is final.
    pub total_known: bool,

    /// Total number of matches, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,

    /// Whether the backend may hold matches beyond what was materialized.
    pub more_available: bool,

    /// Failure cause when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl SearchEntry {
    /// Creates a queued entry for the given specification.
    pub fn new(search_id: SearchId, specification: Arc<SearchSpecification>) -> Self {
        let now = Utc::now();
        Self {
            search_id,
            status: SearchStatus::Queued,
            fingerprint: specification.fingerprint(),
            specification,
            created_at: now,
            updated_at: now,
            task_id: None,
            total_known: false,
            total_count: None,
            more_available: true,
            failure: None,
        }
    }

    /// Records a known total.
    pub fn set_total(&mut self, total: u64) {
        self.total_known = true;
        self.total_count = Some(total);
    }

    /// Returns true if a continuation could fetch more data.
    pub fn is_continuable(&self) -> bool {
        self.status.can_reopen() && self.more_available
    }
}
