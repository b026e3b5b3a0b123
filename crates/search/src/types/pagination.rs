//! Pagination types for cached result sets.
//!
//! A result set is materialized as contiguous [`ResultBatch`]es and served back
//! as [`Page`]s. Callers continue paging either by offset or with the opaque
//! [`PageToken`] attached to each page.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

use super::entry::SearchId;
use crate::error::BookkeepingError;

/// A requested range of the result set: zero-based offset plus row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultWindow {
    /// Zero-based offset of the first row.
    pub offset: u64,
    /// Maximum number of rows.
    pub count: u64,
}

impl ResultWindow {
    /// Creates a window.
    pub fn new(offset: u64, count: u64) -> Self {
        Self { offset, count }
    }

    /// Creates a window starting at offset zero.
    pub fn first(count: u64) -> Self {
        Self::new(0, count)
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.count)
    }
}

/// An ordered run of record identifiers starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultBatch {
    /// Zero-based offset of the first identifier.
    pub offset: u64,
    /// Record identifiers in backend order.
    pub ids: Vec<String>,
}

impl ResultBatch {
    /// Creates a batch.
    pub fn new(offset: u64, ids: Vec<String>) -> Self {
        Self { offset, ids }
    }

    /// Number of identifiers in the batch.
    pub fn len(&self) -> u64 {
        self.ids.len() as u64
    }

    /// Returns true if the batch holds no identifiers.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }
}

/// A page of record identifiers served from the result cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Offset of the first identifier in this page.
    pub offset: u64,

    /// The identifiers, at most the requested count.
    pub ids: Vec<String>,

    /// Whether identifiers beyond this page exist or may still arrive.
    pub has_more: bool,

    /// Total number of matches, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,

    /// Token for the following page, present when `has_more` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

impl Page {
    /// Creates an empty page at the given offset.
    pub fn empty(offset: u64) -> Self {
        Self {
            offset,
            ids: Vec::new(),
            has_more: false,
            total: None,
            next_token: None,
        }
    }

    /// Number of identifiers in the page.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the page holds no identifiers.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Opaque continuation token for a page of a cached search.
///
/// Tokens are base64 encoded JSON and carry a version so the format can
/// change without silently misreading old tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    version: u8,
    search_id: SearchId,
    offset: u64,
    count: u64,
}

impl PageToken {
    const VERSION: u8 = 1;

    /// Creates a token for the given page.
    pub fn new(search_id: SearchId, offset: u64, count: u64) -> Self {
        Self {
            version: Self::VERSION,
            search_id,
            offset,
            count,
        }
    }

    /// The search this token belongs to.
    pub fn search_id(&self) -> &SearchId {
        &self.search_id
    }

    /// Offset of the page.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Requested page size.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Encodes the token to an opaque string.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(&json)
    }

    /// Decodes a token from an opaque string.
    pub fn decode(s: &str) -> Result<Self, BookkeepingError> {
        let invalid = || BookkeepingError::InvalidPageToken {
            token: s.to_string(),
        };

        let bytes = URL_SAFE_NO_PAD.decode(s).map_err(|_| invalid())?;
        let token: PageToken = serde_json::from_slice(&bytes).map_err(|_| invalid())?;
        if token.version != Self::VERSION {
            return Err(invalid());
        }
        Ok(token)
    }
}
