//! Per-request context passed explicitly through the search call chain.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cache-control directives a caller may attach to a search request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheControl {
    /// Never reuse an existing search; always start a fresh one.
    pub no_cache: bool,

    /// Do not make this search available for reuse by later requests.
    pub no_store: bool,
}

impl CacheControl {
    /// Parses a `Cache-Control` style header value (`no-cache, no-store`).
    ///
    /// Unknown directives are ignored.
    pub fn parse(header: &str) -> Self {
        let mut control = Self::default();
        for directive in header.split(',').map(|d| d.trim().to_ascii_lowercase()) {
            match directive.as_str() {
                "no-cache" => control.no_cache = true,
                "no-store" => control.no_store = true,
                _ => {}
            }
        }
        control
    }
}

/// Context for one search request.
///
/// # Examples
///
/// ```
/// use helios_search::context::{CacheControl, SearchContext};
///
/// let ctx = SearchContext::new().with_cache_control(CacheControl::parse("no-cache"));
/// assert!(ctx.cache_control().no_cache);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchContext {
    request_id: String,
    cache_control: CacheControl,
}

impl SearchContext {
    /// Creates a context with a generated request ID and default directives.
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cache_control: CacheControl::default(),
        }
    }

    /// Sets the request ID used to correlate log lines.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Sets the cache-control directives.
    pub fn with_cache_control(mut self, cache_control: CacheControl) -> Self {
        self.cache_control = cache_control;
        self
    }

    /// Returns the request ID.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns the cache-control directives.
    pub fn cache_control(&self) -> CacheControl {
        self.cache_control
    }
}

impl Default for SearchContext {
    fn default() -> Self {
        Self::new()
    }
}
