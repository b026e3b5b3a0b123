//! Caller-facing page reads over a possibly still growing result set.

use tracing::debug;

use crate::error::SearchResult;
use crate::tasks::{ContinuationTask, ExecutionContext};
use crate::types::{Page, PageToken, SearchId, SearchStatus};

/// Serves pages of a search's results, launching continuations on demand.
///
/// Reads never wait for a producer. A page that is not fully materialized
/// comes back short with `has_more` set, and the caller polls again.
#[derive(Debug, Clone)]
pub struct PagingProvider {
    ctx: ExecutionContext,
    continuation_load_size: u64,
    max_load_size: u64,
}

impl PagingProvider {
    /// Creates a provider.
    ///
    /// Continuations fetch at least `continuation_load_size` rows and at most
    /// `max_load_size`, whatever offset the caller asks for.
    pub fn new(ctx: ExecutionContext, continuation_load_size: u64, max_load_size: u64) -> Self {
        let max_load_size = max_load_size.max(1);
        Self {
            ctx,
            continuation_load_size: continuation_load_size.clamp(1, max_load_size),
            max_load_size,
        }
    }

    /// Returns up to `count` identifiers starting at `offset`.
    ///
    /// A zero `count` is treated as one. When the range reaches past the
    /// materialized rows of a finished search with more data in the backend,
    /// a continuation is launched and the available prefix returned at once.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// * `BookkeepingError::UnknownSearch` - If the ID was never issued
    /// * `BookkeepingError::SearchExpired` - If the search was evicted
    pub fn get_page(&self, search_id: &SearchId, offset: u64, count: u64) -> SearchResult<Page> {
        let count = count.max(1);
        let entry = self.ctx.search_cache.get(search_id)?;
        let mut page = self.ctx.result_cache.get_range(search_id, offset, count)?;
        let returned_end = offset + page.len() as u64;

        match entry.status {
            SearchStatus::Queued | SearchStatus::Running => {}
            SearchStatus::Finished => {
                if entry.more_available && (page.len() as u64) < count {
                    self.launch_continuation(search_id, offset.saturating_add(count))?;
                }
            }
            SearchStatus::Failed | SearchStatus::Cancelled => {
                // Nothing more will arrive; only report stored rows.
                let progress = self.ctx.result_cache.progress(search_id)?;
                page.has_more = progress.materialized > returned_end;
            }
        }

        if page.total.is_none() {
            page.total = entry.total_count;
        }
        if page.has_more {
            let token = PageToken::new(search_id.clone(), returned_end, count);
            page.next_token = Some(token.encode());
        }

        debug!(
            search_id = %search_id,
            offset,
            count,
            returned = page.len(),
            has_more = page.has_more,
            status = %entry.status,
            "Served page"
        );
        Ok(page)
    }

    /// Resolves a token issued with a previous page.
    ///
    /// # Errors
    ///
    /// * `BookkeepingError::InvalidPageToken` - If the token cannot be decoded
    pub fn get_page_by_token(&self, token: &str) -> SearchResult<Page> {
        let token = PageToken::decode(token)?;
        self.get_page(token.search_id(), token.offset(), token.count())
    }

    /// Launches a continuation reaching `requested_end` unless one is running.
    ///
    /// Returns true if a continuation was started.
    pub fn launch_continuation(&self, search_id: &SearchId, requested_end: u64) -> SearchResult<bool> {
        match ContinuationTask::claim(
            &self.ctx,
            search_id,
            requested_end,
            self.continuation_load_size,
            self.max_load_size,
        )? {
            Some(task) => {
                debug!(
                    search_id = %search_id,
                    start = task.start(),
                    load = task.load(),
                    "Launching continuation"
                );
                task.spawn();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
