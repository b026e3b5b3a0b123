//! Resumption of a finished search beyond what it materialized.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use super::producer::{FetchPlan, produce};
use super::{ExecutionContext, TaskState, spawn_supervised};
use crate::cache::TaskHandle;
use crate::error::SearchResult;
use crate::types::{SearchId, SearchSpecification};

/// Background task extending a search's materialized results.
///
/// Only constructed through [`ContinuationTask::claim`], which takes the
/// single-producer claim in bookkeeping. Fetching starts at the current
/// materialized count, so a continuation never rewrites stored batches.
#[derive(Debug)]
pub struct ContinuationTask {
    ctx: ExecutionContext,
    search_id: SearchId,
    spec: Arc<SearchSpecification>,
    handle: TaskHandle,
    start: u64,
    load: u64,
}

impl ContinuationTask {
    /// Claims the search for a continuation reaching at least `requested_end`.
    ///
    /// Returns `None` when the search already has a producer or nothing is
    /// left to fetch. The fetch size is the larger of `min_load` and the gap
    /// between the materialized count and `requested_end`, capped at
    /// `max_load`. A far-off `requested_end` is reached by later continuations.
    pub fn claim(
        ctx: &ExecutionContext,
        search_id: &SearchId,
        requested_end: u64,
        min_load: u64,
        max_load: u64,
    ) -> SearchResult<Option<Self>> {
        let Some(handle) = ctx.search_cache.claim_continuation(search_id)? else {
            debug!(search_id = %search_id, "Continuation not needed or already running");
            return Ok(None);
        };

        let resolved = ctx.search_cache.get(search_id).and_then(|entry| {
            let progress = ctx.result_cache.progress(search_id)?;
            Ok((entry, progress.materialized))
        });
        let (entry, start) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                // Release the claim so the search does not look busy forever.
                if let Err(release) = ctx.search_cache.fail(search_id, e.to_string()) {
                    warn!(search_id = %search_id, error = %release, "Failed to release continuation claim");
                }
                return Err(e);
            }
        };
        let load = min_load
            .max(requested_end.saturating_sub(start))
            .min(max_load)
            .max(1);

        Ok(Some(Self {
            ctx: ctx.clone(),
            search_id: search_id.clone(),
            spec: entry.specification,
            handle,
            start,
            load,
        }))
    }

    /// Offset the continuation starts fetching at.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Number of rows the continuation will keep.
    pub fn load(&self) -> u64 {
        self.load
    }

    /// Runs the continuation to completion on the current task.
    pub async fn run(self) -> TaskState {
        let span = info_span!(
            "continuation_task",
            search_id = %self.search_id,
            task_id = %self.handle.task_id(),
            start = self.start,
            load = self.load,
        );
        let plan = FetchPlan {
            start: self.start,
            load: self.load,
            count_total: false,
        };
        produce(
            &self.ctx,
            &self.search_id,
            &self.spec,
            self.handle.token(),
            plan,
        )
        .instrument(span)
        .await
    }

    /// Spawns the continuation onto the tokio runtime.
    pub fn spawn(self) -> JoinHandle<TaskState> {
        let search_cache = self.ctx.search_cache.clone();
        let search_id = self.search_id.clone();
        spawn_supervised(search_cache, search_id, self.run())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backends::{MemoryResourceStore, StoredRecord};
    use crate::cache::{MemoryKvStore, ResultCache, SearchCache};
    use crate::context::SearchContext;
    use crate::query::{ParameterCatalog, QueryBuilder};
    use crate::tasks::SearchTask;
    use crate::types::SearchStatus;

    fn create_context(n: usize) -> ExecutionContext {
        let store = Arc::new(MemoryResourceStore::new());
        store.insert_all((0..n).map(|i| StoredRecord::new("Patient", format!("p-{:03}", i))));
        let kv = Arc::new(MemoryKvStore::new());
        ExecutionContext {
            store,
            search_cache: Arc::new(SearchCache::new(kv.clone(), Duration::from_secs(3600), None)),
            result_cache: Arc::new(ResultCache::new(kv)),
            builder: Arc::new(QueryBuilder::new(Arc::new(ParameterCatalog::with_defaults()))),
            batch_size: 10,
            window_timeout: Duration::from_secs(5),
        }
    }

    async fn finished_search(ctx: &ExecutionContext, load: u64) -> SearchId {
        let spec = Arc::new(SearchSpecification::new("Patient"));
        let registration = ctx
            .search_cache
            .register(spec.clone(), &SearchContext::new())
            .unwrap();
        let id = registration.entry.search_id.clone();
        SearchTask::new(ctx.clone(), id.clone(), spec, registration.producer.unwrap(), load)
            .run()
            .await;
        id
    }

    #[tokio::test]
    async fn test_continuation_resumes_at_materialized_offset() {
        let ctx = create_context(120);
        let id = finished_search(&ctx, 50).await;

        let task = ContinuationTask::claim(&ctx, &id, 100, 20, 1000).unwrap().unwrap();
        assert_eq!(task.start(), 50);
        assert_eq!(task.load(), 50);
        assert_eq!(ctx.search_cache.get(&id).unwrap().status, SearchStatus::Running);

        assert_eq!(task.run().await, TaskState::Complete);
        let entry = ctx.search_cache.get(&id).unwrap();
        assert!(entry.more_available);

        let task = ContinuationTask::claim(&ctx, &id, 110, 50, 1000).unwrap().unwrap();
        assert_eq!(task.start(), 100);
        task.run().await;

        let entry = ctx.search_cache.get(&id).unwrap();
        assert_eq!(entry.total_count, Some(120));
        assert!(!entry.more_available);

        let page = ctx.result_cache.get_range(&id, 0, 200).unwrap();
        let expected: Vec<String> = (0..120).map(|i| format!("p-{:03}", i)).collect();
        assert_eq!(page.ids, expected);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let ctx = create_context(120);
        let id = finished_search(&ctx, 50).await;

        let first = ContinuationTask::claim(&ctx, &id, 100, 50, 1000).unwrap();
        assert!(first.is_some());
        assert!(ContinuationTask::claim(&ctx, &id, 100, 50, 1000).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nothing_left_to_continue() {
        let ctx = create_context(30);
        let id = finished_search(&ctx, 50).await;
        assert!(ContinuationTask::claim(&ctx, &id, 100, 50, 1000).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_is_capped() {
        let ctx = create_context(300);
        let id = finished_search(&ctx, 50).await;

        let task = ContinuationTask::claim(&ctx, &id, 1_000_000_000, 20, 100)
            .unwrap()
            .unwrap();
        assert_eq!(task.start(), 50);
        assert_eq!(task.load(), 100);

        assert_eq!(task.run().await, TaskState::Complete);
        assert_eq!(ctx.result_cache.progress(&id).unwrap().materialized, 150);
        assert!(ctx.search_cache.get(&id).unwrap().more_available);
    }
}
