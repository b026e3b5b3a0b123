//! Initial load of a registered search.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{Instrument, info_span};

use super::producer::{FetchPlan, produce};
use super::{ExecutionContext, TaskState, spawn_supervised};
use crate::cache::TaskHandle;
use crate::types::{SearchId, SearchSpecification};

/// Background task performing the first load of a search.
///
/// Fetches `load_size` identifiers starting at offset zero, plus one extra row
/// that tells whether the backend holds more. Accurate-total searches run the
/// count query first.
#[derive(Debug)]
pub struct SearchTask {
    ctx: ExecutionContext,
    search_id: SearchId,
    spec: Arc<SearchSpecification>,
    handle: TaskHandle,
    load_size: u64,
}

impl SearchTask {
    /// Creates a task for a freshly registered search.
    ///
    /// `handle` must be the producer handle returned by registration.
    pub fn new(
        ctx: ExecutionContext,
        search_id: SearchId,
        spec: Arc<SearchSpecification>,
        handle: TaskHandle,
        load_size: u64,
    ) -> Self {
        Self {
            ctx,
            search_id,
            spec,
            handle,
            load_size: load_size.max(1),
        }
    }

    /// Runs the task to completion on the current task.
    pub async fn run(self) -> TaskState {
        let span = info_span!(
            "search_task",
            search_id = %self.search_id,
            task_id = %self.handle.task_id(),
            resource_type = self.spec.resource_type(),
        );
        let plan = FetchPlan {
            start: 0,
            load: self.load_size,
            count_total: true,
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

    /// Spawns the task onto the tokio runtime.
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
    use crate::backends::{FailurePlan, IndexValue, MemoryResourceStore, StoredRecord};
    use crate::cache::{MemoryKvStore, ResultCache, SearchCache};
    use crate::context::SearchContext;
    use crate::query::{BackendDialect, ParameterCatalog, QueryBuilder};
    use crate::types::{SearchStatus, TotalMode};

    fn create_context(store: Arc<MemoryResourceStore>) -> ExecutionContext {
        let kv = Arc::new(MemoryKvStore::new());
        ExecutionContext {
            store,
            search_cache: Arc::new(SearchCache::new(
                kv.clone(),
                Duration::from_secs(3600),
                None,
            )),
            result_cache: Arc::new(ResultCache::new(kv)),
            builder: Arc::new(QueryBuilder::new(Arc::new(ParameterCatalog::with_defaults()))),
            batch_size: 7,
            window_timeout: Duration::from_secs(5),
        }
    }

    fn seed(store: &MemoryResourceStore, n: usize) {
        store.insert_all((0..n).map(|i| {
            StoredRecord::new("Observation", format!("obs-{:03}", i))
                .with_index("status", IndexValue::token(None, "final"))
        }));
    }

    fn start(ctx: &ExecutionContext, spec: SearchSpecification, load: u64) -> (SearchId, SearchTask) {
        let spec = Arc::new(spec);
        let registration = ctx
            .search_cache
            .register(spec.clone(), &SearchContext::new())
            .unwrap();
        let search_id = registration.entry.search_id.clone();
        let handle = registration.producer.unwrap();
        let task = SearchTask::new(ctx.clone(), search_id.clone(), spec, handle, load);
        (search_id, task)
    }

    #[tokio::test]
    async fn test_exhausts_small_result_set() {
        let store = Arc::new(MemoryResourceStore::new());
        seed(&store, 20);
        let ctx = create_context(store);
        let (id, task) = start(&ctx, SearchSpecification::new("Observation"), 50);

        assert_eq!(task.run().await, TaskState::Complete);

        let entry = ctx.search_cache.get(&id).unwrap();
        assert_eq!(entry.status, SearchStatus::Finished);
        assert_eq!(entry.total_count, Some(20));
        assert!(!entry.more_available);

        let page = ctx.result_cache.get_range(&id, 0, 100).unwrap();
        assert_eq!(page.ids.len(), 20);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_stops_at_load_size_when_more_remain() {
        let store = Arc::new(MemoryResourceStore::new());
        seed(&store, 120);
        let ctx = create_context(store);
        let (id, task) = start(&ctx, SearchSpecification::new("Observation"), 50);

        assert_eq!(task.run().await, TaskState::Complete);

        let entry = ctx.search_cache.get(&id).unwrap();
        assert_eq!(entry.status, SearchStatus::Finished);
        assert!(entry.more_available);
        assert_eq!(entry.total_count, None);
        assert_eq!(ctx.result_cache.progress(&id).unwrap().materialized, 50);
    }

    #[tokio::test]
    async fn test_load_size_equal_to_matches_is_exhausted() {
        let store = Arc::new(MemoryResourceStore::new());
        seed(&store, 50);
        let ctx = create_context(store);
        let (id, task) = start(&ctx, SearchSpecification::new("Observation"), 50);

        task.run().await;
        let entry = ctx.search_cache.get(&id).unwrap();
        assert!(!entry.more_available);
        assert_eq!(entry.total_count, Some(50));
    }

    #[tokio::test]
    async fn test_accurate_total_is_counted_up_front() {
        let store = Arc::new(MemoryResourceStore::new());
        seed(&store, 120);
        let ctx = create_context(store);
        let spec = SearchSpecification::new("Observation").with_total_mode(TotalMode::Accurate);
        let (id, task) = start(&ctx, spec, 50);

        task.run().await;
        let entry = ctx.search_cache.get(&id).unwrap();
        assert!(entry.more_available);
        assert_eq!(entry.total_count, Some(120));
    }

    #[tokio::test]
    async fn test_backend_failure_marks_failed() {
        let store = Arc::new(MemoryResourceStore::new());
        seed(&store, 40);
        store.set_failure(Some(FailurePlan::AfterWindows(2, "disk gone".into())));
        let ctx = create_context(store);
        let (id, task) = start(&ctx, SearchSpecification::new("Observation"), 50);

        assert_eq!(task.run().await, TaskState::Failed);

        let entry = ctx.search_cache.get(&id).unwrap();
        assert_eq!(entry.status, SearchStatus::Failed);
        assert!(entry.failure.unwrap().contains("disk gone"));
        // Two windows of seven made it in before the failure.
        assert_eq!(ctx.result_cache.progress(&id).unwrap().materialized, 14);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let store = Arc::new(MemoryResourceStore::new());
        seed(&store, 10);
        let ctx = create_context(store.clone());
        let (id, task) = start(&ctx, SearchSpecification::new("Observation"), 50);

        assert!(ctx.search_cache.cancel(&id).unwrap());
        assert_eq!(task.run().await, TaskState::Cancelled);
        assert_eq!(ctx.search_cache.get(&id).unwrap().status, SearchStatus::Cancelled);
        assert_eq!(store.executions(), 0);
    }

    #[tokio::test]
    async fn test_client_side_skipping_dialect() {
        let store = Arc::new(MemoryResourceStore::new().with_dialect(BackendDialect::TopOnly));
        seed(&store, 30);
        let ctx = create_context(store);
        let (id, task) = start(&ctx, SearchSpecification::new("Observation"), 10);
        task.run().await;

        let page = ctx.result_cache.get_range(&id, 0, 10).unwrap();
        assert_eq!(page.ids.first().map(String::as_str), Some("obs-000"));
        assert_eq!(page.ids.last().map(String::as_str), Some("obs-009"));
    }
}
