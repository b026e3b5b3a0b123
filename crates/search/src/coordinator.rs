//! The caller-facing entry point tying the components together.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{KeyValueStore, MemoryKvStore, ResultCache, SearchCache};
use crate::config::SearchConfig;
use crate::context::SearchContext;
use crate::error::SearchResult;
use crate::paging::PagingProvider;
use crate::query::{ParameterCatalog, QueryBuilder};
use crate::store::ResourceStore;
use crate::tasks::{ExecutionContext, SearchTask};
use crate::types::{Page, SearchEntry, SearchId, SearchSpecification};

/// Starts searches, serves their pages and keeps the caches tidy.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use helios_search::backends::MemoryResourceStore;
/// use helios_search::context::SearchContext;
/// use helios_search::types::SearchSpecification;
/// use helios_search::{SearchConfig, SearchCoordinator};
///
/// # async fn demo() -> Result<(), helios_search::SearchError> {
/// let store = Arc::new(MemoryResourceStore::new());
/// let coordinator = SearchCoordinator::new(store, SearchConfig::default())?;
///
/// let id = coordinator
///     .start_search(SearchSpecification::new("Observation"), &SearchContext::new())
///     .await?;
/// let page = coordinator.get_page(&id, 0, 50).await?;
/// println!("{} ids, more: {}", page.len(), page.has_more);
/// # Ok(())
/// # }
/// ```
pub struct SearchCoordinator {
    config: SearchConfig,
    ctx: ExecutionContext,
    paging: PagingProvider,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SearchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCoordinator")
            .field("config", &self.config)
            .field("ctx", &self.ctx)
            .field("searches", &self.ctx.search_cache.len())
            .finish_non_exhaustive()
    }
}

impl SearchCoordinator {
    /// Creates a coordinator with in-memory caches and the default catalog.
    ///
    /// # Errors
    ///
    /// * `ConfigError::Invalid` - If the configuration does not validate
    pub fn new(store: Arc<dyn ResourceStore>, config: SearchConfig) -> SearchResult<Self> {
        Self::with_parts(
            store,
            Arc::new(MemoryKvStore::new()),
            Arc::new(ParameterCatalog::with_defaults()),
            config,
        )
    }

    /// Creates a coordinator over an explicit cache backing and catalog.
    pub fn with_parts(
        store: Arc<dyn ResourceStore>,
        kv: Arc<dyn KeyValueStore>,
        catalog: Arc<ParameterCatalog>,
        config: SearchConfig,
    ) -> SearchResult<Self> {
        config.check()?;

        let ctx = ExecutionContext {
            store,
            search_cache: Arc::new(SearchCache::new(
                kv.clone(),
                config.cache_ttl,
                config.effective_reuse_window(),
            )),
            result_cache: Arc::new(ResultCache::new(kv)),
            builder: Arc::new(QueryBuilder::new(catalog)),
            batch_size: config.batch_size,
            window_timeout: config.window_timeout,
        };
        let paging = PagingProvider::new(
            ctx.clone(),
            u64::from(config.continuation_load_size),
            u64::from(config.max_load_size),
        );

        info!(
            backend = ctx.store.backend_name(),
            dialect = %ctx.store.dialect(),
            batch_size = config.batch_size,
            "Search coordinator ready"
        );

        Ok(Self {
            config,
            ctx,
            paging,
            shutdown: CancellationToken::new(),
        })
    }

    /// Registers a search and launches its producer in the background.
    ///
    /// Returns as soon as the search is registered. An equivalent search that
    /// is still running (or finished within the reuse window) is shared
    /// instead of starting a second producer.
    ///
    /// # Errors
    ///
    /// * `BuildError::UnsupportedPredicate` - If a predicate cannot be expressed
    /// * `BuildError::InvalidSort` - If a sort parameter is not sortable
    pub async fn start_search(
        &self,
        spec: SearchSpecification,
        ctx: &SearchContext,
    ) -> SearchResult<SearchId> {
        self.ctx.builder.validate(&spec)?;

        let load_size = self.config.clamp_load_size(spec.load_size());
        let spec = Arc::new(spec);
        let registration = self.ctx.search_cache.register(spec.clone(), ctx)?;
        let search_id = registration.entry.search_id.clone();

        match registration.producer {
            Some(handle) => {
                debug!(search_id = %search_id, load_size, "Launching search task");
                SearchTask::new(
                    self.ctx.clone(),
                    search_id.clone(),
                    spec,
                    handle,
                    u64::from(load_size),
                )
                .spawn();
            }
            None => {
                debug!(search_id = %search_id, request_id = ctx.request_id(), "Attached to existing search");
            }
        }

        Ok(search_id)
    }

    /// Returns a page of identifiers; see [`PagingProvider::get_page`].
    pub async fn get_page(&self, search_id: &SearchId, offset: u64, count: u64) -> SearchResult<Page> {
        self.paging.get_page(search_id, offset, count)
    }

    /// Returns the page a previously issued token points at.
    pub async fn get_page_by_token(&self, token: &str) -> SearchResult<Page> {
        self.paging.get_page_by_token(token)
    }

    /// Returns the bookkeeping entry of a search.
    pub async fn get_status(&self, search_id: &SearchId) -> SearchResult<SearchEntry> {
        self.ctx.search_cache.get(search_id)
    }

    /// Requests cancellation of a search's producer.
    ///
    /// Returns false when no producer is running. The status becomes
    /// `CANCELLED` once the producer observes the request.
    pub async fn cancel(&self, search_id: &SearchId) -> SearchResult<bool> {
        self.ctx.search_cache.cancel(search_id)
    }

    /// Extends a finished search so that at least `requested_end` rows exist.
    ///
    /// A no-op returning false when a producer is running or the backend has
    /// nothing more.
    pub async fn continue_search(&self, search_id: &SearchId, requested_end: u64) -> SearchResult<bool> {
        self.paging.launch_continuation(search_id, requested_end)
    }

    /// Evicts expired searches and deletes their cached results.
    pub fn sweep_expired(&self) -> Vec<SearchId> {
        let evicted = self.ctx.search_cache.evict_expired();
        for search_id in &evicted {
            if let Err(e) = self.ctx.result_cache.delete(search_id) {
                warn!(search_id = %search_id, error = %e, "Failed to delete evicted results");
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Swept expired searches");
        }
        evicted
    }

    /// Runs [`SearchCoordinator::sweep_expired`] every `sweep_interval`.
    ///
    /// The sweeper stops on [`SearchCoordinator::shutdown`] or once the
    /// coordinator is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(coordinator) = coordinator.upgrade() else {
                            break;
                        };
                        coordinator.sweep_expired();
                    }
                }
            }
            debug!("Sweeper stopped");
        })
    }

    /// Stops the sweeper and signals every running producer to cancel.
    ///
    /// Returns the number of producers signalled.
    pub fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        let cancelled = self.ctx.search_cache.cancel_all();
        info!(cancelled, "Search coordinator shutting down");
        cancelled
    }

    /// The active configuration.
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// The search bookkeeping cache.
    pub fn search_cache(&self) -> &Arc<SearchCache> {
        &self.ctx.search_cache
    }

    /// The materialized result cache.
    pub fn result_cache(&self) -> &Arc<ResultCache> {
        &self.ctx.result_cache
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backends::{MemoryResourceStore, StoredRecord};
    use crate::error::{BuildError, SearchError};
    use crate::types::{SearchPredicate, SearchStatus};

    fn create_coordinator(n: usize) -> SearchCoordinator {
        let store = Arc::new(MemoryResourceStore::new());
        store.insert_all((0..n).map(|i| StoredRecord::new("Patient", format!("p-{:03}", i))));
        SearchCoordinator::new(store, SearchConfig::for_testing()).unwrap()
    }

    async fn wait_until_settled(coordinator: &SearchCoordinator, id: &SearchId) -> SearchEntry {
        for _ in 0..200 {
            let entry = coordinator.get_status(id).await.unwrap();
            if entry.status.is_terminal() {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("search {} did not settle", id);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SearchConfig {
            batch_size: 0,
            ..SearchConfig::for_testing()
        };
        let store = Arc::new(MemoryResourceStore::new());
        assert!(matches!(
            SearchCoordinator::new(store, config),
            Err(SearchError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_build_errors_are_synchronous() {
        let coordinator = create_coordinator(0);
        let spec = SearchSpecification::new("Patient")
            .with_predicate(SearchPredicate::eq("no-such-param", "x"));
        let err = coordinator
            .start_search(spec, &SearchContext::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SearchError::Build(BuildError::UnsupportedPredicate { .. })
        ));
        assert!(coordinator.search_cache().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_read_first_page() {
        let coordinator = create_coordinator(30);
        let id = coordinator
            .start_search(SearchSpecification::new("Patient"), &SearchContext::new())
            .await
            .unwrap();
        let entry = wait_until_settled(&coordinator, &id).await;
        assert_eq!(entry.status, SearchStatus::Finished);

        let page = coordinator.get_page(&id, 0, 20).await.unwrap();
        assert_eq!(page.len(), 20);
        assert!(page.has_more);
        assert_eq!(page.total, Some(30));
        assert!(page.next_token.is_some());

        let next = coordinator
            .get_page_by_token(page.next_token.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(next.offset, 20);
        assert_eq!(next.len(), 10);
        assert!(!next.has_more);
        assert!(next.next_token.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweeper() {
        let coordinator = Arc::new(create_coordinator(0));
        let sweeper = coordinator.spawn_sweeper();
        coordinator.shutdown();
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
    }
}
