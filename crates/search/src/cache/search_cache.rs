//! Search bookkeeping: which searches exist, who produces them, and their status.
//!
//! Every search is held as a two-part record: the serializable
//! [`SearchEntry`] metadata, written through to the key-value backing on every
//! change, and the runtime [`TaskHandle`] of its producer, which only lives in
//! memory. An entry loaded back from the backing therefore never has a
//! producer; if it was still active when it was written, it is marked failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::kv::KeyValueStore;
use crate::context::SearchContext;
use crate::error::{BookkeepingError, SearchResult, StoreResult};
use crate::types::{SearchEntry, SearchId, SearchSpecification, SearchStatus};

const KEY_PREFIX: &str = "search:";

/// Failure recorded on entries whose producer disappeared with the process.
pub const PRODUCER_LOST: &str = "search producer was lost before completion";

fn entry_key(search_id: &SearchId) -> String {
    format!("{}{}", KEY_PREFIX, search_id)
}

/// Runtime handle of the task producing a search's results.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task_id: Uuid,
    token: CancellationToken,
}

impl TaskHandle {
    /// Creates a handle for a new task.
    pub fn new() -> Self {
        Self {
            task_id: Uuid::new_v4(),
            token: CancellationToken::new(),
        }
    }

    /// The task identifier.
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// The token the task polls between windows.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// The two-part record held per search.
#[derive(Debug)]
struct CachedSearch {
    entry: SearchEntry,
    producer: Option<TaskHandle>,
    created: Instant,
    last_touched: Instant,
}

impl CachedSearch {
    fn new(entry: SearchEntry, producer: Option<TaskHandle>) -> Self {
        let now = Instant::now();
        Self {
            entry,
            producer,
            created: now,
            last_touched: now,
        }
    }
}

/// Outcome of [`SearchCache::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    /// The registered or reused entry.
    pub entry: SearchEntry,

    /// Handle of the producer the caller must launch; `None` when an existing
    /// search was reused.
    pub producer: Option<TaskHandle>,
}

impl Registration {
    /// Returns true if an existing search was reused.
    pub fn is_reused(&self) -> bool {
        self.producer.is_none()
    }
}

/// Tracks searches, their status and their single producer.
pub struct SearchCache {
    entries: RwLock<HashMap<SearchId, Arc<Mutex<CachedSearch>>>>,
    /// Fingerprint index for deduplication. Held for the whole of `register`.
    fingerprints: Mutex<HashMap<String, SearchId>>,
    /// Recently evicted IDs, so callers can tell expired from unknown.
    evicted: Mutex<HashMap<SearchId, Instant>>,
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
    reuse_window: Option<Duration>,
}

impl SearchCache {
    /// Creates a cache persisting metadata into `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration, reuse_window: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            fingerprints: Mutex::new(HashMap::new()),
            evicted: Mutex::new(HashMap::new()),
            kv,
            ttl,
            reuse_window,
        }
    }

    /// Registers a search, or returns an equivalent one that can be reused.
    ///
    /// Registration is atomic: concurrent calls with the same fingerprint
    /// observe each other and share one search ID. A `QUEUED`/`RUNNING` search
    /// is always reused; a `FINISHED` one only inside the reuse window. The
    /// context's `no_cache` directive skips reuse, `no_store` keeps the new
    /// search out of the fingerprint index.
    pub fn register(
        &self,
        spec: Arc<SearchSpecification>,
        ctx: &SearchContext,
    ) -> SearchResult<Registration> {
        let control = ctx.cache_control();
        let fingerprint = spec.fingerprint();
        let mut index = self.fingerprints.lock();

        if !control.no_cache {
            if let Some(existing) = index.get(&fingerprint).and_then(|id| self.slot(id)) {
                let mut cached = existing.lock();
                if self.is_reusable(&cached) {
                    cached.last_touched = Instant::now();
                    debug!(
                        search_id = %cached.entry.search_id,
                        status = %cached.entry.status,
                        request_id = ctx.request_id(),
                        "Reusing existing search"
                    );
                    return Ok(Registration {
                        entry: cached.entry.clone(),
                        producer: None,
                    });
                }
            }
        }

        let entry = SearchEntry::new(SearchId::new(), spec);
        let handle = TaskHandle::new();
        let mut stored = entry.clone();
        stored.task_id = Some(handle.task_id());
        self.persist(&stored)?;

        let search_id = stored.search_id.clone();
        self.entries.write().insert(
            search_id.clone(),
            Arc::new(Mutex::new(CachedSearch::new(
                stored.clone(),
                Some(handle.clone()),
            ))),
        );
        if !control.no_store {
            index.insert(fingerprint, search_id.clone());
        }

        info!(
            search_id = %search_id,
            resource_type = stored.specification.resource_type(),
            request_id = ctx.request_id(),
            "Registered search"
        );

        Ok(Registration {
            entry: stored,
            producer: Some(handle),
        })
    }

    /// Returns the current entry, refreshing its last-touched time.
    pub fn get(&self, search_id: &SearchId) -> SearchResult<SearchEntry> {
        let slot = self.load(search_id)?;
        let mut cached = slot.lock();
        cached.last_touched = Instant::now();
        Ok(cached.entry.clone())
    }

    /// Refreshes the last-touched time of a live search.
    ///
    /// Producers call this before every write so a search that is still
    /// materializing is never swept as idle.
    pub fn touch(&self, search_id: &SearchId) -> SearchResult<()> {
        let slot = self.load(search_id)?;
        slot.lock().last_touched = Instant::now();
        Ok(())
    }

    /// Moves a search to `status`, rejecting non-monotonic transitions.
    pub fn update_status(
        &self,
        search_id: &SearchId,
        status: SearchStatus,
    ) -> SearchResult<SearchEntry> {
        self.modify(search_id, |cached| {
            transition(&mut cached.entry, status)?;
            if status.is_terminal() {
                cached.producer = None;
            }
            Ok(())
        })
    }

    /// Records that the producer finished its load.
    ///
    /// `total` is set once the backend is exhausted; `more_available` tells a
    /// later continuation whether anything is left to fetch.
    pub fn complete(
        &self,
        search_id: &SearchId,
        more_available: bool,
        total: Option<u64>,
    ) -> SearchResult<SearchEntry> {
        self.modify(search_id, |cached| {
            transition(&mut cached.entry, SearchStatus::Finished)?;
            cached.entry.more_available = more_available;
            if let Some(total) = total {
                cached.entry.set_total(total);
            }
            cached.producer = None;
            Ok(())
        })
    }

    /// Records a known total without changing status.
    pub fn set_total(&self, search_id: &SearchId, total: u64) -> SearchResult<SearchEntry> {
        self.modify(search_id, |cached| {
            cached.entry.set_total(total);
            Ok(())
        })
    }

    /// Marks the search failed with `cause`.
    pub fn fail(&self, search_id: &SearchId, cause: impl Into<String>) -> SearchResult<SearchEntry> {
        let cause = cause.into();
        self.modify(search_id, |cached| {
            transition(&mut cached.entry, SearchStatus::Failed)?;
            cached.entry.failure = Some(cause);
            cached.entry.more_available = false;
            cached.producer = None;
            Ok(())
        })
    }

    /// Marks the search cancelled.
    pub fn mark_cancelled(&self, search_id: &SearchId) -> SearchResult<SearchEntry> {
        self.modify(search_id, |cached| {
            transition(&mut cached.entry, SearchStatus::Cancelled)?;
            cached.entry.more_available = false;
            cached.producer = None;
            Ok(())
        })
    }

    /// Re-acquires the single-producer claim for a continuation.
    ///
    /// Succeeds only for a `FINISHED` search with data left to fetch and no
    /// live producer; the entry is moved back to `RUNNING` under the same lock.
    /// Returns `None` when another producer owns the search or nothing is left.
    pub fn claim_continuation(&self, search_id: &SearchId) -> SearchResult<Option<TaskHandle>> {
        let slot = self.load(search_id)?;
        let mut cached = slot.lock();
        cached.last_touched = Instant::now();

        if cached.producer.is_some() || !cached.entry.is_continuable() {
            return Ok(None);
        }

        let handle = TaskHandle::new();
        cached.entry.status = SearchStatus::Running;
        cached.entry.task_id = Some(handle.task_id());
        cached.entry.updated_at = Utc::now();
        cached.producer = Some(handle.clone());
        self.persist_quiet(&cached.entry);

        debug!(search_id = %search_id, task_id = %handle.task_id(), "Claimed continuation");
        Ok(Some(handle))
    }

    /// Signals the producer of a search to stop.
    ///
    /// Returns true if a producer was signalled. The producer itself records
    /// the `CANCELLED` status once it observes the signal.
    pub fn cancel(&self, search_id: &SearchId) -> SearchResult<bool> {
        let slot = self.load(search_id)?;
        let cached = slot.lock();
        match &cached.producer {
            Some(producer) => {
                producer.cancel();
                info!(search_id = %search_id, task_id = %producer.task_id(), "Cancellation requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Signals every live producer to stop. Returns the number signalled.
    pub fn cancel_all(&self) -> usize {
        let entries = self.entries.read();
        let mut cancelled = 0;
        for slot in entries.values() {
            if let Some(producer) = &slot.lock().producer {
                producer.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Evicts every entry untouched for longer than the TTL.
    ///
    /// Producers of evicted entries are cancelled first. Returns the evicted
    /// IDs so the caller can drop their cached results.
    pub fn evict_expired(&self) -> Vec<SearchId> {
        let now = Instant::now();
        let mut index = self.fingerprints.lock();
        let mut entries = self.entries.write();

        let expired: Vec<SearchId> = entries
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.lock().last_touched) > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = self.evicted.lock();
        for search_id in &expired {
            let Some(slot) = entries.remove(search_id) else {
                continue;
            };
            let cached = slot.lock();
            if let Some(producer) = &cached.producer {
                producer.cancel();
            }
            if index.get(&cached.entry.fingerprint) == Some(search_id) {
                index.remove(&cached.entry.fingerprint);
            }
            if let Err(e) = self.kv.delete(&entry_key(search_id)) {
                warn!(search_id = %search_id, error = %e, "Failed to delete evicted search entry");
            }
            evicted.insert(search_id.clone(), now);
            info!(search_id = %search_id, status = %cached.entry.status, "Evicted search");
        }

        // Tombstones only need to outlive a client's polling interval.
        evicted.retain(|_, at| now.duration_since(*at) <= self.ttl);
        expired
    }

    /// Number of searches held in memory.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no searches are held in memory.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// The configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_reusable(&self, cached: &CachedSearch) -> bool {
        match cached.entry.status {
            SearchStatus::Queued | SearchStatus::Running => true,
            SearchStatus::Finished => self
                .reuse_window
                .is_some_and(|window| cached.created.elapsed() <= window),
            SearchStatus::Failed | SearchStatus::Cancelled => false,
        }
    }

    fn slot(&self, search_id: &SearchId) -> Option<Arc<Mutex<CachedSearch>>> {
        self.entries.read().get(search_id).cloned()
    }

    /// Finds a search in memory or rehydrates it from the backing.
    fn load(&self, search_id: &SearchId) -> SearchResult<Arc<Mutex<CachedSearch>>> {
        if let Some(slot) = self.slot(search_id) {
            return Ok(slot);
        }

        if self.evicted.lock().contains_key(search_id) {
            return Err(BookkeepingError::SearchExpired {
                search_id: search_id.clone(),
            }
            .into());
        }

        let Some(bytes) = self.kv.get(&entry_key(search_id))? else {
            return Err(BookkeepingError::UnknownSearch {
                search_id: search_id.clone(),
            }
            .into());
        };

        let mut entry: SearchEntry = serde_json::from_slice(&bytes)?;
        if !entry.status.is_terminal() {
            warn!(search_id = %search_id, status = %entry.status, "Rehydrated search has no live producer");
            entry.status = SearchStatus::Failed;
            entry.failure = Some(PRODUCER_LOST.to_string());
            entry.more_available = false;
            entry.updated_at = Utc::now();
            self.persist(&entry)?;
        }

        let slot = self
            .entries
            .write()
            .entry(search_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(CachedSearch::new(entry, None))))
            .clone();
        debug!(search_id = %search_id, "Rehydrated search entry");
        Ok(slot)
    }

    fn modify<F>(&self, search_id: &SearchId, f: F) -> SearchResult<SearchEntry>
    where
        F: FnOnce(&mut CachedSearch) -> Result<(), BookkeepingError>,
    {
        let slot = self.load(search_id)?;
        let mut cached = slot.lock();
        f(&mut cached)?;
        cached.last_touched = Instant::now();
        cached.entry.updated_at = Utc::now();
        self.persist_quiet(&cached.entry);
        Ok(cached.entry.clone())
    }

    fn persist(&self, entry: &SearchEntry) -> StoreResult<()> {
        let bytes = serde_json::to_vec(entry)?;
        self.kv.put(&entry_key(&entry.search_id), bytes)
    }

    /// Write-through for updates. Memory stays authoritative if the backing
    /// rejects the write.
    fn persist_quiet(&self, entry: &SearchEntry) {
        if let Err(e) = self.persist(entry) {
            warn!(search_id = %entry.search_id, error = %e, "Failed to persist search entry");
        }
    }
}

impl std::fmt::Debug for SearchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCache")
            .field("searches", &self.entries.read().len())
            .field("ttl", &self.ttl)
            .field("reuse_window", &self.reuse_window)
            .finish()
    }
}

fn transition(entry: &mut SearchEntry, to: SearchStatus) -> Result<(), BookkeepingError> {
    if !entry.status.can_transition_to(to) {
        return Err(BookkeepingError::IllegalTransition {
            search_id: entry.search_id.clone(),
            from: entry.status,
            to,
        });
    }
    entry.status = to;
    Ok(())
}
