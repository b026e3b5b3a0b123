//! Materialized result sets.
//!
//! Each search's identifiers are stored as append-only batches in the
//! key-value backing, plus one metadata record:
//!
//! - `result:<id>:meta` - batch spans, materialized count, total, last access
//! - `result:<id>:batch:<seq>` - identifiers of batch `seq`
//!
//! Appends for one search are serialized by a per-search lock; different
//! searches never contend. Batches are written before the metadata that
//! references them, so a reader never sees a span without its batch and
//! reads take no lock at all. Read times are kept in memory and folded
//! into the metadata on the next write.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::kv::KeyValueStore;
use crate::error::{ConsistencyError, SearchResult, StoreError, StoreResult};
use crate::types::{Page, ResultBatch, SearchId};

fn prefix(search_id: &SearchId) -> String {
    format!("result:{}:", search_id)
}

fn meta_key(search_id: &SearchId) -> String {
    format!("result:{}:meta", search_id)
}

fn batch_key(search_id: &SearchId, seq: usize) -> String {
    format!("result:{}:batch:{:08}", search_id, seq)
}

/// One stored batch: where it starts and how many identifiers it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct BatchSpan {
    offset: u64,
    len: u64,
}

impl BatchSpan {
    fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Metadata record of one result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResultMeta {
    spans: Vec<BatchSpan>,
    materialized: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total: Option<u64>,
    complete: bool,
    last_access: DateTime<Utc>,
}

impl Default for ResultMeta {
    fn default() -> Self {
        Self {
            spans: Vec::new(),
            materialized: 0,
            total: None,
            complete: false,
            last_access: Utc::now(),
        }
    }
}

/// How much of a result set has been materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultProgress {
    /// Number of identifiers stored.
    pub materialized: u64,
    /// Whether the producer reached the end of the backend cursor.
    pub complete: bool,
    /// Total number of matches, once known.
    pub total: Option<u64>,
}

/// Durable mapping from search ID to its ordered identifiers.
pub struct ResultCache {
    kv: Arc<dyn KeyValueStore>,
    locks: Mutex<HashMap<SearchId, Arc<Mutex<()>>>>,
    accessed: Mutex<HashMap<SearchId, DateTime<Utc>>>,
}

impl ResultCache {
    /// Creates a result cache over `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            locks: Mutex::new(HashMap::new()),
            accessed: Mutex::new(HashMap::new()),
        }
    }

    /// Appends a batch.
    ///
    /// # Errors
    ///
    /// * `ConsistencyError::OutOfOrderBatch` - If the batch does not start at
    ///   the current materialized count
    /// * `ConsistencyError::AlreadyComplete` - If the set was marked complete
    pub fn append_batch(&self, search_id: &SearchId, batch: ResultBatch) -> SearchResult<()> {
        let lock = self.lock_for(search_id);
        let _guard = lock.lock();

        let mut meta = self.read_meta(search_id)?.unwrap_or_default();
        if meta.complete {
            return Err(ConsistencyError::AlreadyComplete {
                search_id: search_id.clone(),
            }
            .into());
        }
        if batch.offset != meta.materialized {
            return Err(ConsistencyError::OutOfOrderBatch {
                search_id: search_id.clone(),
                expected: meta.materialized,
                actual: batch.offset,
            }
            .into());
        }
        if batch.is_empty() {
            return Ok(());
        }

        let span = BatchSpan {
            offset: batch.offset,
            len: batch.len(),
        };
        self.kv.put(
            &batch_key(search_id, meta.spans.len()),
            serde_json::to_vec(&batch.ids)?,
        )?;

        meta.spans.push(span);
        meta.materialized = span.end();
        self.write_meta(search_id, &mut meta)?;

        debug!(
            search_id = %search_id,
            offset = span.offset,
            count = span.len,
            materialized = meta.materialized,
            "Appended result batch"
        );
        Ok(())
    }

    /// Marks the result set complete with the given total.
    ///
    /// Marking twice with the same total is a no-op.
    pub fn mark_complete(&self, search_id: &SearchId, total: u64) -> SearchResult<()> {
        let lock = self.lock_for(search_id);
        let _guard = lock.lock();

        let mut meta = self.read_meta(search_id)?.unwrap_or_default();
        if meta.complete {
            if meta.total == Some(total) {
                return Ok(());
            }
            return Err(ConsistencyError::AlreadyComplete {
                search_id: search_id.clone(),
            }
            .into());
        }

        meta.complete = true;
        meta.total = Some(total);
        self.write_meta(search_id, &mut meta)?;
        debug!(search_id = %search_id, total, "Result set complete");
        Ok(())
    }

    /// Returns the largest available prefix of `[offset, offset + count)`.
    ///
    /// Never waits for a producer: a range that is not materialized yet comes
    /// back short, with `has_more` set. Reads do not contend with appends.
    pub fn get_range(&self, search_id: &SearchId, offset: u64, count: u64) -> SearchResult<Page> {
        let Some(meta) = self.read_meta(search_id)? else {
            return Ok(pending(offset));
        };

        let end = offset.saturating_add(count).min(meta.materialized);
        let mut ids = Vec::with_capacity(end.saturating_sub(offset) as usize);

        if offset < end {
            let first = meta.spans.partition_point(|span| span.end() <= offset);
            for (seq, span) in meta.spans.iter().enumerate().skip(first) {
                if span.offset >= end {
                    break;
                }
                let Some(stored) = self.read_batch(search_id, seq)? else {
                    if self.read_meta(search_id)?.is_none() {
                        // Deleted since the metadata was read.
                        return Ok(pending(offset));
                    }
                    return Err(StoreError::Internal {
                        backend_name: "result-cache".to_string(),
                        message: format!("batch {} of {} is missing", seq, search_id),
                        source: None,
                    }
                    .into());
                };
                let from = offset.saturating_sub(span.offset) as usize;
                let to = (end.min(span.end()) - span.offset) as usize;
                ids.extend(stored.into_iter().take(to).skip(from));
            }
        }

        let returned_end = offset + ids.len() as u64;
        let has_more = if meta.complete {
            returned_end < meta.total.unwrap_or(meta.materialized)
        } else {
            true
        };

        self.accessed.lock().insert(search_id.clone(), Utc::now());

        Ok(Page {
            offset,
            ids,
            has_more,
            total: if meta.complete { meta.total } else { None },
            next_token: None,
        })
    }

    /// Returns how much of the result set is materialized.
    pub fn progress(&self, search_id: &SearchId) -> SearchResult<ResultProgress> {
        Ok(self
            .read_meta(search_id)?
            .map(|meta| ResultProgress {
                materialized: meta.materialized,
                complete: meta.complete,
                total: meta.total,
            })
            .unwrap_or_default())
    }

    /// When the result set was last read, if it has been read since it was
    /// last written or since this process started.
    pub fn last_access(&self, search_id: &SearchId) -> Option<DateTime<Utc>> {
        self.accessed.lock().get(search_id).copied()
    }

    /// Removes every key of a result set.
    pub fn delete(&self, search_id: &SearchId) -> SearchResult<usize> {
        let lock = self.lock_for(search_id);
        let removed = {
            let _guard = lock.lock();
            self.kv.delete_prefix(&prefix(search_id))?
        };
        self.locks.lock().remove(search_id);
        self.accessed.lock().remove(search_id);
        debug!(search_id = %search_id, keys = removed, "Deleted result set");
        Ok(removed)
    }

    fn lock_for(&self, search_id: &SearchId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(search_id.clone())
            .or_default()
            .clone()
    }

    fn read_meta(&self, search_id: &SearchId) -> StoreResult<Option<ResultMeta>> {
        match self.kv.get(&meta_key(search_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes the metadata, folding in the latest read time.
    fn write_meta(&self, search_id: &SearchId, meta: &mut ResultMeta) -> StoreResult<()> {
        if let Some(at) = self.last_access(search_id) {
            meta.last_access = meta.last_access.max(at);
        }
        self.kv.put(&meta_key(search_id), serde_json::to_vec(meta)?)
    }

    fn read_batch(&self, search_id: &SearchId, seq: usize) -> StoreResult<Option<Vec<String>>> {
        match self.kv.get(&batch_key(search_id, seq))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// An empty page of a result set whose producer has not written yet.
fn pending(offset: u64) -> Page {
    let mut page = Page::empty(offset);
    page.has_more = true;
    page
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("tracked_searches", &self.locks.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{KeyValueStore, MemoryKvStore};
    use crate::error::SearchError;

    fn ids(range: std::ops::Range<u64>) -> Vec<String> {
        range.map(|i| format!("r{}", i)).collect()
    }

    fn create_cache() -> (ResultCache, Arc<MemoryKvStore>) {
        let kv = Arc::new(MemoryKvStore::new());
        (ResultCache::new(kv.clone()), kv)
    }

    #[test]
    fn test_get_range_spans_batches() {
        let (cache, _) = create_cache();
        let id = SearchId::from("s");
        cache.append_batch(&id, ResultBatch::new(0, ids(0..10))).unwrap();
        cache.append_batch(&id, ResultBatch::new(10, ids(10..25))).unwrap();

        let page = cache.get_range(&id, 5, 10).unwrap();
        assert_eq!(page.ids, ids(5..15));
        assert!(page.has_more);
        assert_eq!(page.total, None);
    }

    #[test]
    fn test_get_range_returns_available_prefix() {
        let (cache, _) = create_cache();
        let id = SearchId::from("s");
        cache.append_batch(&id, ResultBatch::new(0, ids(0..10))).unwrap();

        let page = cache.get_range(&id, 5, 20).unwrap();
        assert_eq!(page.ids, ids(5..10));
        assert!(page.has_more);

        let page = cache.get_range(&id, 50, 20).unwrap();
        assert!(page.ids.is_empty());
        assert!(page.has_more);
    }

    #[test]
    fn test_unknown_result_set_is_pending() {
        let (cache, _) = create_cache();
        let page = cache.get_range(&SearchId::from("nothing-yet"), 0, 10).unwrap();
        assert!(page.ids.is_empty());
        assert!(page.has_more);
    }

    #[test]
    fn test_complete_set_reports_end() {
        let (cache, _) = create_cache();
        let id = SearchId::from("s");
        cache.append_batch(&id, ResultBatch::new(0, ids(0..20))).unwrap();
        cache.mark_complete(&id, 20).unwrap();

        let page = cache.get_range(&id, 10, 10).unwrap();
        assert_eq!(page.ids.len(), 10);
        assert!(!page.has_more);
        assert_eq!(page.total, Some(20));

        let page = cache.get_range(&id, 0, 10).unwrap();
        assert!(page.has_more);

        let page = cache.get_range(&id, 30, 10).unwrap();
        assert!(page.ids.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn test_out_of_order_batch_is_rejected() {
        let (cache, _) = create_cache();
        let id = SearchId::from("s");
        cache.append_batch(&id, ResultBatch::new(0, ids(0..10))).unwrap();

        let err = cache
            .append_batch(&id, ResultBatch::new(5, ids(5..15)))
            .unwrap_err();
        assert!(matches!(
            err,
            SearchError::Consistency(ConsistencyError::OutOfOrderBatch {
                expected: 10,
                actual: 5,
                ..
            })
        ));

        let err = cache
            .append_batch(&id, ResultBatch::new(20, ids(20..25)))
            .unwrap_err();
        assert!(matches!(err, SearchError::Consistency(_)));
    }

    #[test]
    fn test_append_after_complete_is_rejected() {
        let (cache, _) = create_cache();
        let id = SearchId::from("s");
        cache.append_batch(&id, ResultBatch::new(0, ids(0..3))).unwrap();
        cache.mark_complete(&id, 3).unwrap();
        cache.mark_complete(&id, 3).unwrap();

        let err = cache
            .append_batch(&id, ResultBatch::new(3, ids(3..4)))
            .unwrap_err();
        assert!(matches!(
            err,
            SearchError::Consistency(ConsistencyError::AlreadyComplete { .. })
        ));
    }

    #[test]
    fn test_progress_and_delete() {
        let (cache, kv) = create_cache();
        let id = SearchId::from("s");
        let other = SearchId::from("other");
        cache.append_batch(&id, ResultBatch::new(0, ids(0..5))).unwrap();
        cache.append_batch(&id, ResultBatch::new(5, ids(5..7))).unwrap();
        cache.append_batch(&other, ResultBatch::new(0, ids(0..1))).unwrap();

        assert_eq!(
            cache.progress(&id).unwrap(),
            ResultProgress {
                materialized: 7,
                complete: false,
                total: None,
            }
        );

        // Two batches plus metadata.
        assert_eq!(cache.delete(&id).unwrap(), 3);
        assert_eq!(cache.progress(&id).unwrap(), ResultProgress::default());
        assert_eq!(kv.len(), 2);
    }

    #[test]
    fn test_concurrent_appenders_cannot_interleave() {
        let (cache, _) = create_cache();
        let cache = Arc::new(cache);
        let id = SearchId::from("s");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let id = id.clone();
                std::thread::spawn(move || cache.append_batch(&id, ResultBatch::new(0, ids(0..10))))
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Result::is_ok)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(cache.progress(&id).unwrap().materialized, 10);
    }

    #[test]
    fn test_reads_do_not_rewrite_metadata() {
        let (cache, kv) = create_cache();
        let id = SearchId::from("s");
        cache.append_batch(&id, ResultBatch::new(0, ids(0..10))).unwrap();
        let before = kv.get(&meta_key(&id)).unwrap();
        assert_eq!(cache.last_access(&id), None);

        let page = cache.get_range(&id, 0, 5).unwrap();
        assert_eq!(page.ids, ids(0..5));
        assert_eq!(kv.get(&meta_key(&id)).unwrap(), before);
        let read_at = cache.last_access(&id).unwrap();

        cache.append_batch(&id, ResultBatch::new(10, ids(10..12))).unwrap();
        let bytes = kv.get(&meta_key(&id)).unwrap().unwrap();
        let meta: ResultMeta = serde_json::from_slice(&bytes).unwrap();
        assert!(meta.last_access >= read_at);

        cache.delete(&id).unwrap();
        assert_eq!(cache.last_access(&id), None);
    }

    #[test]
    fn test_reads_proceed_while_append_lock_is_held() {
        let (cache, _) = create_cache();
        let id = SearchId::from("s");
        cache.append_batch(&id, ResultBatch::new(0, ids(0..10))).unwrap();

        let lock = cache.lock_for(&id);
        let _guard = lock.lock();
        let page = cache.get_range(&id, 2, 4).unwrap();
        assert_eq!(page.ids, ids(2..6));
        assert_eq!(cache.progress(&id).unwrap().materialized, 10);
    }
}
