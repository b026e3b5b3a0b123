//! Shared fixtures and polling helpers for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use helios_search::backends::{IndexValue, MemoryResourceStore, StoredRecord};
use helios_search::{Page, SearchConfig, SearchCoordinator, SearchEntry, SearchId, SearchStatus};

/// How long polling helpers wait before giving up.
pub const POLL_LIMIT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// An Observation with a LOINC code, a status and a date.
pub fn observation(i: usize) -> StoredRecord {
    StoredRecord::new("Observation", format!("obs-{:04}", i))
        .with_last_updated(format!("2024-01-01T00:{:02}:{:02}Z", (i / 60) % 60, i % 60))
        .with_index("code", IndexValue::token(Some("http://loinc.org"), "8867-4"))
        .with_index("status", IndexValue::token(None, if i % 2 == 0 { "final" } else { "amended" }))
        .with_index("date", IndexValue::Date(format!("2024-02-{:02}", i % 28 + 1)))
        .with_index("value-quantity", IndexValue::Quantity {
            value: i as f64,
            unit: Some("mg".to_string()),
        })
        .with_index("subject", IndexValue::Reference(format!("Patient/p{}", i % 5)))
}

/// `n` observations `obs-0000..`.
pub fn observations(n: usize) -> Vec<StoredRecord> {
    (0..n).map(observation).collect()
}

/// A memory store seeded with `n` observations.
pub fn seeded_store(n: usize) -> Arc<MemoryResourceStore> {
    let store = Arc::new(MemoryResourceStore::new());
    store.insert_all(observations(n));
    store
}

/// A coordinator over `store` with the testing configuration.
pub fn create_coordinator(store: Arc<MemoryResourceStore>) -> SearchCoordinator {
    create_coordinator_with(store, SearchConfig::for_testing())
}

/// A coordinator over `store` with a custom configuration.
pub fn create_coordinator_with(
    store: Arc<MemoryResourceStore>,
    config: SearchConfig,
) -> SearchCoordinator {
    SearchCoordinator::new(store, config).expect("Failed to create coordinator")
}

/// Polls until the search satisfies `done`.
pub async fn wait_for<F>(coordinator: &SearchCoordinator, id: &SearchId, done: F) -> SearchEntry
where
    F: Fn(&SearchEntry) -> bool,
{
    let polled = tokio::time::timeout(POLL_LIMIT, async {
        loop {
            let entry = coordinator.get_status(id).await.expect("status");
            if done(&entry) {
                return entry;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    polled.unwrap_or_else(|_| panic!("search {} did not reach the expected state", id))
}

/// Polls until the search reaches `status`.
pub async fn wait_for_status(
    coordinator: &SearchCoordinator,
    id: &SearchId,
    status: SearchStatus,
) -> SearchEntry {
    wait_for(coordinator, id, |entry| entry.status == status).await
}

/// Polls until the search has no producer left.
pub async fn wait_until_settled(coordinator: &SearchCoordinator, id: &SearchId) -> SearchEntry {
    wait_for(coordinator, id, |entry| entry.status.is_terminal()).await
}

/// Polls a page until it is full or the result set says nothing more exists.
pub async fn wait_for_page(
    coordinator: &SearchCoordinator,
    id: &SearchId,
    offset: u64,
    count: u64,
) -> Page {
    let polled = tokio::time::timeout(POLL_LIMIT, async {
        loop {
            let page = coordinator.get_page(id, offset, count).await.expect("page");
            if page.len() as u64 == count || !page.has_more {
                return page;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    polled.unwrap_or_else(|_| panic!("page {}+{} of {} never filled", offset, count, id))
}

/// Reads the whole result set in pages of `page_size` at offsets 0, N, 2N...
pub async fn collect_pages(coordinator: &SearchCoordinator, id: &SearchId, page_size: u64) -> Vec<Page> {
    let mut pages = Vec::new();
    let mut offset = 0;
    loop {
        let page = wait_for_page(coordinator, id, offset, page_size).await;
        let has_more = page.has_more;
        pages.push(page);
        if !has_more {
            return pages;
        }
        offset += page_size;
    }
}

/// Asserts that `ids` holds no duplicates.
pub fn assert_unique(ids: &[String]) {
    let distinct: HashSet<&String> = ids.iter().collect();
    assert_eq!(distinct.len(), ids.len(), "duplicate identifiers in {:?}", ids);
}
