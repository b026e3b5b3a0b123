//! Helios Search demo
//!
//! Seeds a store with observations, runs a search and pages through it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use helios_search::backends::{IndexValue, MemoryResourceStore, StoredRecord};
use helios_search::types::{SearchPredicate, SearchSpecification, SortDirective, TotalMode};
use helios_search::{
    ResourceStore, SearchConfig, SearchContext, SearchCoordinator, SearchStatus, init_logging,
};
use tracing::info;

#[cfg(feature = "sqlite")]
use helios_search::backends::SqliteResourceStore;

const OBSERVATIONS: usize = 120;
const PAGE_SIZE: u64 = 50;

fn demo_records() -> Vec<StoredRecord> {
    (0..OBSERVATIONS)
        .map(|i| {
            StoredRecord::new("Observation", format!("obs-{:04}", i))
                .with_last_updated(format!("2024-03-{:02}T08:00:00Z", i % 28 + 1))
                .with_index("code", IndexValue::token(Some("http://loinc.org"), "8867-4"))
                .with_index("status", IndexValue::token(None, "final"))
                .with_index("date", IndexValue::Date(format!("2024-03-{:02}", i % 28 + 1)))
                .with_index("subject", IndexValue::Reference(format!("Patient/{}", i % 7)))
        })
        .collect()
}

#[cfg(feature = "sqlite")]
fn create_sqlite_store(path: &str) -> anyhow::Result<Arc<dyn ResourceStore>> {
    info!(database = %path, "Initializing SQLite store");
    let store = if path == ":memory:" {
        SqliteResourceStore::in_memory()?
    } else {
        SqliteResourceStore::open(path)?
    };
    store.init_schema()?;
    store.insert_records(&demo_records())?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
fn create_sqlite_store(_path: &str) -> anyhow::Result<Arc<dyn ResourceStore>> {
    anyhow::bail!("built without the sqlite feature")
}

fn create_store(config: &SearchConfig) -> anyhow::Result<Arc<dyn ResourceStore>> {
    match config.database_url.as_deref() {
        Some(path) => create_sqlite_store(path),
        None => {
            let store = MemoryResourceStore::new().with_dialect(config.dialect);
            store.insert_all(demo_records());
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SearchConfig::parse();
    init_logging(&config.log_level);

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    info!(
        version = helios_search::VERSION,
        batch_size = config.batch_size,
        dialect = %config.dialect,
        "Starting Helios search demo"
    );

    let store = create_store(&config)?;
    let coordinator = Arc::new(SearchCoordinator::new(store, config)?);
    let sweeper = coordinator.spawn_sweeper();

    let spec = SearchSpecification::new("Observation")
        .with_predicate(SearchPredicate::eq("code", "http://loinc.org|8867-4"))
        .with_sort(SortDirective::descending("date"))
        .with_load_size(PAGE_SIZE as u32)
        .with_total_mode(TotalMode::Accurate);

    let search_id = coordinator
        .start_search(spec, &SearchContext::new())
        .await
        .context("failed to start search")?;
    println!("search {}", search_id);

    let mut offset = 0;
    loop {
        let page = coordinator.get_page(&search_id, offset, PAGE_SIZE).await?;
        if (page.len() as u64) < PAGE_SIZE && page.has_more {
            // Still materializing; poll again shortly.
            tokio::time::sleep(Duration::from_millis(20)).await;
            continue;
        }

        println!(
            "offset {:>4}: {:>3} ids, total {:?}, more {}",
            page.offset,
            page.len(),
            page.total,
            page.has_more
        );
        for id in &page.ids {
            println!("  {}", id);
        }

        if !page.has_more {
            break;
        }
        offset += page.len() as u64;
    }

    let entry = coordinator.get_status(&search_id).await?;
    if entry.status == SearchStatus::Failed {
        anyhow::bail!(
            "search failed: {}",
            entry.failure.unwrap_or_else(|| "unknown cause".to_string())
        );
    }
    println!("status {}", entry.status);

    coordinator.shutdown();
    sweeper.await?;
    Ok(())
}
