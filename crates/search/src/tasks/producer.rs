//! The windowed fetch loop shared by search and continuation tasks.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{ExecutionContext, TaskState};
use crate::error::{ExecutionError, SearchError, SearchResult, StoreResult};
use crate::types::{
    ResultBatch, ResultWindow, SearchId, SearchSpecification, SearchStatus, TotalMode,
};

/// Which rows a producer run materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchPlan {
    /// First row to fetch; equals the materialized count.
    pub start: u64,
    /// Rows to keep. One extra row is requested to learn whether more remain.
    pub load: u64,
    /// Run the count query before fetching.
    pub count_total: bool,
}

/// How the fetch loop ended.
enum Outcome {
    Exhausted { total: u64 },
    MoreAvailable { materialized: u64 },
    Cancelled { materialized: u64 },
}

/// Runs one producer to completion and records the result in bookkeeping.
pub(crate) async fn produce(
    ctx: &ExecutionContext,
    search_id: &SearchId,
    spec: &Arc<SearchSpecification>,
    token: &CancellationToken,
    plan: FetchPlan,
) -> TaskState {
    let mut state = TaskState::Created;

    let outcome = fetch(ctx, search_id, spec, token, plan, &mut state).await;
    let recorded = match outcome {
        Ok(Outcome::Exhausted { total }) => {
            info!(search_id = %search_id, total, "Search exhausted backend");
            finish_exhausted(ctx, search_id, total).map(|_| TaskState::Complete)
        }
        Ok(Outcome::MoreAvailable { materialized }) => {
            info!(search_id = %search_id, materialized, "Search load complete, more available");
            ctx.search_cache
                .complete(search_id, true, None)
                .map(|_| TaskState::Complete)
        }
        Ok(Outcome::Cancelled { materialized }) => {
            info!(search_id = %search_id, materialized, "Search cancelled");
            ctx.search_cache
                .mark_cancelled(search_id)
                .map(|_| TaskState::Cancelled)
        }
        Err(e) => {
            warn!(search_id = %search_id, error = %e, "Search failed");
            ctx.search_cache
                .fail(search_id, e.to_string())
                .map(|_| TaskState::Failed)
        }
    };

    match recorded {
        Ok(final_state) => {
            advance(&mut state, final_state);
            final_state
        }
        Err(e) => {
            warn!(search_id = %search_id, error = %e, "Failed to record task outcome");
            if e.requires_reissue() {
                // Evicted mid-run: drop whatever the producer wrote after the sweep.
                if let Err(e) = ctx.result_cache.delete(search_id) {
                    warn!(search_id = %search_id, error = %e, "Failed to delete orphaned results");
                }
            }
            TaskState::Failed
        }
    }
}

fn finish_exhausted(ctx: &ExecutionContext, search_id: &SearchId, total: u64) -> SearchResult<()> {
    ctx.result_cache.mark_complete(search_id, total)?;
    ctx.search_cache.complete(search_id, false, Some(total))?;
    Ok(())
}

fn advance(state: &mut TaskState, next: TaskState) {
    if *state != next {
        trace!(from = %state, to = %next, "Task state");
        *state = next;
    }
}

/// Awaits a backend call under the window timeout.
async fn within_window<T, F>(ctx: &ExecutionContext, call: F) -> SearchResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(ctx.window_timeout, call).await {
        Ok(result) => result.map_err(|e| SearchError::from(ExecutionError::Backend(e))),
        Err(_) => Err(ExecutionError::WindowTimeout {
            timeout_ms: u64::try_from(ctx.window_timeout.as_millis()).unwrap_or(u64::MAX),
        }
        .into()),
    }
}

async fn fetch(
    ctx: &ExecutionContext,
    search_id: &SearchId,
    spec: &Arc<SearchSpecification>,
    token: &CancellationToken,
    plan: FetchPlan,
    state: &mut TaskState,
) -> SearchResult<Outcome> {
    if token.is_cancelled() {
        return Ok(Outcome::Cancelled {
            materialized: plan.start,
        });
    }

    let dialect = ctx.store.dialect();
    ctx.search_cache
        .update_status(search_id, SearchStatus::Running)?;

    if plan.count_total && spec.total_mode() == TotalMode::Accurate {
        let count_query = ctx.builder.build_count(spec, dialect)?;
        let total = within_window(ctx, ctx.store.count(count_query)).await?;
        ctx.search_cache.set_total(search_id, total)?;
        debug!(search_id = %search_id, total, "Counted matches");
    }

    let window = ResultWindow::new(plan.start, plan.load.saturating_add(1));
    let query = ctx.builder.build(spec, dialect, window)?;
    let mut to_skip = query.skip_rows;

    advance(state, TaskState::Fetching);
    let mut cursor = within_window(ctx, ctx.store.execute_query(query)).await?;

    let mut next_offset = plan.start;
    let mut kept = 0u64;

    loop {
        if token.is_cancelled() {
            return Ok(Outcome::Cancelled {
                materialized: next_offset,
            });
        }

        advance(state, TaskState::Fetching);
        let mut ids = within_window(ctx, cursor.next_batch(ctx.batch_size)).await?;
        if ids.is_empty() {
            return Ok(Outcome::Exhausted { total: next_offset });
        }

        if to_skip > 0 {
            let skipped = to_skip.min(ids.len() as u64);
            ids.drain(..skipped as usize);
            to_skip -= skipped;
            if ids.is_empty() {
                continue;
            }
        }

        let quota = plan.load - kept;
        let overflow = ids.len() as u64 > quota;
        if overflow {
            ids.truncate(quota as usize);
        }

        if !ids.is_empty() {
            let batch = ResultBatch::new(next_offset, ids);
            let written = batch.len();
            ctx.search_cache.touch(search_id)?;
            ctx.result_cache.append_batch(search_id, batch)?;
            next_offset += written;
            kept += written;
            advance(state, TaskState::BatchWritten);
            debug!(
                search_id = %search_id,
                offset = next_offset - written,
                count = written,
                "Wrote result window"
            );
        }

        if overflow {
            return Ok(Outcome::MoreAvailable {
                materialized: next_offset,
            });
        }
    }
}
