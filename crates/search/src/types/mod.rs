//! Core types for search coordination.
//!
//! This module contains the data model shared by every component:
//!
//! - [`SearchSpecification`] - the immutable description of a search request
//! - [`SearchPredicate`] / [`SortDirective`] - predicate and sort building blocks
//! - [`SearchEntry`] / [`SearchStatus`] - bookkeeping records
//! - [`ResultBatch`] / [`Page`] / [`PageToken`] - materialized results and paging

mod entry;
mod pagination;
mod search_params;
mod specification;

pub use entry::{SearchEntry, SearchId, SearchStatus};
pub use pagination::{Page, PageToken, ResultBatch, ResultWindow};
pub use search_params::{
    SearchModifier, SearchParamType, SearchPredicate, SearchPrefix, SearchValue, SortDirection,
    SortDirective,
};
pub use specification::{DEFAULT_LOAD_SIZE, PartitionScope, SearchSpecification, TotalMode};
