//! Dialect aware query generation.
//!
//! [`QueryBuilder`] compiles a [`SearchSpecification`](crate::types::SearchSpecification)
//! into a [`GeneratedQuery`] for one [`BackendDialect`]. Parameter metadata
//! comes from a [`ParameterCatalog`].

mod builder;
mod catalog;
mod dialect;
mod fragment;

pub use builder::{GeneratedQuery, QueryBuilder, QueryKind};
pub use catalog::{ANY_RESOURCE, ParameterCatalog, ParameterDefinition, is_valid_code};
pub use dialect::{
    BackendDialect, DialectProfile, PaginateFn, PaginatedSql, PlaceholderStyle, SelectParts,
};
pub use fragment::{SqlFragment, SqlParam, number_placeholders};
