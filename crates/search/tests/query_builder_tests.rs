//! Query generation across backend dialects.

use std::sync::Arc;

use helios_search::error::BuildError;
use helios_search::query::{BackendDialect, ParameterCatalog, QueryBuilder, QueryKind, SqlParam};
use helios_search::types::{
    PartitionScope, ResultWindow, SearchModifier, SearchPredicate, SearchSpecification,
    SortDirective,
};

const ALL_DIALECTS: [BackendDialect; 6] = [
    BackendDialect::Sqlite,
    BackendDialect::Postgres,
    BackendDialect::SqlServer,
    BackendDialect::Oracle,
    BackendDialect::Derby,
    BackendDialect::TopOnly,
];

fn builder() -> QueryBuilder {
    QueryBuilder::new(Arc::new(ParameterCatalog::with_defaults()))
}

fn observation_search() -> Arc<SearchSpecification> {
    Arc::new(
        SearchSpecification::new("Observation")
            .with_predicate(SearchPredicate::eq("code", "http://loinc.org|8867-4"))
            .with_predicate(SearchPredicate::parse("date", "ge2024-02-01"))
            .with_sort(SortDirective::descending("date")),
    )
}

/// Parameters bound by the filter alone.
fn filter_params(spec: &Arc<SearchSpecification>, dialect: BackendDialect) -> Vec<SqlParam> {
    builder().build_count(spec, dialect).unwrap().params
}

#[test]
fn test_placeholders_match_params_in_every_dialect() {
    let spec = observation_search();
    for dialect in ALL_DIALECTS {
        for window in [ResultWindow::first(51), ResultWindow::new(100, 501)] {
            let query = builder().build(&spec, dialect, window).unwrap();
            assert_eq!(query.placeholder_count, query.params.len(), "{}", dialect);
            assert_eq!(query.dialect, dialect);
            assert_eq!(query.kind, QueryKind::Identifiers);
            assert_eq!(query.window, Some(window));
        }
    }
}

#[test]
fn test_sql_server_later_window_uses_offset_fetch() {
    let spec = observation_search();
    let query = builder()
        .build(&spec, BackendDialect::SqlServer, ResultWindow::new(10, 500))
        .unwrap();

    assert!(query.sql.ends_with("OFFSET ? ROWS FETCH NEXT ? ROWS ONLY"));
    assert!(!query.sql.contains("TOP("));

    let mut expected = filter_params(&spec, BackendDialect::SqlServer);
    expected.push(SqlParam::Integer(10));
    expected.push(SqlParam::Integer(500));
    assert_eq!(query.params, expected);
}

#[test]
fn test_sql_server_first_window_uses_top() {
    let spec = observation_search();
    let query = builder()
        .build(&spec, BackendDialect::SqlServer, ResultWindow::first(500))
        .unwrap();

    assert!(query.sql.starts_with("SELECT TOP(?) "));
    assert!(!query.sql.contains("FETCH NEXT"));

    let filter = filter_params(&spec, BackendDialect::SqlServer);
    assert_eq!(query.params.len(), filter.len() + 1);
    assert_eq!(query.params[0], SqlParam::Integer(500));
    assert_eq!(&query.params[1..], filter.as_slice());
}

#[test]
fn test_postgres_has_no_question_marks() {
    let spec = observation_search();
    let query = builder()
        .build(&spec, BackendDialect::Postgres, ResultWindow::new(50, 51))
        .unwrap();

    assert!(!query.sql.contains('?'));
    let last = format!("${}", query.placeholder_count);
    assert!(query.sql.ends_with(&format!("OFFSET {}", last)));
}

#[test]
fn test_oracle_bounds_row_numbers() {
    let spec = observation_search();
    let query = builder()
        .build(&spec, BackendDialect::Oracle, ResultWindow::new(100, 50))
        .unwrap();

    assert!(query.sql.contains("ROW_NUMBER() OVER (ORDER BY"));
    let tail = &query.params[query.params.len() - 2..];
    assert_eq!(tail, &[SqlParam::Integer(100), SqlParam::Integer(150)]);
    assert_eq!(query.skip_rows, 0);
}

#[test]
fn test_derby_uses_offset_fetch_from_the_start() {
    let spec = observation_search();
    let query = builder()
        .build(&spec, BackendDialect::Derby, ResultWindow::first(20))
        .unwrap();
    assert!(query.sql.ends_with("OFFSET ? ROWS FETCH NEXT ? ROWS ONLY"));
}

#[test]
fn test_top_only_skips_rows_client_side() {
    let spec = observation_search();
    let query = builder()
        .build(&spec, BackendDialect::TopOnly, ResultWindow::new(30, 10))
        .unwrap();

    assert!(query.sql.starts_with("SELECT TOP(?) "));
    assert_eq!(query.params[0], SqlParam::Integer(40));
    assert_eq!(query.skip_rows, 30);
}

#[test]
fn test_order_is_total() {
    let spec = observation_search();
    for dialect in [BackendDialect::Sqlite, BackendDialect::SqlServer] {
        let query = builder()
            .build(&spec, dialect, ResultWindow::new(5, 5))
            .unwrap();
        let order_by = query.sql.split("ORDER BY").nth(1).unwrap();
        assert!(order_by.contains("r.res_id ASC"), "{}", query.sql);
    }
}

#[test]
fn test_count_query_ignores_window_and_order() {
    let spec = observation_search();
    let query = builder().build_count(&spec, BackendDialect::SqlServer).unwrap();
    assert!(query.sql.starts_with("SELECT COUNT(*)"));
    assert!(!query.sql.contains("ORDER BY"));
    assert_eq!(query.kind, QueryKind::Count);
    assert_eq!(query.window, None);
}

#[test]
fn test_partition_and_modifiers_compile() {
    let spec = Arc::new(
        SearchSpecification::new("Observation")
            .with_predicate(SearchPredicate::eq("subject", "true").with_modifier(SearchModifier::Missing))
            .with_predicate(SearchPredicate::eq("status", "cancelled").with_modifier(SearchModifier::Not))
            .with_partition(PartitionScope::Partition("tenant-a".to_string())),
    );
    for dialect in ALL_DIALECTS {
        let query = builder().build(&spec, dialect, ResultWindow::first(10)).unwrap();
        assert!(query.params.contains(&SqlParam::text("tenant-a")));
        assert!(query.params.contains(&SqlParam::text("cancelled")));
    }
}

#[test]
fn test_rejections() {
    let unknown = SearchSpecification::new("Observation")
        .with_predicate(SearchPredicate::eq("shoe-size", "42"));
    assert!(matches!(
        builder().validate(&unknown),
        Err(BuildError::UnsupportedPredicate { .. })
    ));

    let bad_sort = SearchSpecification::new("Observation").with_sort(SortDirective::ascending("shoe-size"));
    assert!(matches!(
        builder().validate(&bad_sort),
        Err(BuildError::InvalidSort { .. })
    ));

    let fine = observation_search();
    assert!(builder().validate(&fine).is_ok());
    assert!(matches!(
        builder().build(&fine, BackendDialect::Sqlite, ResultWindow::first(0)),
        Err(BuildError::InvalidSpecification { .. })
    ));
}
