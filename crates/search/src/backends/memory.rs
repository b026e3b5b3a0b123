//! In-process resource store.
//!
//! Evaluates the specification carried by a [`GeneratedQuery`] directly
//! against records held in memory, so it needs no SQL engine. It also offers
//! latency and failure injection, which the coordinator tests rely on.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::query::{BackendDialect, GeneratedQuery, QueryKind};
use crate::store::{RecordCursor, ResourceStore};
use crate::types::{
    PartitionScope, ResultWindow, SearchModifier, SearchPredicate, SearchPrefix,
    SearchSpecification, SearchValue, SortDirection,
};

/// An indexed value of one search parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    /// String value.
    String(String),
    /// Coded value with an optional system.
    Token {
        /// Code system URI.
        system: Option<String>,
        /// The code.
        code: String,
    },
    /// ISO-8601 date or date-time.
    Date(String),
    /// Plain number.
    Number(f64),
    /// Quantity with an optional unit code.
    Quantity {
        /// Numeric value.
        value: f64,
        /// Unit code.
        unit: Option<String>,
    },
    /// Reference such as `Patient/123`.
    Reference(String),
    /// URI value.
    Uri(String),
}

impl IndexValue {
    /// Creates a token value.
    pub fn token(system: Option<&str>, code: impl Into<String>) -> Self {
        IndexValue::Token {
            system: system.map(str::to_string),
            code: code.into(),
        }
    }

    fn sort_key(&self) -> SortKey {
        match self {
            IndexValue::String(s)
            | IndexValue::Date(s)
            | IndexValue::Reference(s)
            | IndexValue::Uri(s) => SortKey::Text(s.clone()),
            IndexValue::Token { code, .. } => SortKey::Text(code.clone()),
            IndexValue::Number(n) | IndexValue::Quantity { value: n, .. } => SortKey::Number(*n),
        }
    }
}

/// A record as seen by the search engine: identity plus indexed values.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Record identifier.
    pub id: String,
    /// Resource type.
    pub resource_type: String,
    /// Partition, if any.
    pub partition: Option<String>,
    /// Last update as an ISO-8601 instant.
    pub last_updated: String,
    /// Indexed parameter values.
    pub index: Vec<(String, IndexValue)>,
}

impl StoredRecord {
    /// Creates a record with no indexed values.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            partition: None,
            last_updated: "1970-01-01T00:00:00Z".to_string(),
            index: Vec::new(),
        }
    }

    /// Places the record in a partition.
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// Sets the last-updated instant.
    pub fn with_last_updated(mut self, last_updated: impl Into<String>) -> Self {
        self.last_updated = last_updated.into();
        self
    }

    /// Adds an indexed value.
    pub fn with_index(mut self, param: impl Into<String>, value: IndexValue) -> Self {
        self.index.push((param.into(), value));
        self
    }

    fn values_of<'a>(&'a self, param: &'a str) -> impl Iterator<Item = &'a IndexValue> + 'a {
        self.index
            .iter()
            .filter(move |(name, _)| name == param)
            .map(|(_, value)| value)
    }
}

/// Injected failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailurePlan {
    /// `execute_query` itself fails.
    OnExecute(String),
    /// The cursor fails after handing out this many windows.
    AfterWindows(usize, String),
}

/// In-memory [`ResourceStore`].
#[derive(Debug)]
pub struct MemoryResourceStore {
    records: RwLock<Vec<StoredRecord>>,
    dialect: BackendDialect,
    window_delay: RwLock<Option<Duration>>,
    failure: RwLock<Option<FailurePlan>>,
    executions: AtomicUsize,
    windows_served: Arc<AtomicUsize>,
}

impl MemoryResourceStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            dialect: BackendDialect::Sqlite,
            window_delay: RwLock::new(None),
            failure: RwLock::new(None),
            executions: AtomicUsize::new(0),
            windows_served: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes the store report a different dialect.
    ///
    /// Queries are still evaluated in memory; this only changes which
    /// pagination shape the builder produces, e.g. client side skipping.
    pub fn with_dialect(mut self, dialect: BackendDialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Adds a record.
    pub fn insert(&self, record: StoredRecord) {
        self.records.write().push(record);
    }

    /// Adds several records.
    pub fn insert_all(&self, records: impl IntoIterator<Item = StoredRecord>) {
        self.records.write().extend(records);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Sleeps this long before handing out each window.
    pub fn set_window_delay(&self, delay: Option<Duration>) {
        *self.window_delay.write() = delay;
    }

    /// Installs a failure plan.
    pub fn set_failure(&self, plan: Option<FailurePlan>) {
        *self.failure.write() = plan;
    }

    /// Number of identifier queries executed.
    pub fn executions(&self) -> usize {
        self.executions.load(AtomicOrdering::SeqCst)
    }

    /// Number of windows handed out by all cursors.
    pub fn windows_served(&self) -> usize {
        self.windows_served.load(AtomicOrdering::SeqCst)
    }

    /// Returns the matching identifiers in search order.
    pub fn evaluate(&self, spec: &SearchSpecification) -> Vec<String> {
        let records = self.records.read();
        let mut matches: Vec<&StoredRecord> = records
            .iter()
            .filter(|record| record.resource_type == spec.resource_type())
            .filter(|record| match spec.partition() {
                PartitionScope::All => true,
                PartitionScope::Partition(p) => record.partition.as_deref() == Some(p.as_str()),
            })
            .filter(|record| spec.predicates().iter().all(|p| matches_predicate(record, p)))
            .collect();

        matches.sort_by(|a, b| compare_records(a, b, spec));
        matches.into_iter().map(|record| record.id.clone()).collect()
    }
}

impl Default for MemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn dialect(&self) -> BackendDialect {
        self.dialect
    }

    async fn execute_query(&self, query: GeneratedQuery) -> StoreResult<Box<dyn RecordCursor>> {
        if query.kind != QueryKind::Identifiers {
            return Err(StoreError::QueryFailed {
                message: "expected an identifier query".to_string(),
            });
        }
        let fail_after = match self.failure.read().clone() {
            Some(FailurePlan::OnExecute(message)) => {
                return Err(StoreError::QueryFailed { message });
            }
            Some(FailurePlan::AfterWindows(n, message)) => Some((n, message)),
            None => None,
        };
        self.executions.fetch_add(1, AtomicOrdering::SeqCst);

        let window = query.window.unwrap_or_else(|| ResultWindow::first(0));
        // Mirror what the statement returns: dialects that skip client side
        // get the leading rows too.
        let start = window.offset.saturating_sub(query.skip_rows) as usize;
        let ids: Vec<String> = self
            .evaluate(&query.specification)
            .into_iter()
            .skip(start)
            .take((window.end() as usize).saturating_sub(start))
            .collect();

        Ok(Box::new(MemoryCursor {
            ids: ids.into_iter(),
            delay: *self.window_delay.read(),
            fail_after,
            served: 0,
            windows_served: Arc::clone(&self.windows_served),
        }))
    }

    async fn count(&self, query: GeneratedQuery) -> StoreResult<u64> {
        if let Some(FailurePlan::OnExecute(message)) = self.failure.read().clone() {
            return Err(StoreError::QueryFailed { message });
        }
        Ok(self.evaluate(&query.specification).len() as u64)
    }
}

struct MemoryCursor {
    ids: std::vec::IntoIter<String>,
    delay: Option<Duration>,
    fail_after: Option<(usize, String)>,
    served: usize,
    windows_served: Arc<AtomicUsize>,
}

#[async_trait]
impl RecordCursor for MemoryCursor {
    async fn next_batch(&mut self, max: usize) -> StoreResult<Vec<String>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((after, message)) = &self.fail_after {
            if self.served >= *after {
                return Err(StoreError::QueryFailed {
                    message: message.clone(),
                });
            }
        }
        self.served += 1;
        self.windows_served.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(self.ids.by_ref().take(max).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SortKey {
    Text(String),
    Number(f64),
}

impl SortKey {
    fn cmp(&self, other: &SortKey) -> Ordering {
        match (self, other) {
            (SortKey::Number(a), SortKey::Number(b)) => a.total_cmp(b),
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            // Numbers sort before text, as in SQLite.
            (SortKey::Number(_), SortKey::Text(_)) => Ordering::Less,
            (SortKey::Text(_), SortKey::Number(_)) => Ordering::Greater,
        }
    }
}

fn sort_key(record: &StoredRecord, param: &str, direction: SortDirection) -> Option<SortKey> {
    match param {
        "_id" => return Some(SortKey::Text(record.id.clone())),
        "_lastUpdated" => return Some(SortKey::Text(record.last_updated.clone())),
        _ => {}
    }
    let keys = record.values_of(param).map(IndexValue::sort_key);
    match direction {
        SortDirection::Ascending => keys.min_by(|a, b| a.cmp(b)),
        SortDirection::Descending => keys.max_by(|a, b| a.cmp(b)),
    }
}

/// Missing keys sort first ascending and last descending.
fn compare_records(a: &StoredRecord, b: &StoredRecord, spec: &SearchSpecification) -> Ordering {
    for directive in spec.sort() {
        let left = sort_key(a, &directive.parameter, directive.direction);
        let right = sort_key(b, &directive.parameter, directive.direction);
        let ordering = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(l), Some(r)) => l.cmp(&r),
        };
        let ordering = match directive.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.id.cmp(&b.id)
}

fn matches_predicate(record: &StoredRecord, predicate: &SearchPredicate) -> bool {
    let modifier = predicate.modifier.as_ref();

    match predicate.parameter.as_str() {
        "_id" => {
            let hit = predicate.values.iter().any(|v| v.value == record.id);
            return if modifier == Some(&SearchModifier::Not) { !hit } else { hit };
        }
        "_lastUpdated" => {
            return predicate
                .values
                .iter()
                .any(|v| compare_text(&record.last_updated, v));
        }
        _ => {}
    }

    if modifier == Some(&SearchModifier::Missing) {
        let missing = predicate.values.first().is_some_and(|v| v.value == "true");
        let present = record.values_of(&predicate.parameter).next().is_some();
        return present != missing;
    }

    let hit = record.values_of(&predicate.parameter).any(|indexed| {
        predicate
            .values
            .iter()
            .any(|value| matches_value(indexed, modifier, value))
    });

    if modifier == Some(&SearchModifier::Not) { !hit } else { hit }
}

fn matches_value(
    indexed: &IndexValue,
    modifier: Option<&SearchModifier>,
    value: &SearchValue,
) -> bool {
    match indexed {
        IndexValue::String(s) => match modifier {
            Some(SearchModifier::Exact) => *s == value.value,
            Some(SearchModifier::Contains) => {
                s.to_lowercase().contains(&value.value.to_lowercase())
            }
            _ => s.to_lowercase().starts_with(&value.value.to_lowercase()),
        },
        IndexValue::Token { system, code } => match value.value.split_once('|') {
            None => *code == value.value,
            Some(("", c)) => system.is_none() && code == c,
            Some((s, "")) => system.as_deref() == Some(s),
            Some((s, c)) => system.as_deref() == Some(s) && code == c,
        },
        IndexValue::Date(d) => compare_text(d, value),
        IndexValue::Number(n) => compare_number(*n, value),
        IndexValue::Quantity { value: n, unit } => {
            let mut parts = value.value.splitn(3, '|');
            let number = parts.next().unwrap_or_default();
            let wanted_unit = parts.last().filter(|u| !u.is_empty());
            let numeric = SearchValue::new(value.prefix, number);
            compare_number(*n, &numeric)
                && wanted_unit.is_none_or(|u| unit.as_deref() == Some(u))
        }
        IndexValue::Reference(r) => match modifier {
            Some(SearchModifier::Type(target)) => *r == format!("{}/{}", target, value.value),
            _ => *r == value.value,
        },
        IndexValue::Uri(u) => match modifier {
            Some(SearchModifier::Below) => u.starts_with(&value.value),
            Some(SearchModifier::Above) => value.value.starts_with(u.as_str()),
            _ => *u == value.value,
        },
    }
}

/// Textual comparison with prefix-match equality, as the SQL form does.
fn compare_text(stored: &str, value: &SearchValue) -> bool {
    let wanted = value.value.as_str();
    match value.prefix {
        SearchPrefix::Eq => stored.starts_with(wanted),
        SearchPrefix::Ne => !stored.starts_with(wanted),
        SearchPrefix::Gt | SearchPrefix::Sa => stored > wanted,
        SearchPrefix::Lt | SearchPrefix::Eb => stored < wanted,
        SearchPrefix::Ge => stored >= wanted,
        SearchPrefix::Le => stored <= wanted,
        SearchPrefix::Ap => false,
    }
}

fn compare_number(stored: f64, value: &SearchValue) -> bool {
    let Ok(wanted) = value.value.parse::<f64>() else {
        return false;
    };
    match value.prefix {
        SearchPrefix::Eq => stored == wanted,
        SearchPrefix::Ne => stored != wanted,
        SearchPrefix::Gt | SearchPrefix::Sa => stored > wanted,
        SearchPrefix::Lt | SearchPrefix::Eb => stored < wanted,
        SearchPrefix::Ge => stored >= wanted,
        SearchPrefix::Le => stored <= wanted,
        SearchPrefix::Ap => false,
    }
}
