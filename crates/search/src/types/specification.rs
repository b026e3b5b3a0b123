//! The immutable description of one incoming search request.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::search_params::{SearchPredicate, SortDirective};

/// Default number of identifiers the initial search task materializes.
pub const DEFAULT_LOAD_SIZE: u32 = 100;

/// Partition scope for a search.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", tag = "scope", content = "id")]
pub enum PartitionScope {
    /// Search across every partition.
    #[default]
    All,
    /// Restrict the search to a single partition.
    Partition(String),
}

/// Whether the search task should compute an exact total up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TotalMode {
    /// Total becomes known only once the backend cursor is exhausted.
    #[default]
    None,
    /// Run a count query before fetching identifiers.
    Accurate,
}

/// A structured search: resource type, predicates, sort and load size.
///
/// Built once per incoming request and never mutated afterwards; the builder
/// methods consume and return `self`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchSpecification {
    resource_type: String,
    predicates: Vec<SearchPredicate>,
    sort: Vec<SortDirective>,
    load_size: u32,
    partition: PartitionScope,
    #[serde(default)]
    total_mode: TotalMode,
}

impl SearchSpecification {
    /// Creates a specification for the given resource type.
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            predicates: Vec::new(),
            sort: Vec::new(),
            load_size: DEFAULT_LOAD_SIZE,
            partition: PartitionScope::All,
            total_mode: TotalMode::None,
        }
    }

    /// Adds a predicate.
    pub fn with_predicate(mut self, predicate: SearchPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Adds a sort directive.
    pub fn with_sort(mut self, sort: SortDirective) -> Self {
        self.sort.push(sort);
        self
    }

    /// Sets the initial load size.
    pub fn with_load_size(mut self, load_size: u32) -> Self {
        self.load_size = load_size;
        self
    }

    /// Restricts the search to a partition.
    pub fn with_partition(mut self, partition: PartitionScope) -> Self {
        self.partition = partition;
        self
    }

    /// Sets the total mode.
    pub fn with_total_mode(mut self, total_mode: TotalMode) -> Self {
        self.total_mode = total_mode;
        self
    }

    /// The resource type being searched.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Predicates, in the order they were added.
    pub fn predicates(&self) -> &[SearchPredicate] {
        &self.predicates
    }

    /// Sort directives, in priority order.
    pub fn sort(&self) -> &[SortDirective] {
        &self.sort
    }

    /// Number of identifiers the initial task should materialize.
    pub fn load_size(&self) -> u32 {
        self.load_size
    }

    /// Partition scope.
    pub fn partition(&self) -> &PartitionScope {
        &self.partition
    }

    /// Total mode.
    pub fn total_mode(&self) -> TotalMode {
        self.total_mode
    }

    /// Returns a stable fingerprint of everything that affects the result set.
    ///
    /// The load size does not change which records match, so two requests that
    /// only differ in it share a fingerprint. The total mode does change what
    /// bookkeeping the producer fills in, so it is part of the fingerprint.
    pub fn fingerprint(&self) -> String {
        let material = serde_json::json!({
            "resourceType": self.resource_type,
            "predicates": self.predicates,
            "sort": self.sort,
            "partition": self.partition,
            "totalMode": self.total_mode,
        });

        let mut hasher = Sha256::new();
        hasher.update(material.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SearchValue;

    fn observation_spec() -> SearchSpecification {
        SearchSpecification::new("Observation")
            .with_predicate(SearchPredicate::eq("code", "X"))
            .with_sort(SortDirective::parse("-date"))
    }

    #[test]
    fn test_defaults() {
        let spec = SearchSpecification::new("Patient");
        assert_eq!(spec.load_size(), DEFAULT_LOAD_SIZE);
        assert_eq!(spec.partition(), &PartitionScope::All);
        assert_eq!(spec.total_mode(), TotalMode::None);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(
            observation_spec().fingerprint(),
            observation_spec().fingerprint()
        );
        assert_eq!(observation_spec().fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_load_size() {
        assert_eq!(
            observation_spec().with_load_size(10).fingerprint(),
            observation_spec().with_load_size(500).fingerprint()
        );
    }

    #[test]
    fn test_fingerprint_differs_by_predicate() {
        let other = SearchSpecification::new("Observation")
            .with_predicate(SearchPredicate::new("code", vec![SearchValue::eq("Y")]))
            .with_sort(SortDirective::parse("-date"));
        assert_ne!(observation_spec().fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_fingerprint_differs_by_total_mode() {
        let counted = observation_spec().with_total_mode(TotalMode::Accurate);
        assert_ne!(observation_spec().fingerprint(), counted.fingerprint());
        assert_eq!(
            counted.fingerprint(),
            observation_spec().with_total_mode(TotalMode::Accurate).fingerprint()
        );
    }

    #[test]
    fn test_fingerprint_differs_by_partition() {
        let scoped = observation_spec().with_partition(PartitionScope::Partition("p1".into()));
        assert_ne!(observation_spec().fingerprint(), scoped.fingerprint());
    }
}
