//! Catalog of searchable parameters.
//!
//! The catalog declares, per resource type, which parameters may appear in
//! predicates and sort directives, what type they have and whether they are
//! sortable. Parameter codes are embedded in generated SQL as literals, so
//! every code is validated when it is registered.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, BuildResult};
use crate::types::SearchParamType;

/// Base name matching every resource type.
pub const ANY_RESOURCE: &str = "Resource";

static CODE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-.]{0,63}$").ok());

/// Returns true if `code` is safe to embed as a SQL string literal.
pub fn is_valid_code(code: &str) -> bool {
    CODE_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(code))
}

/// Definition of one searchable parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    /// Parameter code as used in predicates (e.g., "code", "birthdate").
    pub code: String,

    /// The parameter type.
    pub param_type: SearchParamType,

    /// Whether the parameter may be used in a sort directive.
    pub sortable: bool,

    /// Resource types this parameter applies to.
    pub base: Vec<String>,
}

impl ParameterDefinition {
    /// Creates a sortable definition with no base types.
    pub fn new(code: impl Into<String>, param_type: SearchParamType) -> Self {
        Self {
            code: code.into(),
            param_type,
            sortable: param_type != SearchParamType::Composite,
            base: Vec::new(),
        }
    }

    /// Sets the base resource types.
    pub fn with_base<I, S>(mut self, base: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base = base.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the parameter as not sortable.
    pub fn unsortable(mut self) -> Self {
        self.sortable = false;
        self
    }

    /// Returns whether this parameter applies to the given resource type.
    pub fn applies_to(&self, resource_type: &str) -> bool {
        self.base
            .iter()
            .any(|b| b == resource_type || b == ANY_RESOURCE)
    }
}

/// In-memory catalog of parameter definitions, indexed by resource type.
#[derive(Debug, Clone, Default)]
pub struct ParameterCatalog {
    params_by_type: HashMap<String, HashMap<String, Arc<ParameterDefinition>>>,
}

impl ParameterCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog preloaded with the special parameters and a small set
    /// of common clinical parameters.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        for def in default_definitions() {
            // Codes below are static and known to be valid.
            let _ = catalog.register(def);
        }
        catalog
    }

    /// Registers a definition under each of its base types.
    pub fn register(&mut self, def: ParameterDefinition) -> BuildResult<()> {
        if !is_valid_code(&def.code) {
            return Err(BuildError::InvalidParameterCode { code: def.code });
        }

        let def = Arc::new(def);
        for base in &def.base {
            self.params_by_type
                .entry(base.clone())
                .or_default()
                .insert(def.code.clone(), Arc::clone(&def));
        }
        Ok(())
    }

    /// Looks up a parameter for a resource type, falling back to parameters
    /// registered for every resource.
    pub fn get_param(&self, resource_type: &str, code: &str) -> Option<Arc<ParameterDefinition>> {
        self.params_by_type
            .get(resource_type)
            .and_then(|params| params.get(code))
            .or_else(|| {
                self.params_by_type
                    .get(ANY_RESOURCE)
                    .and_then(|params| params.get(code))
            })
            .cloned()
    }

    /// Resource types with type-specific registrations.
    pub fn resource_types(&self) -> Vec<String> {
        self.params_by_type
            .keys()
            .filter(|t| t.as_str() != ANY_RESOURCE)
            .cloned()
            .collect()
    }

    /// Number of distinct registrations.
    pub fn len(&self) -> usize {
        self.params_by_type.values().map(HashMap::len).sum()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn default_definitions() -> Vec<ParameterDefinition> {
    use SearchParamType::*;

    vec![
        ParameterDefinition::new("_id", Token).with_base([ANY_RESOURCE]),
        ParameterDefinition::new("_lastUpdated", Date).with_base([ANY_RESOURCE]),
        ParameterDefinition::new("_profile", Uri)
            .with_base([ANY_RESOURCE])
            .unsortable(),
        // Observation
        ParameterDefinition::new("code", Token).with_base(["Observation", "Condition"]),
        ParameterDefinition::new("category", Token).with_base(["Observation", "Condition"]),
        ParameterDefinition::new("status", Token).with_base(["Observation", "Encounter"]),
        ParameterDefinition::new("date", Date).with_base(["Observation", "Encounter"]),
        ParameterDefinition::new("subject", Reference)
            .with_base(["Observation", "Condition", "Encounter"]),
        ParameterDefinition::new("patient", Reference)
            .with_base(["Observation", "Condition", "Encounter"]),
        ParameterDefinition::new("value-quantity", Quantity).with_base(["Observation"]),
        ParameterDefinition::new("code-value-quantity", Composite).with_base(["Observation"]),
        // Patient
        ParameterDefinition::new("name", String).with_base(["Patient", "Practitioner"]),
        ParameterDefinition::new("family", String).with_base(["Patient", "Practitioner"]),
        ParameterDefinition::new("given", String).with_base(["Patient", "Practitioner"]),
        ParameterDefinition::new("identifier", Token)
            .with_base(["Patient", "Practitioner"])
            .unsortable(),
        ParameterDefinition::new("gender", Token).with_base(["Patient", "Practitioner"]),
        ParameterDefinition::new("birthdate", Date).with_base(["Patient"]),
        ParameterDefinition::new("general-practitioner", Reference).with_base(["Patient"]),
        ParameterDefinition::new("length", Number).with_base(["Encounter"]),
        // Terminology
        ParameterDefinition::new("url", Uri).with_base(["ValueSet", "CodeSystem"]),
    ]
}
