//! Search predicate types.
//!
//! A search specification is a resource type plus predicates over indexed
//! parameters, sort directives and a partition scope. Every parameter is
//! indexed under one type, which fixes the index column its values live in
//! and which modifiers and comparison prefixes make sense for it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a parameter's values are indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParamType {
    /// Free text, matched case-insensitively by prefix.
    String,
    /// A URI, matched exactly or by path prefix.
    Uri,
    /// A decimal number.
    Number,
    /// A date or instant, compared as ISO-8601 text.
    Date,
    /// A number with an optional unit.
    Quantity,
    /// A `system|code` pair.
    Token,
    /// A `Type/id` pointer to another record.
    Reference,
    /// Several indexed values matched together. Registered in the catalog
    /// but never translated to a query.
    Composite,
}

impl SearchParamType {
    const ALL: [SearchParamType; 8] = [
        SearchParamType::String,
        SearchParamType::Uri,
        SearchParamType::Number,
        SearchParamType::Date,
        SearchParamType::Quantity,
        SearchParamType::Token,
        SearchParamType::Reference,
        SearchParamType::Composite,
    ];

    /// Lowercase name used in catalogs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchParamType::String => "string",
            SearchParamType::Uri => "uri",
            SearchParamType::Number => "number",
            SearchParamType::Date => "date",
            SearchParamType::Quantity => "quantity",
            SearchParamType::Token => "token",
            SearchParamType::Reference => "reference",
            SearchParamType::Composite => "composite",
        }
    }

    /// Column of the search index holding values of this type.
    ///
    /// `None` for composite parameters, which have no single column.
    pub fn index_column(&self) -> Option<&'static str> {
        match self {
            SearchParamType::String => Some("value_string"),
            SearchParamType::Token => Some("value_token_code"),
            SearchParamType::Date => Some("value_date"),
            SearchParamType::Number => Some("value_number"),
            SearchParamType::Quantity => Some("value_quantity"),
            SearchParamType::Reference => Some("value_reference"),
            SearchParamType::Uri => Some("value_uri"),
            SearchParamType::Composite => None,
        }
    }

    /// True for types whose values have a natural order.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            SearchParamType::Number | SearchParamType::Date | SearchParamType::Quantity
        )
    }
}

impl fmt::Display for SearchParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchParamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown search parameter type: {}", s))
    }
}

/// Changes how a predicate's values are matched.
///
/// Written after the parameter name, as in `name:contains`. A capitalized
/// modifier names the target type of a reference, as in `subject:Patient`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchModifier {
    /// Case-sensitive whole-value match on strings.
    Exact,
    /// Substring match on strings.
    Contains,
    /// Records with no matching index row.
    Not,
    /// With `true`, records lacking the parameter; with `false`, records having it.
    Missing,
    /// URIs that are a path prefix of the value.
    Above,
    /// URIs that start with the value.
    Below,
    /// References whose target has this resource type.
    Type(String),
}

impl fmt::Display for SearchModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SearchModifier::Exact => "exact",
            SearchModifier::Contains => "contains",
            SearchModifier::Not => "not",
            SearchModifier::Missing => "missing",
            SearchModifier::Above => "above",
            SearchModifier::Below => "below",
            SearchModifier::Type(target) => target.as_str(),
        };
        f.write_str(name)
    }
}

impl SearchModifier {
    /// Parses a modifier, returning `None` for anything the query builder
    /// cannot translate.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "exact" => Some(SearchModifier::Exact),
            "contains" => Some(SearchModifier::Contains),
            "not" => Some(SearchModifier::Not),
            "missing" => Some(SearchModifier::Missing),
            "above" => Some(SearchModifier::Above),
            "below" => Some(SearchModifier::Below),
            _ if s.starts_with(|c: char| c.is_ascii_uppercase()) => {
                Some(SearchModifier::Type(s.to_string()))
            }
            _ => None,
        }
    }

    /// Returns true if this modifier can be applied to `param_type`.
    pub fn is_valid_for(&self, param_type: SearchParamType) -> bool {
        match self {
            SearchModifier::Exact | SearchModifier::Contains => {
                param_type == SearchParamType::String
            }
            SearchModifier::Not => param_type != SearchParamType::Composite,
            SearchModifier::Missing => true,
            SearchModifier::Above | SearchModifier::Below => param_type == SearchParamType::Uri,
            SearchModifier::Type(_) => param_type == SearchParamType::Reference,
        }
    }
}

/// Comparison prefix of a predicate value, as in `date=ge2024-01-01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchPrefix {
    /// Equal (default).
    #[default]
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Less than.
    Lt,
    /// Greater than or equal.
    Ge,
    /// Less than or equal.
    Le,
    /// Starts after; compared like `gt`.
    Sa,
    /// Ends before; compared like `lt`.
    Eb,
    /// Approximately equal. Parsed but never translated.
    Ap,
}

impl SearchPrefix {
    const ALL: [SearchPrefix; 9] = [
        SearchPrefix::Eq,
        SearchPrefix::Ne,
        SearchPrefix::Gt,
        SearchPrefix::Lt,
        SearchPrefix::Ge,
        SearchPrefix::Le,
        SearchPrefix::Sa,
        SearchPrefix::Eb,
        SearchPrefix::Ap,
    ];

    /// The two-letter form.
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchPrefix::Eq => "eq",
            SearchPrefix::Ne => "ne",
            SearchPrefix::Gt => "gt",
            SearchPrefix::Lt => "lt",
            SearchPrefix::Ge => "ge",
            SearchPrefix::Le => "le",
            SearchPrefix::Sa => "sa",
            SearchPrefix::Eb => "eb",
            SearchPrefix::Ap => "ap",
        }
    }

    /// Splits a leading prefix off a value string.
    ///
    /// Prefixes only apply to ordered values, so a prefix is recognized only
    /// when it is lowercase and followed by a digit or a minus sign; "nelson"
    /// stays a plain string.
    pub fn extract(value: &str) -> (Self, &str) {
        if value.len() > 2 && value.is_char_boundary(2) {
            let (prefix, rest) = value.split_at(2);
            let ordered = rest
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit() || c == '-');
            if ordered {
                if let Some(p) = Self::ALL.into_iter().find(|p| p.as_str() == prefix) {
                    return (p, rest);
                }
            }
        }
        (SearchPrefix::Eq, value)
    }

    /// Returns true if this prefix can compare values of `param_type`.
    pub fn is_valid_for(&self, param_type: SearchParamType) -> bool {
        match self {
            SearchPrefix::Eq | SearchPrefix::Ne => true,
            SearchPrefix::Sa | SearchPrefix::Eb => param_type == SearchParamType::Date,
            _ => param_type.is_ordered(),
        }
    }

    /// SQL comparison operator, or `None` when the prefix has no translation.
    pub fn sql_operator(&self) -> Option<&'static str> {
        match self {
            SearchPrefix::Eq => Some("="),
            SearchPrefix::Ne => Some("<>"),
            SearchPrefix::Gt | SearchPrefix::Sa => Some(">"),
            SearchPrefix::Lt | SearchPrefix::Eb => Some("<"),
            SearchPrefix::Ge => Some(">="),
            SearchPrefix::Le => Some("<="),
            SearchPrefix::Ap => None,
        }
    }
}

impl fmt::Display for SearchPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single predicate value with its comparison prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchValue {
    /// The comparison prefix.
    pub prefix: SearchPrefix,

    /// The value to search for.
    pub value: String,
}

impl SearchValue {
    /// Creates a new search value with the given prefix and value.
    pub fn new(prefix: SearchPrefix, value: impl Into<String>) -> Self {
        Self {
            prefix,
            value: value.into(),
        }
    }

    /// Creates a search value with the default (eq) prefix.
    pub fn eq(value: impl Into<String>) -> Self {
        Self::new(SearchPrefix::Eq, value)
    }

    /// Parses a value string, extracting any prefix.
    pub fn parse(s: &str) -> Self {
        let (prefix, value) = SearchPrefix::extract(s);
        Self::new(prefix, value)
    }
}

/// A parameter predicate: field, optional modifier, and OR'ed values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchPredicate {
    /// The parameter name (e.g., "code", "date").
    pub parameter: String,

    /// Modifier, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<SearchModifier>,

    /// The search value(s). Multiple values are ORed.
    pub values: Vec<SearchValue>,
}

impl SearchPredicate {
    /// Creates a predicate with the given values.
    pub fn new(parameter: impl Into<String>, values: Vec<SearchValue>) -> Self {
        Self {
            parameter: parameter.into(),
            modifier: None,
            values,
        }
    }

    /// Creates an equality predicate with a single value.
    pub fn eq(parameter: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(parameter, vec![SearchValue::eq(value)])
    }

    /// Parses `name[:modifier]` and a comma separated value list.
    pub fn parse(key: &str, values: &str) -> Self {
        let (parameter, modifier) = match key.split_once(':') {
            Some((name, modifier)) => (name, SearchModifier::parse(modifier)),
            None => (key, None),
        };
        Self {
            parameter: parameter.to_string(),
            modifier,
            values: values.split(',').map(SearchValue::parse).collect(),
        }
    }

    /// Sets the modifier.
    pub fn with_modifier(mut self, modifier: SearchModifier) -> Self {
        self.modifier = Some(modifier);
        self
    }
}

/// Sort direction for a sort directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SortDirection {
    /// Ascending order.
    #[default]
    Ascending,
    /// Descending order.
    Descending,
}

impl SortDirection {
    /// Returns the SQL keyword for this direction.
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

/// A sort directive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortDirective {
    /// The parameter to sort by.
    pub parameter: String,
    /// The sort direction.
    pub direction: SortDirection,
}

impl SortDirective {
    /// Parses a sort parameter value (e.g., "-date" for descending).
    pub fn parse(s: &str) -> Self {
        if let Some(stripped) = s.strip_prefix('-') {
            Self {
                parameter: stripped.to_string(),
                direction: SortDirection::Descending,
            }
        } else {
            Self {
                parameter: s.to_string(),
                direction: SortDirection::Ascending,
            }
        }
    }

    /// Creates an ascending sort directive.
    pub fn ascending(parameter: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
            direction: SortDirection::Ascending,
        }
    }

    /// Creates a descending sort directive.
    pub fn descending(parameter: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
            direction: SortDirection::Descending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_param_type_parse() {
        assert_eq!(
            "string".parse::<SearchParamType>().unwrap(),
            SearchParamType::String
        );
        assert_eq!(
            "TOKEN".parse::<SearchParamType>().unwrap(),
            SearchParamType::Token
        );
        assert!("special".parse::<SearchParamType>().is_err());
    }

    #[test]
    fn test_search_param_type_columns() {
        assert_eq!(SearchParamType::Token.index_column(), Some("value_token_code"));
        assert_eq!(SearchParamType::Composite.index_column(), None);
        assert!(SearchParamType::Quantity.is_ordered());
        assert!(!SearchParamType::Reference.is_ordered());
        assert_eq!(SearchParamType::Uri.to_string(), "uri");
    }

    #[test]
    fn test_search_modifier_parse() {
        assert_eq!(SearchModifier::parse("exact"), Some(SearchModifier::Exact));
        assert_eq!(
            SearchModifier::parse("Patient"),
            Some(SearchModifier::Type("Patient".to_string()))
        );
        assert_eq!(SearchModifier::parse("iterate"), None);
        assert_eq!(SearchModifier::parse("text"), None);
        assert_eq!(SearchModifier::parse("not-in"), None);
        assert_eq!(SearchModifier::parse("Contains"), Some(SearchModifier::Contains));
    }

    #[test]
    fn test_search_modifier_validity() {
        assert!(SearchModifier::Exact.is_valid_for(SearchParamType::String));
        assert!(!SearchModifier::Exact.is_valid_for(SearchParamType::Token));
        assert!(SearchModifier::Below.is_valid_for(SearchParamType::Uri));
        assert!(!SearchModifier::Below.is_valid_for(SearchParamType::Token));
        assert!(SearchModifier::Missing.is_valid_for(SearchParamType::Date));
        assert!(!SearchModifier::Not.is_valid_for(SearchParamType::Composite));
        assert!(SearchModifier::Type("Patient".into()).is_valid_for(SearchParamType::Reference));
    }

    #[test]
    fn test_search_prefix_extract() {
        assert_eq!(
            SearchPrefix::extract("gt2020-01-01"),
            (SearchPrefix::Gt, "2020-01-01")
        );
        assert_eq!(
            SearchPrefix::extract("2020-01-01"),
            (SearchPrefix::Eq, "2020-01-01")
        );
        assert_eq!(SearchPrefix::extract("é1"), (SearchPrefix::Eq, "é1"));
        assert_eq!(SearchPrefix::extract("nelson"), (SearchPrefix::Eq, "nelson"));
        assert_eq!(SearchPrefix::extract("le-5"), (SearchPrefix::Le, "-5"));
        assert_eq!(SearchPrefix::extract("Gt5"), (SearchPrefix::Eq, "Gt5"));
    }

    #[test]
    fn test_search_prefix_validity() {
        assert!(SearchPrefix::Gt.is_valid_for(SearchParamType::Number));
        assert!(!SearchPrefix::Gt.is_valid_for(SearchParamType::String));
        assert!(SearchPrefix::Sa.is_valid_for(SearchParamType::Date));
        assert!(!SearchPrefix::Sa.is_valid_for(SearchParamType::Number));
        assert_eq!(SearchPrefix::Ap.sql_operator(), None);
        assert_eq!(SearchPrefix::Sa.sql_operator(), Some(">"));
    }

    #[test]
    fn test_predicate_parse() {
        let predicate = SearchPredicate::parse("name:contains", "smi,jon");
        assert_eq!(predicate.parameter, "name");
        assert_eq!(predicate.modifier, Some(SearchModifier::Contains));
        assert_eq!(predicate.values.len(), 2);

        let predicate = SearchPredicate::parse("date", "ge2024-01-01");
        assert_eq!(predicate.values[0].prefix, SearchPrefix::Ge);
        assert_eq!(predicate.values[0].value, "2024-01-01");
    }

    #[test]
    fn test_sort_directive_parse() {
        let asc = SortDirective::parse("date");
        assert_eq!(asc.parameter, "date");
        assert_eq!(asc.direction, SortDirection::Ascending);

        let desc = SortDirective::parse("-date");
        assert_eq!(desc, SortDirective::descending("date"));
        assert_eq!(desc.direction.sql_keyword(), "DESC");
    }
}
