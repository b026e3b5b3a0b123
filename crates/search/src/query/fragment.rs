//! SQL fragments with positional `?` markers and their bound values.
//!
//! Fragments are composed with `?` markers in textual order; the dialect
//! decides at the end whether they stay `?` or become `$1..$n`.

use serde::{Deserialize, Serialize};

/// A bound SQL parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlParam {
    /// Text parameter.
    Text(String),
    /// Integer parameter.
    Integer(i64),
    /// Float parameter.
    Float(f64),
    /// Null parameter.
    Null,
}

impl SqlParam {
    /// Creates a text parameter.
    pub fn text(s: impl Into<String>) -> Self {
        SqlParam::Text(s.into())
    }

    /// Creates an integer parameter, saturating values beyond `i64::MAX`.
    pub fn integer(n: u64) -> Self {
        SqlParam::Integer(i64::try_from(n).unwrap_or(i64::MAX))
    }

    /// Creates a float parameter.
    pub fn float(f: f64) -> Self {
        SqlParam::Float(f)
    }
}

/// A fragment of SQL with bound parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlFragment {
    /// The SQL clause with `?` markers.
    pub sql: String,
    /// Bound parameter values, one per marker.
    pub params: Vec<SqlParam>,
}

impl SqlFragment {
    /// Creates a fragment with no parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Creates a fragment with parameters.
    pub fn with_params(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Returns true if this fragment is empty.
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    /// Combines with another fragment using AND.
    pub fn and(self, other: SqlFragment) -> Self {
        self.combine(other, "AND")
    }

    /// Combines with another fragment using OR.
    pub fn or(self, other: SqlFragment) -> Self {
        self.combine(other, "OR")
    }

    fn combine(mut self, other: SqlFragment, op: &str) -> Self {
        if !self.sql.is_empty() && !other.sql.is_empty() {
            self.sql = format!("({}) {} ({})", self.sql, op, other.sql);
        } else if !other.sql.is_empty() {
            self.sql = other.sql;
        }
        self.params.extend(other.params);
        self
    }

    /// Folds fragments together with OR, returning None for an empty list.
    pub fn any_of(fragments: Vec<SqlFragment>) -> Option<SqlFragment> {
        fragments.into_iter().reduce(SqlFragment::or)
    }

    /// Folds fragments together with AND, returning None for an empty list.
    pub fn all_of(fragments: Vec<SqlFragment>) -> Option<SqlFragment> {
        fragments.into_iter().reduce(SqlFragment::and)
    }

    /// Wraps the fragment in `NOT (...)`.
    pub fn negate(self) -> Self {
        Self {
            sql: format!("NOT ({})", self.sql),
            params: self.params,
        }
    }

    /// Number of `?` markers in the SQL text.
    pub fn marker_count(&self) -> usize {
        self.sql.matches('?').count()
    }
}

/// Rewrites `?` markers as `$1..$n`.
///
/// Identifiers and literals embedded by the builder are validated and never
/// contain `?`, so every marker is a placeholder.
pub fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    for ch in sql.chars() {
        if ch == '?' {
            n += 1;
            out.push('$');
            out.push_str(&n.to_string());
        } else {
            out.push(ch);
        }
    }
    out
}
