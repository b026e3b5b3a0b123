//! Compiles a [`SearchSpecification`] into dialect specific SQL.
//!
//! Generated statements select record identifiers from the `resources` table.
//! Each predicate becomes a membership test against the `search_index` table:
//!
//! ```sql
//! SELECT r.res_id FROM resources r
//! WHERE r.res_type = ? [AND r.partition_id = ?] AND (<predicates>)
//! ORDER BY <sort terms>, r.res_id ASC <pagination>
//! ```
//!
//! Values and window bounds are always bound parameters. Parameter codes are
//! embedded as literals only after catalog validation.

use std::sync::Arc;

use super::catalog::{ParameterCatalog, ParameterDefinition};
use super::dialect::{BackendDialect, PlaceholderStyle, SelectParts};
use super::fragment::{SqlFragment, SqlParam, number_placeholders};
use crate::error::{BuildError, BuildResult};
use crate::types::{
    PartitionScope, ResultWindow, SearchModifier, SearchParamType, SearchPredicate, SearchPrefix,
    SearchSpecification, SearchValue, SortDirection, SortDirective,
};

const ID_COLUMN: &str = "r.res_id";
const LAST_UPDATED_COLUMN: &str = "r.last_updated";

/// What a generated query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// One identifier per row, in search order.
    Identifiers,
    /// A single `COUNT(*)` row.
    Count,
}

/// A compiled backend query, consumed by exactly one task execution.
#[derive(Debug, Clone)]
pub struct GeneratedQuery {
    /// Statement text in the target dialect's placeholder style.
    pub sql: String,

    /// Bound values, in placeholder order.
    pub params: Vec<SqlParam>,

    /// Number of placeholders in `sql`.
    pub placeholder_count: usize,

    /// Dialect the statement targets.
    pub dialect: BackendDialect,

    /// Whether the statement returns identifiers or a count.
    pub kind: QueryKind,

    /// Window the statement was built for; `None` for count queries.
    pub window: Option<ResultWindow>,

    /// Leading rows the consumer must discard (client side skipping).
    pub skip_rows: u64,

    /// The specification the statement was compiled from.
    pub specification: Arc<SearchSpecification>,
}

/// Translates search specifications into backend queries.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    catalog: Arc<ParameterCatalog>,
}

impl QueryBuilder {
    /// Creates a builder over the given parameter catalog.
    pub fn new(catalog: Arc<ParameterCatalog>) -> Self {
        Self { catalog }
    }

    /// Returns the catalog used to resolve parameters.
    pub fn catalog(&self) -> &ParameterCatalog {
        &self.catalog
    }

    /// Checks that every predicate and sort directive can be compiled.
    pub fn validate(&self, spec: &SearchSpecification) -> BuildResult<()> {
        self.compile_filter(spec, BackendDialect::default())?;
        self.compile_order_by(spec)?;
        Ok(())
    }

    /// Builds the identifier query for one window of the result set.
    pub fn build(
        &self,
        spec: &Arc<SearchSpecification>,
        dialect: BackendDialect,
        window: ResultWindow,
    ) -> BuildResult<GeneratedQuery> {
        if window.count == 0 {
            return Err(BuildError::InvalidSpecification {
                message: "window count must be positive".to_string(),
            });
        }

        let profile = dialect.profile();
        let filter = self.compile_filter(spec, dialect)?;
        let order_by = self.compile_order_by(spec)?;

        let paged = (profile.paginate)(
            &SelectParts {
                columns: ID_COLUMN,
                from_where: &filter.sql,
                order_by: &order_by,
            },
            window,
        );

        let mut params = paged.leading;
        params.extend(filter.params);
        params.extend(paged.trailing);

        Ok(self.finish(
            paged.sql,
            params,
            dialect,
            QueryKind::Identifiers,
            Some(window),
            paged.skip_rows,
            spec,
        ))
    }

    /// Builds the `COUNT(*)` form of the specification, without ordering or
    /// pagination.
    pub fn build_count(
        &self,
        spec: &Arc<SearchSpecification>,
        dialect: BackendDialect,
    ) -> BuildResult<GeneratedQuery> {
        let filter = self.compile_filter(spec, dialect)?;
        let sql = format!("SELECT COUNT(*) {}", filter.sql);
        Ok(self.finish(
            sql,
            filter.params,
            dialect,
            QueryKind::Count,
            None,
            0,
            spec,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        sql: String,
        params: Vec<SqlParam>,
        dialect: BackendDialect,
        kind: QueryKind,
        window: Option<ResultWindow>,
        skip_rows: u64,
        spec: &Arc<SearchSpecification>,
    ) -> GeneratedQuery {
        debug_assert_eq!(sql.matches('?').count(), params.len());
        let sql = match dialect.profile().placeholder {
            PlaceholderStyle::Question => sql,
            PlaceholderStyle::Numbered => number_placeholders(&sql),
        };
        GeneratedQuery {
            sql,
            placeholder_count: params.len(),
            params,
            dialect,
            kind,
            window,
            skip_rows,
            specification: Arc::clone(spec),
        }
    }

    /// Compiles `FROM ... WHERE ...`.
    fn compile_filter(
        &self,
        spec: &SearchSpecification,
        dialect: BackendDialect,
    ) -> BuildResult<SqlFragment> {
        let max_in = dialect.profile().max_in_clause;

        let mut sql = String::from("FROM resources r WHERE r.res_type = ?");
        let mut params = vec![SqlParam::text(spec.resource_type())];

        if let PartitionScope::Partition(id) = spec.partition() {
            sql.push_str(" AND r.partition_id = ?");
            params.push(SqlParam::text(id));
        }

        let mut conditions = Vec::with_capacity(spec.predicates().len());
        for predicate in spec.predicates() {
            conditions.push(self.compile_predicate(spec.resource_type(), predicate, max_in)?);
        }

        if let Some(combined) = SqlFragment::all_of(conditions) {
            sql.push_str(&format!(" AND ({})", combined.sql));
            params.extend(combined.params);
        }

        Ok(SqlFragment::with_params(sql, params))
    }

    /// Compiles ORDER BY terms, always ending with the identifier column.
    fn compile_order_by(&self, spec: &SearchSpecification) -> BuildResult<String> {
        let mut terms = Vec::with_capacity(spec.sort().len() + 1);
        let mut ends_with_id = false;

        for directive in spec.sort() {
            let keyword = directive.direction.sql_keyword();
            let expr = self.sort_expression(spec.resource_type(), directive)?;
            ends_with_id = expr == ID_COLUMN;
            terms.push(format!("{} {}", expr, keyword));
        }

        if !ends_with_id {
            terms.push(format!("{} ASC", ID_COLUMN));
        }

        Ok(terms.join(", "))
    }

    fn sort_expression(&self, resource_type: &str, directive: &SortDirective) -> BuildResult<String> {
        let invalid = |reason: &str| BuildError::InvalidSort {
            parameter: directive.parameter.clone(),
            reason: reason.to_string(),
        };

        match directive.parameter.as_str() {
            "_id" => return Ok(ID_COLUMN.to_string()),
            "_lastUpdated" => return Ok(LAST_UPDATED_COLUMN.to_string()),
            _ => {}
        }

        let def = self
            .catalog
            .get_param(resource_type, &directive.parameter)
            .ok_or_else(|| invalid(&format!("unknown parameter for {}", resource_type)))?;

        if !def.sortable {
            return Err(invalid("parameter is not sortable"));
        }
        let column = def.param_type.index_column().ok_or_else(|| invalid("no sortable column"))?;

        // Multi-valued parameters sort by their lowest value ascending and
        // their highest value descending.
        let aggregate = match directive.direction {
            SortDirection::Ascending => "MIN",
            SortDirection::Descending => "MAX",
        };

        Ok(format!(
            "(SELECT {}(si.{}) FROM search_index si WHERE si.res_id = r.res_id AND si.param_name = '{}')",
            aggregate, column, def.code
        ))
    }

    fn compile_predicate(
        &self,
        resource_type: &str,
        predicate: &SearchPredicate,
        max_in: usize,
    ) -> BuildResult<SqlFragment> {
        let unsupported = |reason: String| BuildError::UnsupportedPredicate {
            parameter: predicate.parameter.clone(),
            reason,
        };

        if predicate.values.is_empty() {
            return Err(BuildError::InvalidSpecification {
                message: format!("predicate '{}' has no values", predicate.parameter),
            });
        }

        match predicate.parameter.as_str() {
            "_id" => return id_condition(predicate, max_in).map_err(unsupported),
            "_lastUpdated" => return last_updated_condition(predicate).map_err(unsupported),
            _ => {}
        }

        let def = self
            .catalog
            .get_param(resource_type, &predicate.parameter)
            .ok_or_else(|| unsupported(format!("unknown parameter for {}", resource_type)))?;

        if let Some(modifier) = &predicate.modifier {
            if !modifier.is_valid_for(def.param_type) {
                return Err(unsupported(format!(
                    "modifier '{}' is not valid for {} parameters",
                    modifier, def.param_type
                )));
            }
        }

        if predicate.modifier == Some(SearchModifier::Missing) {
            return missing_condition(&def, predicate).map_err(unsupported);
        }

        let mut conditions = Vec::with_capacity(predicate.values.len());
        match def.param_type {
            SearchParamType::Token => {
                conditions.extend(token_conditions(&predicate.values, max_in));
            }
            SearchParamType::Uri => {
                for value in &predicate.values {
                    conditions.push(uri_condition(predicate.modifier.as_ref(), value));
                }
            }
            SearchParamType::Composite => {
                return Err(unsupported("composite parameters are not supported".into()));
            }
            _ => {
                for value in &predicate.values {
                    let condition = match def.param_type {
                        SearchParamType::String => {
                            string_condition(predicate.modifier.as_ref(), value)
                        }
                        SearchParamType::Date => {
                            ordered_condition("si.value_date", def.param_type, value, true)
                        }
                        SearchParamType::Number => {
                            ordered_condition("si.value_number", def.param_type, value, false)
                        }
                        SearchParamType::Quantity => quantity_condition(value),
                        SearchParamType::Reference => {
                            reference_condition(predicate.modifier.as_ref(), value)
                        }
                        _ => Err(format!("{} parameters are not supported", def.param_type)),
                    };
                    conditions.push(condition.map_err(&unsupported)?);
                }
            }
        }

        let Some(any) = SqlFragment::any_of(conditions) else {
            return Err(unsupported("no usable values".into()));
        };

        let negated = predicate.modifier == Some(SearchModifier::Not);
        Ok(index_membership(&def.code, any, negated))
    }
}

/// `r.res_id [NOT] IN (SELECT si.res_id FROM search_index si WHERE ...)`.
fn index_membership(code: &str, condition: SqlFragment, negated: bool) -> SqlFragment {
    let op = if negated { "NOT IN" } else { "IN" };
    SqlFragment::with_params(
        format!(
            "{} {} (SELECT si.res_id FROM search_index si WHERE si.param_name = '{}' AND ({}))",
            ID_COLUMN, op, code, condition.sql
        ),
        condition.params,
    )
}

/// `column IN (?, ?, ...)`, split into OR'ed chunks of at most `max_in`.
fn in_list(column: &str, values: Vec<String>, max_in: usize) -> Option<SqlFragment> {
    let chunks = values
        .chunks(max_in.max(1))
        .map(|chunk| {
            let markers = vec!["?"; chunk.len()].join(", ");
            SqlFragment::with_params(
                format!("{} IN ({})", column, markers),
                chunk.iter().map(SqlParam::text).collect(),
            )
        })
        .collect();
    SqlFragment::any_of(chunks)
}

fn require_eq_prefix(value: &SearchValue) -> Result<(), String> {
    if value.prefix == SearchPrefix::Eq {
        Ok(())
    } else {
        Err(format!("prefix '{}' is not supported here", value.prefix))
    }
}

fn id_condition(predicate: &SearchPredicate, max_in: usize) -> Result<SqlFragment, String> {
    let negated = match &predicate.modifier {
        None => false,
        Some(SearchModifier::Not) => true,
        Some(other) => return Err(format!("modifier '{}' is not supported on _id", other)),
    };
    for value in &predicate.values {
        require_eq_prefix(value)?;
    }

    let ids = predicate.values.iter().map(|v| v.value.clone()).collect();
    let fragment = in_list(ID_COLUMN, ids, max_in).ok_or("no usable values")?;
    Ok(if negated { fragment.negate() } else { fragment })
}

fn last_updated_condition(predicate: &SearchPredicate) -> Result<SqlFragment, String> {
    if let Some(modifier) = &predicate.modifier {
        return Err(format!("modifier '{}' is not supported on _lastUpdated", modifier));
    }
    let mut conditions = Vec::with_capacity(predicate.values.len());
    for value in &predicate.values {
        conditions.push(ordered_condition(
            LAST_UPDATED_COLUMN,
            SearchParamType::Date,
            value,
            true,
        )?);
    }
    SqlFragment::any_of(conditions).ok_or_else(|| "no usable values".to_string())
}

fn missing_condition(
    def: &ParameterDefinition,
    predicate: &SearchPredicate,
) -> Result<SqlFragment, String> {
    let missing = match predicate.values.first().map(|v| v.value.as_str()) {
        Some("true") => true,
        Some("false") => false,
        other => return Err(format!(":missing expects true or false, got {:?}", other)),
    };
    let op = if missing { "NOT EXISTS" } else { "EXISTS" };
    Ok(SqlFragment::new(format!(
        "{} (SELECT 1 FROM search_index si WHERE si.res_id = r.res_id AND si.param_name = '{}')",
        op, def.code
    )))
}

/// Escapes LIKE wildcards; pair with `ESCAPE '\'`.
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn string_condition(
    modifier: Option<&SearchModifier>,
    value: &SearchValue,
) -> Result<SqlFragment, String> {
    require_eq_prefix(value)?;
    let escaped = escape_like(&value.value.to_lowercase());
    Ok(match modifier {
        Some(SearchModifier::Exact) => SqlFragment::with_params(
            "si.value_string = ?",
            vec![SqlParam::text(&value.value)],
        ),
        Some(SearchModifier::Contains) => SqlFragment::with_params(
            "LOWER(si.value_string) LIKE ? ESCAPE '\\'",
            vec![SqlParam::text(format!("%{}%", escaped))],
        ),
        None | Some(SearchModifier::Not) => SqlFragment::with_params(
            "LOWER(si.value_string) LIKE ? ESCAPE '\\'",
            vec![SqlParam::text(format!("{}%", escaped))],
        ),
        Some(other) => return Err(format!("modifier '{}' is not supported", other)),
    })
}

fn token_conditions(values: &[SearchValue], max_in: usize) -> Vec<SqlFragment> {
    let mut bare_codes = Vec::new();
    let mut conditions = Vec::new();

    for value in values {
        match value.value.split_once('|') {
            None => bare_codes.push(value.value.clone()),
            Some(("", code)) => conditions.push(SqlFragment::with_params(
                "si.value_token_system IS NULL AND si.value_token_code = ?",
                vec![SqlParam::text(code)],
            )),
            Some((system, "")) => conditions.push(SqlFragment::with_params(
                "si.value_token_system = ?",
                vec![SqlParam::text(system)],
            )),
            Some((system, code)) => conditions.push(SqlFragment::with_params(
                "si.value_token_system = ? AND si.value_token_code = ?",
                vec![SqlParam::text(system), SqlParam::text(code)],
            )),
        }
    }

    let mut all = Vec::with_capacity(conditions.len() + 1);
    if bare_codes.len() == 1 {
        all.push(SqlFragment::with_params(
            "si.value_token_code = ?",
            vec![SqlParam::Text(bare_codes.remove(0))],
        ));
    } else if let Some(list) = in_list("si.value_token_code", bare_codes, max_in) {
        all.push(list);
    }
    all.extend(conditions);
    all
}

fn ordered_condition(
    column: &str,
    param_type: SearchParamType,
    value: &SearchValue,
    textual: bool,
) -> Result<SqlFragment, String> {
    if !value.prefix.is_valid_for(param_type) {
        return Err(format!(
            "prefix '{}' is not valid for {} parameters",
            value.prefix, param_type
        ));
    }

    let param = if textual {
        SqlParam::text(&value.value)
    } else {
        let number: f64 = value
            .value
            .parse()
            .map_err(|_| format!("'{}' is not a number", value.value))?;
        SqlParam::float(number)
    };

    // Partial dates match every instant they cover.
    if textual {
        match value.prefix {
            SearchPrefix::Eq => {
                return Ok(SqlFragment::with_params(
                    format!("{} LIKE ?", column),
                    vec![SqlParam::text(format!("{}%", value.value))],
                ));
            }
            SearchPrefix::Ne => {
                return Ok(SqlFragment::with_params(
                    format!("{} NOT LIKE ?", column),
                    vec![SqlParam::text(format!("{}%", value.value))],
                ));
            }
            _ => {}
        }
    }

    let op = value
        .prefix
        .sql_operator()
        .ok_or_else(|| format!("prefix '{}' is not supported", value.prefix))?;
    Ok(SqlFragment::with_params(
        format!("{} {} ?", column, op),
        vec![param],
    ))
}

/// Quantity values are `number[|system|unit]`; the unit is matched exactly
/// when present.
fn quantity_condition(value: &SearchValue) -> Result<SqlFragment, String> {
    let mut parts = value.value.splitn(3, '|');
    let number = parts.next().unwrap_or_default();
    let unit = parts.last().filter(|u| !u.is_empty());

    let numeric = SearchValue::new(value.prefix, number);
    let condition = ordered_condition(
        "si.value_quantity",
        SearchParamType::Quantity,
        &numeric,
        false,
    )?;

    Ok(match unit {
        Some(unit) => condition.and(SqlFragment::with_params(
            "si.value_quantity_unit = ?",
            vec![SqlParam::text(unit)],
        )),
        None => condition,
    })
}

fn reference_condition(
    modifier: Option<&SearchModifier>,
    value: &SearchValue,
) -> Result<SqlFragment, String> {
    require_eq_prefix(value)?;
    let reference = match modifier {
        None | Some(SearchModifier::Not) => value.value.clone(),
        Some(SearchModifier::Type(target)) => format!("{}/{}", target, value.value),
        Some(other) => return Err(format!("modifier '{}' is not supported", other)),
    };
    Ok(SqlFragment::with_params(
        "si.value_reference = ?",
        vec![SqlParam::Text(reference)],
    ))
}

fn uri_condition(
    modifier: Option<&SearchModifier>,
    value: &SearchValue,
) -> SqlFragment {
    match modifier {
        Some(SearchModifier::Below) => SqlFragment::with_params(
            "si.value_uri LIKE ? ESCAPE '\\'",
            vec![SqlParam::text(format!("{}%", escape_like(&value.value)))],
        ),
        Some(SearchModifier::Above) => {
            // Every stored URI that is a path prefix of the value.
            let ancestors = uri_ancestors(&value.value);
            let markers = vec!["?"; ancestors.len()].join(", ");
            SqlFragment::with_params(
                format!("si.value_uri IN ({})", markers),
                ancestors.into_iter().map(SqlParam::Text).collect(),
            )
        }
        _ => SqlFragment::with_params("si.value_uri = ?", vec![SqlParam::text(&value.value)]),
    }
}

/// `http://a/b/c` yields `http://a/b/c`, `http://a/b`, `http://a`.
fn uri_ancestors(uri: &str) -> Vec<String> {
    let authority_end = uri.find("://").map(|i| i + 3).unwrap_or(0);
    let mut ancestors = vec![uri.to_string()];
    let mut current = uri.trim_end_matches('/');
    while let Some(idx) = current.rfind('/') {
        if idx < authority_end {
            break;
        }
        current = &current[..idx];
        if current.len() <= authority_end {
            break;
        }
        ancestors.push(current.to_string());
    }
    ancestors
}
