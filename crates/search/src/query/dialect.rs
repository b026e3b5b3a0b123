//! Backend dialect strategy table.
//!
//! Each [`BackendDialect`] maps to a static [`DialectProfile`] that supplies
//! the placeholder style, the maximum IN-list size and the pagination
//! function. Adding a dialect means adding a row, not a subtype.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::fragment::SqlParam;
use crate::types::ResultWindow;

/// SQL dialects the query builder can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendDialect {
    /// SQLite: `LIMIT ? OFFSET ?`.
    #[default]
    Sqlite,
    /// PostgreSQL: `$n` placeholders, `LIMIT ? OFFSET ?`.
    Postgres,
    /// SQL Server 2012+: `TOP(?)` on the first page, `OFFSET/FETCH` after.
    SqlServer,
    /// Oracle before 12c: `ROW_NUMBER()` wrapper subquery.
    Oracle,
    /// Apache Derby: `OFFSET/FETCH`.
    Derby,
    /// Engines that only understand `TOP`; leading rows are skipped client side.
    TopOnly,
}

impl BackendDialect {
    /// All dialects, in declaration order.
    pub const ALL: [BackendDialect; 6] = [
        BackendDialect::Sqlite,
        BackendDialect::Postgres,
        BackendDialect::SqlServer,
        BackendDialect::Oracle,
        BackendDialect::Derby,
        BackendDialect::TopOnly,
    ];

    /// Returns the strategy row for this dialect.
    pub fn profile(self) -> &'static DialectProfile {
        match self {
            BackendDialect::Sqlite => &SQLITE,
            BackendDialect::Postgres => &POSTGRES,
            BackendDialect::SqlServer => &SQL_SERVER,
            BackendDialect::Oracle => &ORACLE,
            BackendDialect::Derby => &DERBY,
            BackendDialect::TopOnly => &TOP_ONLY,
        }
    }
}

impl fmt::Display for BackendDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendDialect::Sqlite => write!(f, "sqlite"),
            BackendDialect::Postgres => write!(f, "postgres"),
            BackendDialect::SqlServer => write!(f, "sqlserver"),
            BackendDialect::Oracle => write!(f, "oracle"),
            BackendDialect::Derby => write!(f, "derby"),
            BackendDialect::TopOnly => write!(f, "toponly"),
        }
    }
}

impl FromStr for BackendDialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(BackendDialect::Sqlite),
            "postgres" | "postgresql" => Ok(BackendDialect::Postgres),
            "sqlserver" | "mssql" => Ok(BackendDialect::SqlServer),
            "oracle" => Ok(BackendDialect::Oracle),
            "derby" => Ok(BackendDialect::Derby),
            "toponly" | "top-only" => Ok(BackendDialect::TopOnly),
            _ => Err(format!("unknown dialect: {}", s)),
        }
    }
}

/// How bound parameters are written in the final SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// Anonymous `?` markers.
    Question,
    /// Numbered `$1..$n` markers.
    Numbered,
}

/// The pieces of an identifier query the pagination function arranges.
#[derive(Debug, Clone, Copy)]
pub struct SelectParts<'a> {
    /// Selected columns, e.g. `r.res_id`.
    pub columns: &'a str,
    /// Everything from `FROM` through the end of the `WHERE` clause.
    pub from_where: &'a str,
    /// ORDER BY terms without the keyword.
    pub order_by: &'a str,
}

/// A paginated statement plus the window parameters it introduced.
///
/// `leading` params bind before the predicate params (e.g. `TOP(?)`),
/// `trailing` params after them.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginatedSql {
    /// Statement text with `?` markers.
    pub sql: String,
    /// Window params that precede the predicate params.
    pub leading: Vec<SqlParam>,
    /// Window params that follow the predicate params.
    pub trailing: Vec<SqlParam>,
    /// Rows the consumer must discard from the head of the cursor.
    pub skip_rows: u64,
}

/// Wraps a select in the dialect's pagination clause.
pub type PaginateFn = fn(&SelectParts<'_>, ResultWindow) -> PaginatedSql;

/// One row of the dialect strategy table.
#[derive(Debug)]
pub struct DialectProfile {
    /// Dialect this row describes.
    pub dialect: BackendDialect,
    /// Placeholder style.
    pub placeholder: PlaceholderStyle,
    /// Maximum values per IN list before the list is split.
    pub max_in_clause: usize,
    /// Pagination function.
    pub paginate: PaginateFn,
}

static SQLITE: DialectProfile = DialectProfile {
    dialect: BackendDialect::Sqlite,
    placeholder: PlaceholderStyle::Question,
    max_in_clause: 500,
    paginate: limit_offset,
};

static POSTGRES: DialectProfile = DialectProfile {
    dialect: BackendDialect::Postgres,
    placeholder: PlaceholderStyle::Numbered,
    max_in_clause: 1000,
    paginate: limit_offset,
};

static SQL_SERVER: DialectProfile = DialectProfile {
    dialect: BackendDialect::SqlServer,
    placeholder: PlaceholderStyle::Question,
    max_in_clause: 1000,
    paginate: top_then_offset_fetch,
};

static ORACLE: DialectProfile = DialectProfile {
    dialect: BackendDialect::Oracle,
    placeholder: PlaceholderStyle::Question,
    max_in_clause: 1000,
    paginate: row_number_wrapper,
};

static DERBY: DialectProfile = DialectProfile {
    dialect: BackendDialect::Derby,
    placeholder: PlaceholderStyle::Question,
    max_in_clause: 500,
    paginate: offset_fetch,
};

static TOP_ONLY: DialectProfile = DialectProfile {
    dialect: BackendDialect::TopOnly,
    placeholder: PlaceholderStyle::Question,
    max_in_clause: 500,
    paginate: top_with_skip,
};

fn limit_offset(parts: &SelectParts<'_>, window: ResultWindow) -> PaginatedSql {
    PaginatedSql {
        sql: format!(
            "SELECT {} {} ORDER BY {} LIMIT ? OFFSET ?",
            parts.columns, parts.from_where, parts.order_by
        ),
        leading: Vec::new(),
        trailing: vec![
            SqlParam::integer(window.count),
            SqlParam::integer(window.offset),
        ],
        skip_rows: 0,
    }
}

fn offset_fetch(parts: &SelectParts<'_>, window: ResultWindow) -> PaginatedSql {
    PaginatedSql {
        sql: format!(
            "SELECT {} {} ORDER BY {} OFFSET ? ROWS FETCH NEXT ? ROWS ONLY",
            parts.columns, parts.from_where, parts.order_by
        ),
        leading: Vec::new(),
        trailing: vec![
            SqlParam::integer(window.offset),
            SqlParam::integer(window.count),
        ],
        skip_rows: 0,
    }
}

fn top_then_offset_fetch(parts: &SelectParts<'_>, window: ResultWindow) -> PaginatedSql {
    if window.offset > 0 {
        return offset_fetch(parts, window);
    }
    PaginatedSql {
        sql: format!(
            "SELECT TOP(?) {} {} ORDER BY {}",
            parts.columns, parts.from_where, parts.order_by
        ),
        leading: vec![SqlParam::integer(window.count)],
        trailing: Vec::new(),
        skip_rows: 0,
    }
}

fn row_number_wrapper(parts: &SelectParts<'_>, window: ResultWindow) -> PaginatedSql {
    PaginatedSql {
        sql: format!(
            "SELECT res_id FROM (SELECT {}, ROW_NUMBER() OVER (ORDER BY {}) AS row_num__ {}) numbered \
             WHERE row_num__ > ? AND row_num__ <= ? ORDER BY row_num__",
            parts.columns, parts.order_by, parts.from_where
        ),
        leading: Vec::new(),
        trailing: vec![
            SqlParam::integer(window.offset),
            SqlParam::integer(window.end()),
        ],
        skip_rows: 0,
    }
}

fn top_with_skip(parts: &SelectParts<'_>, window: ResultWindow) -> PaginatedSql {
    PaginatedSql {
        sql: format!(
            "SELECT TOP(?) {} {} ORDER BY {}",
            parts.columns, parts.from_where, parts.order_by
        ),
        leading: vec![SqlParam::integer(window.end())],
        trailing: Vec::new(),
        skip_rows: window.offset,
    }
}
