//! SQLite resource store.

use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::schema;
use crate::backends::{IndexValue, StoredRecord};
use crate::error::{StoreError, StoreResult};
use crate::query::{BackendDialect, GeneratedQuery, QueryKind, SqlParam};
use crate::store::{RecordCursor, ResourceStore};

const BACKEND_NAME: &str = "sqlite";

/// SQLite-backed [`ResourceStore`] executing the generated SQL.
pub struct SqliteResourceStore {
    pool: Pool<SqliteConnectionManager>,
    config: SqliteStoreConfig,
    is_memory: bool,
}

impl Debug for SqliteResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteResourceStore")
            .field("config", &self.config)
            .field("is_memory", &self.is_memory)
            .field("pool_size", &self.pool.state().connections)
            .finish_non_exhaustive()
    }
}

/// Configuration for the SQLite store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of idle connections.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,

    /// Enable WAL mode for file databases.
    #[serde(default = "default_true")]
    pub enable_wal: bool,

    /// Enable foreign key constraints.
    #[serde(default = "default_true")]
    pub enable_foreign_keys: bool,

    /// Rows buffered between the reading thread and the cursor.
    #[serde(default = "default_cursor_buffer")]
    pub cursor_buffer: usize,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout_ms() -> u64 {
    30000
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_cursor_buffer() -> usize {
    256
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            enable_wal: true,
            enable_foreign_keys: true,
            cursor_buffer: default_cursor_buffer(),
        }
    }
}

impl SqliteResourceStore {
    /// Creates a new in-memory store.
    ///
    /// Every pooled connection attaches to the same private shared-cache
    /// database, which lives as long as the pool keeps a connection open.
    pub fn in_memory() -> StoreResult<Self> {
        let uri = format!("file:helios-search-{}?mode=memory&cache=shared", Uuid::new_v4());
        let config = SqliteStoreConfig {
            min_connections: 1,
            ..SqliteStoreConfig::default()
        };
        let manager = SqliteConnectionManager::file(uri).with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        );
        Self::build(manager, config, true)
    }

    /// Opens or creates a file-based database.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::with_config(path, SqliteStoreConfig::default())
    }

    /// Creates a store with custom configuration.
    pub fn with_config<P: AsRef<Path>>(path: P, config: SqliteStoreConfig) -> StoreResult<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref());
        Self::build(manager, config, false)
    }

    fn build(
        manager: SqliteConnectionManager,
        config: SqliteStoreConfig,
        is_memory: bool,
    ) -> StoreResult<Self> {
        let busy_timeout = Duration::from_millis(u64::from(config.busy_timeout_ms));
        let enable_foreign_keys = config.enable_foreign_keys;
        let manager = manager.with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            if enable_foreign_keys {
                conn.pragma_update(None, "foreign_keys", "ON")?;
            }
            Ok(())
        });

        let mut builder = Pool::builder()
            .max_size(config.max_connections)
            .min_idle(Some(config.min_connections))
            .connection_timeout(Duration::from_millis(config.connection_timeout_ms));
        if is_memory {
            // The shared-cache database disappears with its last connection.
            builder = builder.idle_timeout(None).max_lifetime(None);
        }
        let pool = builder
            .build(manager)
            .map_err(|e| StoreError::ConnectionFailed {
                backend_name: BACKEND_NAME.to_string(),
                message: e.to_string(),
            })?;

        let store = Self {
            pool,
            config,
            is_memory,
        };
        store.configure_database()?;
        Ok(store)
    }

    /// Initializes the database schema.
    pub fn init_schema(&self) -> StoreResult<()> {
        let conn = self.get_connection()?;
        schema::initialize_schema(&conn)
    }

    /// Returns whether this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &SqliteStoreConfig {
        &self.config
    }

    fn get_connection(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| StoreError::ConnectionFailed {
            backend_name: BACKEND_NAME.to_string(),
            message: e.to_string(),
        })
    }

    /// Database-wide settings; per-connection ones are applied on checkout.
    fn configure_database(&self) -> StoreResult<()> {
        if self.config.enable_wal && !self.is_memory {
            let conn = self.get_connection()?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| StoreError::Internal {
                backend_name: BACKEND_NAME.to_string(),
                message: format!("Failed to enable WAL mode: {}", e),
                source: None,
            })?;
        }
        Ok(())
    }

    /// Inserts or replaces records together with their index rows.
    ///
    /// Returns the number of records written.
    pub fn insert_records(&self, records: &[StoredRecord]) -> StoreResult<usize> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        for record in records {
            write_record(&tx, record)?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Removes a record and its index rows. Returns whether it existed.
    pub fn delete_record(&self, id: &str) -> StoreResult<bool> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM search_index WHERE res_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM resources WHERE res_id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn check_dialect(&self, query: &GeneratedQuery) -> StoreResult<()> {
        if query.dialect != BackendDialect::Sqlite {
            return Err(StoreError::QueryFailed {
                message: format!("sqlite cannot execute a {} query", query.dialect),
            });
        }
        Ok(())
    }
}

fn write_record(conn: &Connection, record: &StoredRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO resources (res_id, res_type, partition_id, last_updated)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(res_id) DO UPDATE SET
            res_type = excluded.res_type,
            partition_id = excluded.partition_id,
            last_updated = excluded.last_updated",
        params![
            record.id,
            record.resource_type,
            record.partition,
            record.last_updated
        ],
    )?;
    conn.execute(
        "DELETE FROM search_index WHERE res_id = ?1",
        params![record.id],
    )?;

    let mut insert = conn.prepare_cached(
        "INSERT INTO search_index (
            res_id, res_type, param_name,
            value_string, value_token_system, value_token_code, value_date,
            value_number, value_quantity, value_quantity_unit,
            value_reference, value_uri
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    for (param, value) in &record.index {
        let columns = IndexColumns::from(value);
        insert.execute(params![
            record.id,
            record.resource_type,
            param,
            columns.string,
            columns.token_system,
            columns.token_code,
            columns.date,
            columns.number,
            columns.quantity,
            columns.quantity_unit,
            columns.reference,
            columns.uri,
        ])?;
    }
    Ok(())
}

/// Column values of one `search_index` row.
#[derive(Default)]
struct IndexColumns<'a> {
    string: Option<&'a str>,
    token_system: Option<&'a str>,
    token_code: Option<&'a str>,
    date: Option<&'a str>,
    number: Option<f64>,
    quantity: Option<f64>,
    quantity_unit: Option<&'a str>,
    reference: Option<&'a str>,
    uri: Option<&'a str>,
}

impl<'a> From<&'a IndexValue> for IndexColumns<'a> {
    fn from(value: &'a IndexValue) -> Self {
        match value {
            IndexValue::String(s) => Self {
                string: Some(s),
                ..Self::default()
            },
            IndexValue::Token { system, code } => Self {
                token_system: system.as_deref(),
                token_code: Some(code),
                ..Self::default()
            },
            IndexValue::Date(d) => Self {
                date: Some(d),
                ..Self::default()
            },
            IndexValue::Number(n) => Self {
                number: Some(*n),
                ..Self::default()
            },
            IndexValue::Quantity { value, unit } => Self {
                quantity: Some(*value),
                quantity_unit: unit.as_deref(),
                ..Self::default()
            },
            IndexValue::Reference(r) => Self {
                reference: Some(r),
                ..Self::default()
            },
            IndexValue::Uri(u) => Self {
                uri: Some(u),
                ..Self::default()
            },
        }
    }
}

fn to_values(params: Vec<SqlParam>) -> Vec<Value> {
    params
        .into_iter()
        .map(|param| match param {
            SqlParam::Text(s) => Value::Text(s),
            SqlParam::Integer(i) => Value::Integer(i),
            SqlParam::Float(f) => Value::Real(f),
            SqlParam::Null => Value::Null,
        })
        .collect()
}

/// Reads rows on a blocking thread and forwards identifiers to the cursor.
///
/// Stops quietly once the cursor is dropped.
fn stream_rows(
    conn: &Connection,
    sql: &str,
    values: &[Value],
    tx: &mpsc::Sender<StoreResult<String>>,
) -> StoreResult<()> {
    let mut stmt = conn.prepare(sql).map_err(|e| StoreError::QueryFailed {
        message: e.to_string(),
    })?;
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    while let Some(row) = rows.next()? {
        let id: String = row.get(0)?;
        if tx.blocking_send(Ok(id)).is_err() {
            tracing::debug!("sqlite cursor dropped before exhaustion");
            return Ok(());
        }
    }
    Ok(())
}

/// Cursor fed by a blocking reader thread through a bounded channel.
struct SqliteCursor {
    rx: mpsc::Receiver<StoreResult<String>>,
}

#[async_trait]
impl RecordCursor for SqliteCursor {
    async fn next_batch(&mut self, max: usize) -> StoreResult<Vec<String>> {
        let mut batch = Vec::with_capacity(max.min(1024));
        while batch.len() < max {
            match self.rx.recv().await {
                Some(Ok(id)) => batch.push(id),
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl ResourceStore for SqliteResourceStore {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn dialect(&self) -> BackendDialect {
        BackendDialect::Sqlite
    }

    async fn execute_query(&self, query: GeneratedQuery) -> StoreResult<Box<dyn RecordCursor>> {
        self.check_dialect(&query)?;
        if query.kind != QueryKind::Identifiers {
            return Err(StoreError::QueryFailed {
                message: "expected an identifier query".to_string(),
            });
        }

        let conn = self.get_connection()?;
        let (tx, rx) = mpsc::channel(self.config.cursor_buffer.max(1));
        let sql = query.sql;
        let values = to_values(query.params);

        tokio::task::spawn_blocking(move || {
            if let Err(e) = stream_rows(&conn, &sql, &values, &tx) {
                // The cursor may already be gone; nothing else to report to.
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(Box::new(SqliteCursor { rx }))
    }

    async fn count(&self, query: GeneratedQuery) -> StoreResult<u64> {
        self.check_dialect(&query)?;
        let conn = self.get_connection()?;
        let sql = query.sql;
        let values = to_values(query.params);

        let count = tokio::task::spawn_blocking(move || -> StoreResult<i64> {
            let mut stmt = conn.prepare(&sql).map_err(|e| StoreError::QueryFailed {
                message: e.to_string(),
            })?;
            Ok(stmt.query_row(params_from_iter(values.iter()), |row| row.get(0))?)
        })
        .await
        .map_err(|e| StoreError::Internal {
            backend_name: BACKEND_NAME.to_string(),
            message: format!("count task failed: {}", e),
            source: Some(Box::new(e)),
        })??;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}
