//! SQLite schema for the resource and index tables the query builder targets.

use rusqlite::Connection;

use crate::error::{StoreError, StoreResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initializes the database schema. Safe to call more than once.
pub fn initialize_schema(conn: &Connection) -> StoreResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(internal(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    Ok(())
}

fn internal(message: String) -> StoreError {
    StoreError::Internal {
        backend_name: "sqlite".to_string(),
        message,
        source: None,
    }
}

/// Get the current schema version, 0 for a fresh database.
fn get_schema_version(conn: &Connection) -> StoreResult<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> StoreResult<()> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| internal(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])
        .map_err(|e| internal(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_schema_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS resources (
            res_id TEXT NOT NULL PRIMARY KEY,
            res_type TEXT NOT NULL,
            partition_id TEXT,
            last_updated TEXT NOT NULL
        )",
        [],
    )
    .map_err(|e| internal(format!("Failed to create resources table: {}", e)))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS search_index (
            res_id TEXT NOT NULL REFERENCES resources(res_id) ON DELETE CASCADE,
            res_type TEXT NOT NULL,
            param_name TEXT NOT NULL,
            value_string TEXT,
            value_token_system TEXT,
            value_token_code TEXT,
            value_date TEXT,
            value_number REAL,
            value_quantity REAL,
            value_quantity_unit TEXT,
            value_reference TEXT,
            value_uri TEXT
        )",
        [],
    )
    .map_err(|e| internal(format!("Failed to create search_index table: {}", e)))?;

    create_indexes(conn)
}

fn create_indexes(conn: &Connection) -> StoreResult<()> {
    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_resources_type ON resources(res_type, partition_id)",
        "CREATE INDEX IF NOT EXISTS idx_resources_updated ON resources(res_type, last_updated)",
        "CREATE INDEX IF NOT EXISTS idx_search_resource ON search_index(res_id, param_name)",
        "CREATE INDEX IF NOT EXISTS idx_search_string ON search_index(param_name, value_string)",
        "CREATE INDEX IF NOT EXISTS idx_search_token ON search_index(param_name, value_token_system, value_token_code)",
        "CREATE INDEX IF NOT EXISTS idx_search_date ON search_index(param_name, value_date)",
        "CREATE INDEX IF NOT EXISTS idx_search_number ON search_index(param_name, value_number)",
        "CREATE INDEX IF NOT EXISTS idx_search_quantity ON search_index(param_name, value_quantity, value_quantity_unit)",
        "CREATE INDEX IF NOT EXISTS idx_search_reference ON search_index(param_name, value_reference)",
        "CREATE INDEX IF NOT EXISTS idx_search_uri ON search_index(param_name, value_uri)",
    ];

    for sql in indexes {
        conn.execute(sql, [])
            .map_err(|e| internal(format!("Failed to create index: {}", e)))?;
    }

    Ok(())
}
