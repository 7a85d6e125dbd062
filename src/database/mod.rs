pub mod models;
pub mod repositories;

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{Connection, OpenFlags};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::core::fields::FieldSchema;
use models::ItemId;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database query error: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Item {0} not found")]
    NotFound(ItemId),

    #[error("Unknown field column '{0}'")]
    UnknownColumn(String),
}

const CREATE_ITEMS: &str = "CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    extension TEXT NOT NULL,
    tweak INTEGER NOT NULL DEFAULT 0,
    added_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    fingerprint INTEGER NOT NULL";

/// Current time at the precision stored in the index.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Open (creating if needed) the index at `path` and bring its columns in
/// line with `schema`.
///
/// The default rollback journal is kept so that after every commit the
/// single database file is complete and can be mirrored as-is.
pub fn open_index(path: &Path, schema: &FieldSchema) -> Result<Connection, DatabaseError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    migrate(&conn, schema)?;
    Ok(conn)
}

/// Open an index for reading only, without touching its columns. Used to
/// inspect a pulled index before it replaces the local one.
pub fn open_index_read_only(path: &Path) -> Result<Connection, DatabaseError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

fn migrate(conn: &Connection, schema: &FieldSchema) -> Result<(), DatabaseError> {
    let mut ddl = String::from(CREATE_ITEMS);
    for field in schema.fields() {
        ddl.push_str(&format!(
            ",\n    \"{}\" INTEGER NOT NULL DEFAULT {}",
            field.key,
            field.kind.default_value().to_sql()
        ));
    }
    ddl.push_str("\n)");
    conn.execute(&ddl, [])?;

    // Fields declared after the index was created.
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('items')")?;
    let existing = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .map(|name| name.map(|n| n.to_lowercase()))
        .collect::<Result<HashSet<String>, _>>()?;

    for field in schema.fields() {
        if existing.contains(&field.key.to_lowercase()) {
            continue;
        }
        log::info!("Adding column '{}' to index", field.key);
        conn.execute(
            &format!(
                "ALTER TABLE items ADD COLUMN \"{}\" INTEGER NOT NULL DEFAULT {}",
                field.key,
                field.kind.default_value().to_sql()
            ),
            [],
        )?;
    }

    Ok(())
}
