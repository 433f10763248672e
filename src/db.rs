//! Shared SQLite connection setup
//!
//! The store and the access-token table live in the same database file and
//! each component opens its own connection to it.

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Bound on every lock wait, so a second writer never blocks indefinitely
const BUSY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Text key for a path column; paths that are not UTF-8 cannot be stored
pub fn path_key(path: &Path) -> Result<&str, StoreError> {
    path.to_str()
        .ok_or_else(|| StoreError::NonUtf8Path(path.to_path_buf()))
}

/// Open (creating if needed) the database file with durable settings
pub fn open(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    configure(&conn, true)?;
    debug!("Opened database at {:?}", path);
    Ok(conn)
}

/// Private in-memory database
#[cfg(test)]
pub fn open_in_memory() -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory()?;
    configure(&conn, false)?;
    Ok(conn)
}

fn configure(conn: &Connection, on_disk: bool) -> Result<(), StoreError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;

    if on_disk {
        // journal_mode returns the resulting mode as a row
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!("SQLite refused WAL mode, running with journal_mode={}", mode);
        }
    }

    conn.execute_batch(
        "PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(())
}
