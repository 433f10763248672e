//! Wallpaper history store
//!
//! One row per distinct video path, ordered by last activation. Backed by the
//! application SQLite database in WAL mode so a crash mid-write never damages
//! committed rows.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::db;
use crate::error::StoreError;
use crate::volume::Volume;

/// A previously used wallpaper
#[derive(Debug, Clone, PartialEq)]
pub struct WallpaperRecord {
    pub id: i64,
    pub path: PathBuf,
    pub display_name: String,
    pub last_used_at: DateTime<Utc>,
    pub volume: Volume,
}

impl WallpaperRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let path: String = row.get(1)?;
        let last_used_ms: i64 = row.get(3)?;
        let volume: f64 = row.get(4)?;

        Ok(Self {
            id: row.get(0)?,
            path: PathBuf::from(path),
            display_name: row.get(2)?,
            last_used_at: DateTime::from_timestamp_millis(last_used_ms).unwrap_or_default(),
            volume: Volume::new(volume as f32).unwrap_or_default(),
        })
    }
}

/// Last path segment, used as the record's label
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

const SELECT_COLUMNS: &str = "SELECT id, path, display_name, last_used_at, volume FROM wallpapers";

/// The durable wallpaper table
pub struct WallpaperStore {
    conn: Mutex<Connection>,
}

impl WallpaperStore {
    /// Open the store at `path`, creating the schema when missing
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(db::open(path)?),
        };
        store.init_schema()?;
        info!("Wallpaper store ready at {:?}", path);
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(db::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create tables and indexes. Additive only, safe on every startup.
    fn init_schema(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS wallpapers (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                path            TEXT NOT NULL UNIQUE,
                display_name    TEXT NOT NULL,
                last_used_at    INTEGER NOT NULL,
                volume          REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_wallpapers_last_used
                ON wallpapers(last_used_at DESC);",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert or refresh the record for `path`, stamping it as the newest.
    ///
    /// The stamp is `now`, bumped past the newest existing stamp when the
    /// clock has not advanced, so activation order is always preserved.
    pub fn upsert(&self, path: &Path, display_name: &str, volume: Volume) -> Result<(), StoreError> {
        let result = (|| -> Result<(), StoreError> {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let newest: Option<i64> =
                tx.query_row("SELECT MAX(last_used_at) FROM wallpapers", [], |row| row.get(0))?;
            let now = Utc::now().timestamp_millis();
            let stamp = match newest {
                Some(newest) if newest >= now => newest + 1,
                _ => now,
            };

            Self::write(&tx, path, display_name, volume, stamp)?;
            tx.commit()?;
            Ok(())
        })();

        if let Err(e) = &result {
            warn!("Failed to save wallpaper {:?}: {}", path, e);
        }
        result
    }

    /// Insert or refresh the record for `path` with an explicit timestamp
    #[cfg(test)]
    pub fn upsert_at(
        &self,
        path: &Path,
        display_name: &str,
        volume: Volume,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = self
            .lock()
            .and_then(|conn| Ok(Self::write(&conn, path, display_name, volume, at.timestamp_millis())?));

        if let Err(e) = &result {
            warn!("Failed to save wallpaper {:?}: {}", path, e);
        }
        result
    }

    fn write(
        conn: &Connection,
        path: &Path,
        display_name: &str,
        volume: Volume,
        stamp_ms: i64,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO wallpapers (path, display_name, last_used_at, volume)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET
                display_name = excluded.display_name,
                last_used_at = excluded.last_used_at,
                volume = excluded.volume",
            params![
                db::path_key(path)?,
                display_name,
                stamp_ms,
                f64::from(volume.get())
            ],
        )?;
        debug!("Saved wallpaper {:?} (volume {})", path, volume);
        Ok(())
    }

    /// The most recently used wallpaper, if any
    pub fn most_recent(&self) -> Option<WallpaperRecord> {
        self.query_optional(
            &format!("{SELECT_COLUMNS} ORDER BY last_used_at DESC, id DESC LIMIT 1"),
            None,
        )
    }

    /// Look up the record for one path
    pub fn find(&self, path: &Path) -> Option<WallpaperRecord> {
        let key = db::path_key(path).ok()?;
        self.query_optional(&format!("{SELECT_COLUMNS} WHERE path = ?1"), Some(key))
    }

    /// All records, most recently used first
    pub fn all(&self) -> Vec<WallpaperRecord> {
        match self.try_all() {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to read wallpaper history: {}", e);
                Vec::new()
            }
        }
    }

    fn try_all(&self) -> Result<Vec<WallpaperRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} ORDER BY last_used_at DESC, id DESC"
        ))?;

        let records = stmt
            .query_map([], WallpaperRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn query_optional(&self, sql: &str, path: Option<&str>) -> Option<WallpaperRecord> {
        let result = self.lock().and_then(|conn| {
            let record = match path {
                Some(path) => conn
                    .query_row(sql, params![path], WallpaperRecord::from_row)
                    .optional()?,
                None => conn.query_row(sql, [], WallpaperRecord::from_row).optional()?,
            };
            Ok(record)
        });

        match result {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to read wallpaper history: {}", e);
                None
            }
        }
    }
}

impl std::fmt::Debug for WallpaperStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WallpaperStore").finish_non_exhaustive()
    }
}
