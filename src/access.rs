//! Durable file access
//!
//! When the user picks a video, a token describing the file identity is
//! minted and stored keyed by path. On later runs the token is checked against
//! the filesystem before the path is trusted again.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::db;
use crate::error::StoreError;

/// Opaque, durable credential for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken(Vec<u8>);

impl AccessToken {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// What a token records about the granted file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FileIdentity {
    path: PathBuf,
    device: u64,
    inode: u64,
    len: u64,
    granted_at_ms: i64,
}

impl FileIdentity {
    fn capture(path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }
        // Proves read permission, not just existence
        File::open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            device: meta.dev(),
            inode: meta.ino(),
            len: meta.len(),
            granted_at_ms: Utc::now().timestamp_millis(),
        })
    }

    /// Whether the path still names the same readable file
    fn still_valid(&self, path: &Path) -> bool {
        if self.path != path {
            return false;
        }
        match fs::metadata(path) {
            Ok(meta) => {
                meta.is_file()
                    && meta.dev() == self.device
                    && meta.ino() == self.inode
                    && File::open(path).is_ok()
            }
            Err(_) => false,
        }
    }
}

/// Mints, persists and redeems access tokens
pub struct PermissionBroker {
    conn: Mutex<Connection>,
    /// Paths with live access in this process
    live: Mutex<HashSet<PathBuf>>,
}

impl PermissionBroker {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::with_connection(db::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(db::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS access_tokens (
                path        TEXT PRIMARY KEY,
                token       BLOB NOT NULL,
                updated_at  INTEGER NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            live: Mutex::new(HashSet::new()),
        })
    }

    /// Record durable access to a path the user just selected.
    ///
    /// Returns `None` when no token could be minted or stored; the path may
    /// still be live for this session if it was readable.
    pub fn grant(&self, path: &Path) -> Option<AccessToken> {
        let identity = match FileIdentity::capture(path) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Cannot grant access to {:?}: {}", path, e);
                return None;
            }
        };
        self.mark_live(path);

        let bytes = match serde_json::to_vec(&identity) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode access token for {:?}: {}", path, e);
                return None;
            }
        };

        if let Err(e) = self.save_token(path, &bytes) {
            warn!("Failed to persist access token for {:?}: {}", path, e);
            return None;
        }

        debug!("Granted access to {:?}", path);
        Some(AccessToken(bytes))
    }

    /// Regain access from a stored token
    pub fn restore(&self, path: &Path) -> bool {
        let bytes = match self.load_token(path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("No access token for {:?}", path);
                return false;
            }
            Err(e) => {
                warn!("Failed to read access token for {:?}: {}", path, e);
                return false;
            }
        };

        let identity: FileIdentity = match serde_json::from_slice(&bytes) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Unreadable access token for {:?}: {}", path, e);
                return false;
            }
        };

        if !identity.still_valid(path) {
            info!("Access token for {:?} is stale", path);
            return false;
        }

        self.mark_live(path);
        debug!("Restored access to {:?}", path);
        true
    }

    /// Live access first, stored token second
    pub fn try_direct_then_restore(&self, path: &Path) -> bool {
        if self.has_direct_access(path) {
            return true;
        }
        self.restore(path)
    }

    fn has_direct_access(&self, path: &Path) -> bool {
        let live = match self.live.lock() {
            Ok(live) => live.contains(path),
            Err(_) => false,
        };
        live && File::open(path).is_ok()
    }

    fn mark_live(&self, path: &Path) {
        if let Ok(mut live) = self.live.lock() {
            live.insert(path.to_path_buf());
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn save_token(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO access_tokens (path, token, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(path) DO UPDATE SET
                token = excluded.token,
                updated_at = excluded.updated_at",
            params![db::path_key(path)?, bytes, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn load_token(&self, path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        let token = self
            .lock()?
            .query_row(
                "SELECT token FROM access_tokens WHERE path = ?1",
                params![db::path_key(path)?],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token)
    }
}

impl std::fmt::Debug for PermissionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionBroker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"not really a video").unwrap();
        path
    }

    #[test]
    fn test_grant_gives_direct_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = video(dir.path(), "beach.mp4");
        let broker = PermissionBroker::open_in_memory().unwrap();

        assert!(broker.grant(&path).is_some());
        assert!(broker.try_direct_then_restore(&path));
    }

    #[test]
    fn test_restore_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("wallpapers.sqlite");
        let path = video(dir.path(), "beach.mp4");

        {
            let broker = PermissionBroker::open(&db_path).unwrap();
            broker.grant(&path).unwrap();
        }

        let broker = PermissionBroker::open(&db_path).unwrap();
        assert!(!broker.has_direct_access(&path));
        assert!(broker.try_direct_then_restore(&path));
        // Restored access is live from now on
        assert!(broker.has_direct_access(&path));
    }

    #[test]
    fn test_missing_token_denies() {
        let dir = tempfile::tempdir().unwrap();
        let path = video(dir.path(), "beach.mp4");
        let broker = PermissionBroker::open_in_memory().unwrap();

        assert!(!broker.restore(&path));
        assert!(!broker.try_direct_then_restore(&path));
    }

    #[test]
    fn test_replaced_file_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("wallpapers.sqlite");
        let path = video(dir.path(), "beach.mp4");

        PermissionBroker::open(&db_path).unwrap().grant(&path).unwrap();

        // Move the granted file away and put a different file in its place
        fs::rename(&path, dir.path().join("moved.mp4")).unwrap();
        fs::write(&path, b"someone else's file").unwrap();

        let broker = PermissionBroker::open(&db_path).unwrap();
        assert!(!broker.restore(&path));
    }

    #[test]
    fn test_deleted_file_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = video(dir.path(), "beach.mp4");
        let broker = PermissionBroker::open_in_memory().unwrap();

        broker.grant(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert!(!broker.try_direct_then_restore(&path));
    }

    #[test]
    fn test_grant_of_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let broker = PermissionBroker::open_in_memory().unwrap();

        assert!(broker.grant(&dir.path().join("nope.mp4")).is_none());
        assert!(broker.grant(dir.path()).is_none());
    }

    #[test]
    fn test_corrupt_token_denies() {
        let dir = tempfile::tempdir().unwrap();
        let path = video(dir.path(), "beach.mp4");
        let broker = PermissionBroker::open_in_memory().unwrap();

        broker.save_token(&path, b"\x00garbage").unwrap();
        assert!(!broker.restore(&path));
    }

    #[test]
    fn test_regrant_overwrites_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = video(dir.path(), "beach.mp4");
        let broker = PermissionBroker::open_in_memory().unwrap();

        broker.save_token(&path, b"\x00garbage").unwrap();
        let token = broker.grant(&path).unwrap();

        assert_eq!(broker.load_token(&path).unwrap().as_deref(), Some(token.as_bytes()));
        assert!(broker.restore(&path));
    }
}
