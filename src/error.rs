//! Typed errors for the engine components
//!
//! Process-level code (startup, IPC plumbing, CLI) stays on `anyhow`.

use std::path::PathBuf;
use thiserror::Error;

/// Failures of the desktop surface
#[derive(Debug, Error)]
pub enum SurfaceError {
    /// The video cannot be opened or has no decodable video stream
    #[error("cannot play {}: {reason}", .path.display())]
    Decode { path: PathBuf, reason: String },

    /// The display server refused or is unreachable
    #[error("display error: {0}")]
    Display(String),

    /// The embedded player failed outside of decoding
    #[error("player error: {0}")]
    Player(String),

    /// The controller thread is gone
    #[error("surface controller is not running")]
    ControllerGone,
}

/// Failures of the SQLite-backed store and token table
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database lock poisoned")]
    Poisoned,

    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),
}

/// Failures of the external media tools
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed ({status}): {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("no video stream in {}", .0.display())]
    NoVideoStream(PathBuf),

    #[error("no frame at {offset_secs}s")]
    NoFrame { offset_secs: f64 },

    #[error("unexpected probe output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Failures while publishing the static still image
#[derive(Debug, Error)]
pub enum FallbackError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("desktop background rejected: {0}")]
    Desktop(String),
}

/// Failures surfaced to UIs by the service layer
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no access to {}", .0.display())]
    AccessDenied(PathBuf),

    #[error("{} is not in history", .0.display())]
    NotInHistory(PathBuf),

    #[error("path must be absolute: {}", .0.display())]
    RelativePath(PathBuf),

    #[error("volume must be a number")]
    InvalidVolume,

    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),

    #[error(transparent)]
    Surface(#[from] SurfaceError),
}
