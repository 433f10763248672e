//! Configuration system for alivepaper
//!
//! Loads configuration from TOML file at `~/.config/alivepaper/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::fallback::FillMode;

const APP_DIR: &str = "alivepaper";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub surface: SurfaceConfig,
    pub media: MediaConfig,
    pub fallback: FallbackConfig,
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .context("Failed to read config file")?;

        let config = Self::from_toml_str(&content)?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse a config document; missing sections and fields take defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join(APP_DIR);

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let default_config = Self::default();
        let toml_string = toml::to_string_pretty(&default_config)
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string)
            .context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    /// Database file, honoring the `[storage] database` override
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.storage.database {
            return Ok(path.clone());
        }

        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join(APP_DIR);

        Ok(data_dir.join("wallpapers.sqlite"))
    }

    /// Directory for generated still images
    pub fn cache_dir(&self) -> Result<PathBuf> {
        Ok(dirs::cache_dir()
            .context("Failed to get cache directory")?
            .join(APP_DIR))
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Override for the SQLite database location
    pub database: Option<PathBuf>,
}

/// Video surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    /// Player executable embedded into the desktop window
    pub player: String,
    /// Extra arguments appended to the player command line
    pub extra_args: Vec<String>,
    /// Hardware decoding mode passed to the player ("auto", "no", ...)
    pub hwdec: String,
    /// How long the player may take to open its control socket
    pub startup_timeout_ms: u64,
    /// Grace period for the player to quit before it is signalled
    pub stop_timeout_ms: u64,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            player: "mpv".to_string(),
            extra_args: Vec::new(),
            hwdec: "auto".to_string(),
            startup_timeout_ms: 5000,
            stop_timeout_ms: 1500,
        }
    }
}

/// Media tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }
}

/// Where the static still image is published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackBackend {
    /// X11 root window pixmap (`_XROOTPMAP_ID`)
    RootWindow,
    /// org.freedesktop.portal.Wallpaper
    Portal,
}

/// Static wallpaper fallback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub backend: FallbackBackend,
    /// Scaling of the still on the root window ("fill" or "fit")
    pub fill: FillMode,
    /// Offset of the still frame, skips fade-ins
    pub frame_offset_secs: f64,
    /// JPEG quality 1-100
    pub jpeg_quality: u8,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: FallbackBackend::RootWindow,
            fill: FillMode::Fill,
            frame_offset_secs: 1.0,
            jpeg_quality: 90,
        }
    }
}

/// Startup behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reapply the most recent wallpaper at launch
    pub restore_on_start: bool,
    /// Volume used by `select` when the client does not pass one
    pub default_volume: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            restore_on_start: true,
            default_volume: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roundtrip() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed = Config::from_toml_str(&text).unwrap();

        assert_eq!(parsed.surface.player, "mpv");
        assert_eq!(parsed.fallback.backend, FallbackBackend::RootWindow);
        assert!(parsed.session.restore_on_start);
        assert!(parsed.storage.database.is_none());
    }

    #[test]
    fn test_partial_config_takes_defaults() {
        let parsed = Config::from_toml_str(
            r#"
            [fallback]
            backend = "portal"
            fill = "fit"
            frame_offset_secs = 2.5

            [storage]
            database = "/tmp/wp.sqlite"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.fallback.backend, FallbackBackend::Portal);
        assert_eq!(parsed.fallback.fill, FillMode::Fit);
        assert_eq!(parsed.fallback.frame_offset_secs, 2.5);
        assert!(parsed.fallback.enabled);
        assert_eq!(parsed.media.ffprobe, "ffprobe");
        assert_eq!(
            parsed.database_path().unwrap(),
            PathBuf::from("/tmp/wp.sqlite")
        );
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(Config::from_toml_str("[fallback]\nbackend = \"gnome\"\n").is_err());
    }
}
