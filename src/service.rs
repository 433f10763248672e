//! The wallpaper service
//!
//! Wires the broker, store, surface and static fallback together for the
//! operations clients ask for. Holds no surface state of its own.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::access::PermissionBroker;
use crate::bootstrap::{self, BootstrapOutcome};
use crate::error::ServiceError;
use crate::fallback::StaticFallback;
use crate::store::{self, WallpaperRecord, WallpaperStore};
use crate::surface::{SurfaceHandle, SurfaceStatus};
use crate::volume::Volume;

const EVENT_CAPACITY: usize = 64;

/// Notifications for UIs
#[derive(Debug, Clone, PartialEq)]
pub enum WallpaperEvent {
    SelectionChanged { path: PathBuf, volume: Volume },
    HistoryChanged,
}

pub struct WallpaperService {
    store: Arc<WallpaperStore>,
    broker: Arc<PermissionBroker>,
    surface: SurfaceHandle,
    fallback: Option<Arc<StaticFallback>>,
    events: broadcast::Sender<WallpaperEvent>,
    /// Held across activation and its bookkeeping
    selection: Mutex<()>,
}

impl WallpaperService {
    pub fn new(
        store: Arc<WallpaperStore>,
        broker: Arc<PermissionBroker>,
        surface: SurfaceHandle,
        fallback: Option<Arc<StaticFallback>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            broker,
            surface,
            fallback,
            events,
            selection: Mutex::new(()),
        }
    }

    /// A file the user just picked
    pub async fn select(&self, path: &Path, volume: f32) -> Result<(), ServiceError> {
        if !path.is_absolute() {
            return Err(ServiceError::RelativePath(path.to_path_buf()));
        }
        if path.to_str().is_none() {
            return Err(ServiceError::NonUtf8Path(path.to_path_buf()));
        }
        let volume = parse_volume(volume)?;

        let _selection = self.selection.lock().await;

        // Before anything else opens the file
        match self.broker.grant(path) {
            Some(token) => debug!(
                "Stored {}-byte access token for {:?}",
                token.as_bytes().len(),
                path
            ),
            None => warn!("No durable access to {:?}, it will not survive a restart", path),
        }

        self.surface.activate(path.to_path_buf(), volume).await?;
        self.activated(path, volume);
        Ok(())
    }

    /// Reapply an entry from the history
    pub async fn apply(&self, path: &Path) -> Result<(), ServiceError> {
        let record = self
            .store
            .find(path)
            .ok_or_else(|| ServiceError::NotInHistory(path.to_path_buf()))?;

        let _selection = self.selection.lock().await;
        if !self.broker.try_direct_then_restore(&record.path) {
            return Err(ServiceError::AccessDenied(record.path));
        }

        self.surface
            .activate(record.path.clone(), record.volume)
            .await?;
        self.activated(&record.path, record.volume);
        Ok(())
    }

    /// Change the volume of the running wallpaper and remember it
    pub async fn set_volume(&self, volume: f32) -> Result<(), ServiceError> {
        let volume = parse_volume(volume)?;

        let _selection = self.selection.lock().await;
        let Some(path) = self.surface.set_volume(volume).await? else {
            return Ok(());
        };

        if self
            .store
            .upsert(&path, &store::display_name(&path), volume)
            .is_ok()
        {
            self.emit(WallpaperEvent::HistoryChanged);
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), ServiceError> {
        let _selection = self.selection.lock().await;
        self.surface.clear().await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<SurfaceStatus, ServiceError> {
        Ok(self.surface.status().await?)
    }

    /// Stored wallpapers that can still be played, most recent first
    pub fn history(&self) -> Vec<WallpaperRecord> {
        self.store
            .all()
            .into_iter()
            .filter(|record| {
                let usable = self.broker.try_direct_then_restore(&record.path)
                    && record.path.exists();
                if !usable {
                    debug!("Hiding unreachable history entry {:?}", record.path);
                }
                usable
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WallpaperEvent> {
        self.events.subscribe()
    }

    /// Startup restore of the last wallpaper
    pub async fn restore_last_session(&self) -> BootstrapOutcome {
        let _selection = self.selection.lock().await;
        bootstrap::restore_last_session(
            &self.store,
            &self.broker,
            &self.surface,
            self.fallback.as_ref(),
        )
        .await
    }

    /// Stop the surface controller
    pub async fn shutdown(&self) {
        if let Err(e) = self.surface.shutdown().await {
            debug!("Surface already stopped: {}", e);
        }
    }

    /// Bookkeeping after a successful activation
    fn activated(&self, path: &Path, volume: Volume) {
        let saved = self
            .store
            .upsert(path, &store::display_name(path), volume)
            .is_ok();

        if let Some(fallback) = &self.fallback {
            fallback.publish_in_background(path.to_path_buf());
        }

        info!("Wallpaper selected: {:?}", path);
        self.emit(WallpaperEvent::SelectionChanged {
            path: path.to_path_buf(),
            volume,
        });
        if saved {
            self.emit(WallpaperEvent::HistoryChanged);
        }
    }

    fn emit(&self, event: WallpaperEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn parse_volume(volume: f32) -> Result<Volume, ServiceError> {
    Volume::new(volume).ok_or_else(|| {
        warn!("Ignoring volume {}", volume);
        ServiceError::InvalidVolume
    })
}

impl std::fmt::Debug for WallpaperService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WallpaperService")
            .field("fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}
