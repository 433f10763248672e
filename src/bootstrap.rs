//! Reapply the last wallpaper at startup

use std::sync::Arc;
use tracing::{info, warn};

use crate::access::PermissionBroker;
use crate::fallback::StaticFallback;
use crate::store::WallpaperStore;
use crate::surface::SurfaceHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Restored,
    EmptyHistory,
    AccessDenied,
    ActivationFailed,
}

/// Restore the most recently used wallpaper, if it is still reachable.
///
/// Never fails: anything short of a running surface leaves the system idle
/// and is only logged.
pub async fn restore_last_session(
    store: &WallpaperStore,
    broker: &PermissionBroker,
    surface: &SurfaceHandle,
    fallback: Option<&Arc<StaticFallback>>,
) -> BootstrapOutcome {
    let Some(record) = store.most_recent() else {
        info!("No wallpaper history, starting idle");
        return BootstrapOutcome::EmptyHistory;
    };

    if !broker.try_direct_then_restore(&record.path) {
        warn!(
            "Lost access to last wallpaper {:?}, starting idle",
            record.path
        );
        return BootstrapOutcome::AccessDenied;
    }

    if let Err(e) = surface.activate(record.path.clone(), record.volume).await {
        warn!("Failed to restore {:?}: {}", record.path, e);
        return BootstrapOutcome::ActivationFailed;
    }

    if let Some(fallback) = fallback {
        fallback.publish_in_background(record.path.clone());
    }

    info!(
        "Restored wallpaper {} at {}",
        record.display_name, record.volume
    );
    BootstrapOutcome::Restored
}
