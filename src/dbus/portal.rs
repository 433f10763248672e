//! Desktop background via org.freedesktop.portal.Wallpaper

use std::collections::HashMap;
use std::path::Path;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, info};
use zbus::zvariant::Value;
use zbus::{Connection, proxy};

use crate::error::FallbackError;
use crate::fallback::{DesktopBackground, FillMode};

/// Proxy for the XDG wallpaper portal
#[proxy(
    interface = "org.freedesktop.portal.Wallpaper",
    default_service = "org.freedesktop.portal.Desktop",
    default_path = "/org/freedesktop/portal/desktop"
)]
trait Wallpaper {
    /// Ask the desktop to use `uri` as wallpaper; returns the request handle
    #[zbus(name = "SetWallpaperURI")]
    fn set_wallpaper_uri(
        &self,
        parent_window: &str,
        uri: &str,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<zbus::zvariant::OwnedObjectPath>;
}

/// `file://` URI with everything outside the unreserved set percent-encoded
pub fn file_uri(path: &Path) -> String {
    use std::os::unix::ffi::OsStrExt;

    let mut uri = String::from("file://");
    for &byte in path.as_os_str().as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                uri.push(byte as char)
            }
            _ => uri.push_str(&format!("%{byte:02X}")),
        }
    }
    uri
}

/// Portal implementation of [`DesktopBackground`]
///
/// Runs on blocking threads and drives the async proxy through the daemon
/// runtime. The session connection is kept open so pending portal requests
/// are not dropped with it.
pub struct PortalBackground {
    runtime: Handle,
    conn: Mutex<Option<Connection>>,
}

impl PortalBackground {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            conn: Mutex::new(None),
        }
    }

    async fn set_uri(&self, uri: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(super::session().await?);
        }
        let Some(conn) = conn.as_ref() else {
            anyhow::bail!("no session bus connection");
        };

        let proxy = WallpaperProxy::new(conn).await?;
        let options = HashMap::from([
            ("show-preview", Value::from(false)),
            ("set-on", Value::from("background")),
        ]);

        let request = proxy.set_wallpaper_uri("", uri, options).await?;
        debug!("Wallpaper portal request {}", request.as_str());
        Ok(())
    }
}

impl DesktopBackground for PortalBackground {
    fn set_background(&self, image: &Path, _mode: FillMode) -> Result<(), FallbackError> {
        // The portal decides scaling itself
        let uri = file_uri(image);
        self.runtime
            .block_on(self.set_uri(&uri))
            .map_err(|e| FallbackError::Desktop(format!("{e:#}")))?;

        info!("Wallpaper portal asked to show {}", uri);
        Ok(())
    }
}

impl std::fmt::Debug for PortalBackground {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalBackground").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_uri_escapes() {
        assert_eq!(
            file_uri(Path::new("/home/me/.cache/alivepaper/still-1.jpg")),
            "file:///home/me/.cache/alivepaper/still-1.jpg"
        );
        assert_eq!(
            file_uri(Path::new("/tmp/my stills/ü.jpg")),
            "file:///tmp/my%20stills/%C3%BC.jpg"
        );
    }
}
