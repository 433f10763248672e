//! Static still-image wallpaper
//!
//! Mirrors the live wallpaper as a plain desktop background, so the desktop
//! still shows something sensible when the surface is gone (logout screens,
//! other sessions, a crashed player).

pub mod root;

use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FallbackConfig;
use crate::error::FallbackError;
use crate::media::FrameExtractor;

const ARTIFACT_PREFIX: &str = "still-";
const ARTIFACT_EXT: &str = "jpg";

/// How the image is fitted to the display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FillMode {
    /// Cover the display, cropping the overflow
    #[default]
    Fill,
    /// Show the whole image, letterboxed on black
    Fit,
}

/// Something that can set the desktop background picture
pub trait DesktopBackground: Send + Sync {
    fn set_background(&self, image: &Path, mode: FillMode) -> Result<(), FallbackError>;
}

/// Publishes a still frame of the current video as desktop background
pub struct StaticFallback {
    extractor: Arc<dyn FrameExtractor>,
    desktop: Arc<dyn DesktopBackground>,
    cache_dir: PathBuf,
    offset_secs: f64,
    jpeg_quality: u8,
    fill: FillMode,
    /// Artifact currently applied; the lock also serializes publishes
    current: Mutex<Option<PathBuf>>,
    /// Ticket of the newest background publish request
    latest: AtomicU64,
}

impl StaticFallback {
    pub fn new(
        config: &FallbackConfig,
        cache_dir: PathBuf,
        extractor: Arc<dyn FrameExtractor>,
        desktop: Arc<dyn DesktopBackground>,
    ) -> Self {
        Self {
            extractor,
            desktop,
            cache_dir,
            offset_secs: config.frame_offset_secs.max(0.0),
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
            fill: config.fill,
            current: Mutex::new(None),
            latest: AtomicU64::new(0),
        }
    }

    /// Extract, encode and apply a still of `video`. Returns the artifact path.
    #[cfg(test)]
    pub fn publish(&self, video: &Path) -> Result<PathBuf, FallbackError> {
        let mut current = self.lock_current();
        self.publish_locked(&mut current, video)
    }

    /// Extract, encode and apply a still of `video` on the blocking pool;
    /// failures are only logged.
    ///
    /// Requests are applied in call order: a request that only gets to run
    /// after a newer one was made is skipped.
    pub fn publish_in_background(self: &Arc<Self>, video: PathBuf) -> JoinHandle<()> {
        let ticket = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        let fallback = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let mut current = fallback.lock_current();
            if fallback.latest.load(Ordering::SeqCst) != ticket {
                debug!("Skipping superseded still for {:?}", video);
                return;
            }
            if let Err(e) = fallback.publish_locked(&mut current, &video) {
                warn!("Static wallpaper not updated for {:?}: {}", video, e);
            }
        })
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<PathBuf>> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish_locked(
        &self,
        current: &mut Option<PathBuf>,
        video: &Path,
    ) -> Result<PathBuf, FallbackError> {
        let frame = self.extractor.extract_frame(video, self.offset_secs)?;
        fs::create_dir_all(&self.cache_dir)?;

        let artifact = self.next_artifact_path();
        if let Err(e) = self.write_jpeg(&frame.to_rgb8(), &artifact) {
            let _ = fs::remove_file(&artifact);
            return Err(e);
        }

        if let Err(e) = self.desktop.set_background(&artifact, self.fill) {
            let _ = fs::remove_file(&artifact);
            return Err(e);
        }

        info!("Static wallpaper set from {:?}", video);
        self.remove_stale_artifacts(&artifact);
        *current = Some(artifact.clone());
        Ok(artifact)
    }

    /// Artifact currently applied, if any
    #[cfg(test)]
    pub fn current(&self) -> Option<PathBuf> {
        self.lock_current().clone()
    }

    fn next_artifact_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%.3f").to_string();
        let mut path = self
            .cache_dir
            .join(format!("{ARTIFACT_PREFIX}{stamp}.{ARTIFACT_EXT}"));

        // Two publishes inside one millisecond
        let mut n = 1;
        while path.exists() {
            path = self
                .cache_dir
                .join(format!("{ARTIFACT_PREFIX}{stamp}-{n}.{ARTIFACT_EXT}"));
            n += 1;
        }
        path
    }

    fn write_jpeg(&self, frame: &image::RgbImage, path: &Path) -> Result<(), FallbackError> {
        let mut writer = BufWriter::new(File::create(path)?);
        JpegEncoder::new_with_quality(&mut writer, self.jpeg_quality).encode_image(frame)?;
        writer.flush()?;
        debug!("Wrote {}x{} still to {:?}", frame.width(), frame.height(), path);
        Ok(())
    }

    /// Delete every generated still except `keep`, including ones left by
    /// earlier runs
    fn remove_stale_artifacts(&self, keep: &Path) {
        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot scan {:?} for old stills: {}", self.cache_dir, e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path == keep || !is_artifact(&path) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed old still {:?}", path),
                Err(e) => warn!("Failed to remove old still {:?}: {}", path, e),
            }
        }
    }
}

fn is_artifact(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.starts_with(ARTIFACT_PREFIX) && name.ends_with(&format!(".{ARTIFACT_EXT}"))
}

impl std::fmt::Debug for StaticFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticFallback")
            .field("cache_dir", &self.cache_dir)
            .field("offset_secs", &self.offset_secs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::error::MediaError;
    use image::{DynamicImage, Rgb, RgbImage};

    /// Solid-colour frames; fails for videos whose name contains "broken"
    #[derive(Debug, Default)]
    pub struct FakeExtractor {
        pub offsets: Mutex<Vec<f64>>,
        pub videos: Mutex<Vec<PathBuf>>,
    }

    impl FrameExtractor for FakeExtractor {
        fn extract_frame(&self, path: &Path, offset_secs: f64) -> Result<DynamicImage, MediaError> {
            self.offsets.lock().unwrap().push(offset_secs);
            self.videos.lock().unwrap().push(path.to_path_buf());
            if path.to_string_lossy().contains("broken") {
                return Err(MediaError::NoFrame { offset_secs });
            }
            Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
                32,
                18,
                Rgb([20, 120, 200]),
            )))
        }
    }

    #[derive(Debug, Default)]
    pub struct FakeDesktop {
        pub applied: Mutex<Vec<PathBuf>>,
        pub reject: bool,
    }

    impl DesktopBackground for FakeDesktop {
        fn set_background(&self, image: &Path, _mode: FillMode) -> Result<(), FallbackError> {
            if self.reject {
                return Err(FallbackError::Desktop("no desktop".to_string()));
            }
            assert!(image.exists());
            self.applied.lock().unwrap().push(image.to_path_buf());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeDesktop, FakeExtractor};
    use super::*;

    fn artifacts(dir: &Path) -> Vec<PathBuf> {
        let mut found: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| is_artifact(p))
            .collect();
        found.sort();
        found
    }

    fn fallback(dir: &Path, desktop: Arc<FakeDesktop>) -> (StaticFallback, Arc<FakeExtractor>) {
        let extractor = Arc::new(FakeExtractor::default());
        let fallback = StaticFallback::new(
            &FallbackConfig::default(),
            dir.to_path_buf(),
            extractor.clone(),
            desktop,
        );
        (fallback, extractor)
    }

    #[test]
    fn test_publish_writes_jpeg_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let desktop = Arc::new(FakeDesktop::default());
        let (fallback, extractor) = fallback(dir.path(), desktop.clone());

        let artifact = fallback.publish(Path::new("/v/beach.mp4")).unwrap();

        assert_eq!(*extractor.offsets.lock().unwrap(), vec![1.0]);
        assert_eq!(*desktop.applied.lock().unwrap(), vec![artifact.clone()]);
        let still = image::open(&artifact).unwrap();
        assert_eq!((still.width(), still.height()), (32, 18));
        assert_eq!(fallback.current(), Some(artifact));
    }

    #[test]
    fn test_previous_artifact_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let (fallback, _) = fallback(dir.path(), Arc::new(FakeDesktop::default()));

        let first = fallback.publish(Path::new("/v/a.mp4")).unwrap();
        let second = fallback.publish(Path::new("/v/b.mp4")).unwrap();

        assert_ne!(first, second);
        assert_eq!(artifacts(dir.path()), vec![second]);
    }

    #[test]
    fn test_leftover_from_earlier_run_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let leftover = dir.path().join("still-20240101-000000.000.jpg");
        fs::write(&leftover, b"old").unwrap();
        let unrelated = dir.path().join("thumbnail.jpg");
        fs::write(&unrelated, b"keep me").unwrap();

        let (fallback, _) = fallback(dir.path(), Arc::new(FakeDesktop::default()));
        let artifact = fallback.publish(Path::new("/v/a.mp4")).unwrap();

        assert_eq!(artifacts(dir.path()), vec![artifact]);
        assert!(unrelated.exists());
    }

    #[test]
    fn test_rejected_background_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let (good, _) = fallback(dir.path(), Arc::new(FakeDesktop::default()));
        let first = good.publish(Path::new("/v/a.mp4")).unwrap();

        let rejecting = Arc::new(FakeDesktop {
            reject: true,
            ..Default::default()
        });
        let (bad, _) = fallback(dir.path(), rejecting);
        assert!(bad.publish(Path::new("/v/b.mp4")).is_err());

        assert_eq!(artifacts(dir.path()), vec![first]);
        assert_eq!(bad.current(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_superseded_background_publish_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let desktop = Arc::new(FakeDesktop::default());
        let (fallback, extractor) = fallback(dir.path(), desktop.clone());
        let fallback = Arc::new(fallback);

        // Both requests queue up behind an in-flight publish
        let busy = fallback.lock_current();
        let older = fallback.publish_in_background(PathBuf::from("/v/a.mp4"));
        let newer = fallback.publish_in_background(PathBuf::from("/v/b.mp4"));
        drop(busy);
        older.await.unwrap();
        newer.await.unwrap();

        assert_eq!(
            *extractor.videos.lock().unwrap(),
            vec![PathBuf::from("/v/b.mp4")]
        );
        assert_eq!(desktop.applied.lock().unwrap().len(), 1);
        assert_eq!(artifacts(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_background_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let (fallback, _) = fallback(dir.path(), Arc::new(FakeDesktop::default()));
        let fallback = Arc::new(fallback);

        fallback
            .publish_in_background(PathBuf::from("/v/broken.mp4"))
            .await
            .unwrap();

        assert!(artifacts(dir.path()).is_empty());
        assert_eq!(fallback.current(), None);
    }
}
