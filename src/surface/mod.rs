//! Desktop video surface
//!
//! The controller owns at most one [`SurfaceSession`]. Every activation tears
//! the previous session down completely before a new window is mounted.

pub mod handle;
pub mod mpv;
pub mod x11;

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::SurfaceError;
use crate::volume::Volume;

pub use handle::{SurfaceHandle, SurfaceThread};

/// A running, looping playback attached to a surface
pub trait LoopPlayer {
    /// Change volume without interrupting playback
    fn set_volume(&mut self, volume: Volume) -> Result<(), SurfaceError>;

    /// Stop playback and release every resource held by the loop.
    /// Must be safe to call more than once.
    fn stop(&mut self);
}

/// Platform pieces the controller drives
pub trait SurfaceBackend {
    type Window;
    type Player: LoopPlayer;

    /// Reject files that cannot be decoded before anything is mounted
    fn probe(&mut self, path: &Path) -> Result<(), SurfaceError>;

    /// Create the input-transparent desktop-level window
    fn mount(&mut self) -> Result<Self::Window, SurfaceError>;

    /// Start an endless letterboxed loop into `window`
    fn play(
        &mut self,
        window: &Self::Window,
        path: &Path,
        volume: Volume,
    ) -> Result<Self::Player, SurfaceError>;

    fn unmount(&mut self, window: Self::Window);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Idle,
    Active,
}

/// The one live wallpaper
#[derive(Debug)]
pub struct SurfaceSession<W, P> {
    pub video_path: PathBuf,
    pub volume: Volume,
    pub loop_handle: P,
    pub render_window: W,
}

/// Snapshot reported to clients
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceStatus {
    pub state: SurfaceState,
    pub path: Option<PathBuf>,
    pub volume: Option<Volume>,
}

impl SurfaceStatus {
    pub fn is_active(&self) -> bool {
        self.state == SurfaceState::Active
    }
}

pub struct SurfaceController<B: SurfaceBackend> {
    backend: B,
    session: Option<SurfaceSession<B::Window, B::Player>>,
}

impl<B: SurfaceBackend> SurfaceController<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            session: None,
        }
    }

    pub fn state(&self) -> SurfaceState {
        if self.session.is_some() {
            SurfaceState::Active
        } else {
            SurfaceState::Idle
        }
    }

    /// Replace whatever is playing with `path`.
    ///
    /// On error the controller is left Idle: the previous surface is already
    /// gone and nothing new is mounted.
    pub fn activate(&mut self, path: &Path, volume: Volume) -> Result<(), SurfaceError> {
        self.teardown();

        self.backend.probe(path)?;
        let window = self.backend.mount()?;

        match self.backend.play(&window, path, volume) {
            Ok(player) => {
                self.session = Some(SurfaceSession {
                    video_path: path.to_path_buf(),
                    volume,
                    loop_handle: player,
                    render_window: window,
                });
                info!("Live wallpaper active: {:?} at {}", path, volume);
                Ok(())
            }
            Err(e) => {
                self.backend.unmount(window);
                Err(e)
            }
        }
    }

    pub fn clear(&mut self) {
        if self.session.is_some() {
            info!("Clearing live wallpaper");
        }
        self.teardown();
    }

    /// Returns the active path when the change was applied, `None` when idle
    pub fn set_volume(&mut self, volume: Volume) -> Result<Option<PathBuf>, SurfaceError> {
        let Some(session) = self.session.as_mut() else {
            debug!("Volume change ignored, no active surface");
            return Ok(None);
        };

        session.loop_handle.set_volume(volume)?;
        session.volume = volume;
        if volume.is_muted() {
            info!("Live wallpaper muted");
        } else {
            debug!("Volume set to {}", volume);
        }
        Ok(Some(session.video_path.clone()))
    }

    pub fn status(&self) -> SurfaceStatus {
        SurfaceStatus {
            state: self.state(),
            path: self.session.as_ref().map(|s| s.video_path.clone()),
            volume: self.session.as_ref().map(|s| s.volume),
        }
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!("Tearing down surface for {:?}", session.video_path);
            session.loop_handle.stop();
            self.backend.unmount(session.render_window);
        }
    }
}

impl<B: SurfaceBackend> Drop for SurfaceController<B> {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("Surface controller dropped while active, tearing down");
            self.teardown();
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted backend recording every call

    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Default)]
    pub struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        pub fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        pub fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        pub fn clear(&self) {
            self.0.lock().unwrap().clear();
        }
    }

    #[derive(Debug, Default)]
    pub struct FakeBackend {
        pub journal: Journal,
        /// Files the fake "decoder" rejects
        pub undecodable: Vec<PathBuf>,
        /// Files that pass the probe but the player gives up on
        pub unplayable: Vec<PathBuf>,
        next_window: u32,
    }

    impl FakeBackend {
        pub fn new(journal: Journal) -> Self {
            Self {
                journal,
                ..Default::default()
            }
        }
    }

    #[derive(Debug)]
    pub struct FakePlayer {
        journal: Journal,
        window: u32,
        stopped: bool,
    }

    impl LoopPlayer for FakePlayer {
        fn set_volume(&mut self, volume: Volume) -> Result<(), SurfaceError> {
            self.journal.push(format!("volume {} {}", self.window, volume.get()));
            Ok(())
        }

        fn stop(&mut self) {
            if !self.stopped {
                self.stopped = true;
                self.journal.push(format!("stop {}", self.window));
            }
        }
    }

    impl SurfaceBackend for FakeBackend {
        type Window = u32;
        type Player = FakePlayer;

        fn probe(&mut self, path: &Path) -> Result<(), SurfaceError> {
            if self.undecodable.iter().any(|p| p == path) {
                return Err(SurfaceError::Decode {
                    path: path.to_path_buf(),
                    reason: "no video stream".to_string(),
                });
            }
            Ok(())
        }

        fn mount(&mut self) -> Result<u32, SurfaceError> {
            self.next_window += 1;
            self.journal.push(format!("mount {}", self.next_window));
            Ok(self.next_window)
        }

        fn play(&mut self, window: &u32, path: &Path, volume: Volume) -> Result<FakePlayer, SurfaceError> {
            self.journal.push(format!(
                "play {} {} {}",
                window,
                path.display(),
                volume.get()
            ));
            if self.unplayable.iter().any(|p| p == path) {
                return Err(SurfaceError::Decode {
                    path: path.to_path_buf(),
                    reason: "player exited during startup".to_string(),
                });
            }
            Ok(FakePlayer {
                journal: self.journal.clone(),
                window: *window,
                stopped: false,
            })
        }

        fn unmount(&mut self, window: u32) {
            self.journal.push(format!("unmount {window}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeBackend, Journal};
    use super::*;

    fn vol(v: f32) -> Volume {
        Volume::new(v).unwrap()
    }

    #[test]
    fn test_activate_mounts_and_plays() {
        let journal = Journal::default();
        let mut controller = SurfaceController::new(FakeBackend::new(journal.clone()));

        controller.activate(Path::new("/v/beach.mp4"), vol(0.7)).unwrap();

        assert_eq!(controller.state(), SurfaceState::Active);
        assert_eq!(journal.entries(), vec!["mount 1", "play 1 /v/beach.mp4 0.7"]);
        assert_eq!(
            controller.status(),
            SurfaceStatus {
                state: SurfaceState::Active,
                path: Some(PathBuf::from("/v/beach.mp4")),
                volume: Some(vol(0.7)),
            }
        );
    }

    #[test]
    fn test_teardown_completes_before_next_mount() {
        let journal = Journal::default();
        let mut controller = SurfaceController::new(FakeBackend::new(journal.clone()));

        controller.activate(Path::new("/v/a.mp4"), Volume::FULL).unwrap();
        controller.activate(Path::new("/v/b.mp4"), Volume::FULL).unwrap();

        assert_eq!(
            journal.entries(),
            vec![
                "mount 1",
                "play 1 /v/a.mp4 1",
                "stop 1",
                "unmount 1",
                "mount 2",
                "play 2 /v/b.mp4 1",
            ]
        );
        assert_eq!(controller.status().path, Some(PathBuf::from("/v/b.mp4")));
    }

    #[test]
    fn test_decode_failure_leaves_idle() {
        let journal = Journal::default();
        let mut backend = FakeBackend::new(journal.clone());
        backend.undecodable.push(PathBuf::from("/v/corrupt.mp4"));
        let mut controller = SurfaceController::new(backend);

        controller.activate(Path::new("/v/a.mp4"), Volume::FULL).unwrap();
        journal.clear();

        let err = controller
            .activate(Path::new("/v/corrupt.mp4"), Volume::FULL)
            .unwrap_err();

        assert!(matches!(err, SurfaceError::Decode { .. }));
        assert_eq!(controller.state(), SurfaceState::Idle);
        // Prior surface torn down, nothing new mounted
        assert_eq!(journal.entries(), vec!["stop 1", "unmount 1"]);
    }

    #[test]
    fn test_player_failure_unmounts_fresh_window() {
        let journal = Journal::default();
        let mut backend = FakeBackend::new(journal.clone());
        backend.unplayable.push(PathBuf::from("/v/truncated.mp4"));
        let mut controller = SurfaceController::new(backend);

        controller.activate(Path::new("/v/a.mp4"), Volume::FULL).unwrap();
        journal.clear();

        let err = controller
            .activate(Path::new("/v/truncated.mp4"), Volume::FULL)
            .unwrap_err();

        assert!(matches!(err, SurfaceError::Decode { .. }));
        assert_eq!(controller.state(), SurfaceState::Idle);
        assert!(!controller.status().is_active());
        assert_eq!(
            journal.entries(),
            vec![
                "stop 1",
                "unmount 1",
                "mount 2",
                "play 2 /v/truncated.mp4 1",
                "unmount 2",
            ]
        );

        // Nothing left behind for the next activation to trip over
        controller.activate(Path::new("/v/b.mp4"), Volume::FULL).unwrap();
        assert_eq!(journal.entries().last().map(String::as_str), Some("play 3 /v/b.mp4 1"));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let journal = Journal::default();
        let mut controller = SurfaceController::new(FakeBackend::new(journal.clone()));

        controller.clear();
        controller.activate(Path::new("/v/a.mp4"), Volume::FULL).unwrap();
        controller.clear();
        controller.clear();

        assert_eq!(controller.state(), SurfaceState::Idle);
        assert_eq!(
            journal.entries().iter().filter(|e| e.starts_with("unmount")).count(),
            1
        );
        assert!(!controller.status().is_active());
    }

    #[test]
    fn test_volume_idle_is_noop() {
        let journal = Journal::default();
        let mut controller = SurfaceController::new(FakeBackend::new(journal.clone()));

        assert_eq!(controller.set_volume(vol(0.5)).unwrap(), None);
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn test_mute_keeps_playing() {
        let journal = Journal::default();
        let mut controller = SurfaceController::new(FakeBackend::new(journal.clone()));
        controller.activate(Path::new("/v/a.mp4"), vol(0.7)).unwrap();

        let applied = controller.set_volume(Volume::MUTE).unwrap();

        assert_eq!(applied, Some(PathBuf::from("/v/a.mp4")));
        assert_eq!(controller.state(), SurfaceState::Active);
        assert_eq!(controller.status().volume, Some(Volume::MUTE));
        assert!(!journal.entries().iter().any(|e| e.starts_with("stop")));
    }

    #[test]
    fn test_drop_tears_down() {
        let journal = Journal::default();
        {
            let mut controller = SurfaceController::new(FakeBackend::new(journal.clone()));
            controller.activate(Path::new("/v/a.mp4"), Volume::FULL).unwrap();
        }
        assert_eq!(journal.entries().last().map(String::as_str), Some("unmount 1"));
    }
}
