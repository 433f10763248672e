//! X11 desktop-level surface
//!
//! Creates a `_NET_WM_WINDOW_TYPE_DESKTOP` window over the primary monitor,
//! makes it input-transparent with an empty input shape and keeps it at the
//! bottom of the stack. mpv draws into it.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::randr::ConnectionExt as _;
use x11rb::protocol::shape::{ConnectionExt as _, SK, SO};
use x11rb::protocol::xproto::*;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use super::SurfaceBackend;
use super::mpv::MpvLoop;
use crate::config::SurfaceConfig;
use crate::error::{MediaError, SurfaceError};
use crate::media::FfmpegMedia;
use crate::volume::Volume;

/// `_NET_WM_DESKTOP` value meaning "every desktop"
const ALL_DESKTOPS: u32 = 0xFFFF_FFFF;

const WM_NAME: &[u8] = b"alivepaper";
const WM_CLASS: &[u8] = b"alivepaper\0Alivepaper\0";

fn display_err(e: impl std::fmt::Display) -> SurfaceError {
    SurfaceError::Display(e.to_string())
}

/// Atoms the surface window needs
#[derive(Debug)]
struct SurfaceAtoms {
    net_wm_window_type: Atom,
    net_wm_window_type_desktop: Atom,
    net_wm_state: Atom,
    net_wm_state_below: Atom,
    net_wm_state_sticky: Atom,
    net_wm_state_skip_taskbar: Atom,
    net_wm_state_skip_pager: Atom,
    net_wm_desktop: Atom,
}

impl SurfaceAtoms {
    fn new<C: Connection>(conn: &C) -> Result<Self, SurfaceError> {
        let intern = |name: &str| -> Result<Atom, SurfaceError> {
            Ok(conn
                .intern_atom(false, name.as_bytes())
                .map_err(display_err)?
                .reply()
                .map_err(display_err)?
                .atom)
        };

        Ok(Self {
            net_wm_window_type: intern("_NET_WM_WINDOW_TYPE")?,
            net_wm_window_type_desktop: intern("_NET_WM_WINDOW_TYPE_DESKTOP")?,
            net_wm_state: intern("_NET_WM_STATE")?,
            net_wm_state_below: intern("_NET_WM_STATE_BELOW")?,
            net_wm_state_sticky: intern("_NET_WM_STATE_STICKY")?,
            net_wm_state_skip_taskbar: intern("_NET_WM_STATE_SKIP_TASKBAR")?,
            net_wm_state_skip_pager: intern("_NET_WM_STATE_SKIP_PAGER")?,
            net_wm_desktop: intern("_NET_WM_DESKTOP")?,
        })
    }
}

/// Monitor rectangle in root coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
}

/// Primary monitor, else the first one, else the whole screen
pub fn primary_geometry(monitors: &[(bool, Geometry)], screen: Geometry) -> Geometry {
    monitors
        .iter()
        .filter(|(_, g)| g.width > 0 && g.height > 0)
        .find(|(primary, _)| *primary)
        .or_else(|| monitors.iter().find(|(_, g)| g.width > 0 && g.height > 0))
        .map(|(_, g)| *g)
        .unwrap_or(screen)
}

/// Geometry of the primary display as reported by RandR
pub fn primary_monitor<C: Connection>(conn: &C, screen: &Screen) -> Geometry {
    let full = Geometry {
        x: 0,
        y: 0,
        width: screen.width_in_pixels,
        height: screen.height_in_pixels,
    };

    let monitors = match conn
        .randr_get_monitors(screen.root, true)
        .map_err(display_err)
        .and_then(|cookie| cookie.reply().map_err(display_err))
    {
        Ok(reply) => reply.monitors,
        Err(e) => {
            debug!("RandR monitors unavailable ({}), using full screen", e);
            return full;
        }
    };

    let monitors: Vec<(bool, Geometry)> = monitors
        .iter()
        .map(|m| {
            (
                m.primary,
                Geometry {
                    x: m.x,
                    y: m.y,
                    width: m.width,
                    height: m.height,
                },
            )
        })
        .collect();

    primary_geometry(&monitors, full)
}

/// The mounted desktop window
#[derive(Debug)]
pub struct DesktopWindow {
    pub id: Window,
    pub geometry: Geometry,
}

/// X11 + mpv implementation of the surface
pub struct X11Surface {
    conn: RustConnection,
    screen_num: usize,
    atoms: SurfaceAtoms,
    media: FfmpegMedia,
    config: SurfaceConfig,
    runtime_dir: PathBuf,
    sequence: u32,
}

impl X11Surface {
    pub fn connect(config: SurfaceConfig, media: FfmpegMedia) -> Result<Self, SurfaceError> {
        let (conn, screen_num) = x11rb::connect(None).map_err(display_err)?;
        let atoms = SurfaceAtoms::new(&conn)?;

        let runtime_dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        info!("Connected to X11 display (screen {})", screen_num);

        Ok(Self {
            conn,
            screen_num,
            atoms,
            media,
            config,
            runtime_dir,
            sequence: 0,
        })
    }

    fn screen(&self) -> &Screen {
        &self.conn.setup().roots[self.screen_num]
    }

    fn create_window(&self, geometry: Geometry) -> Result<Window, SurfaceError> {
        let conn = &self.conn;
        let screen = self.screen();
        let win = conn.generate_id().map_err(display_err)?;

        conn.create_window(
            screen.root_depth,
            win,
            screen.root,
            geometry.x,
            geometry.y,
            geometry.width,
            geometry.height,
            0,
            WindowClass::INPUT_OUTPUT,
            0,
            &CreateWindowAux::new()
                .background_pixel(screen.black_pixel)
                .event_mask(EventMask::STRUCTURE_NOTIFY),
        )
        .map_err(display_err)?
        .check()
        .map_err(display_err)?;

        let atoms = &self.atoms;
        conn.change_property8(PropMode::REPLACE, win, AtomEnum::WM_NAME, AtomEnum::STRING, WM_NAME)
            .map_err(display_err)?;
        conn.change_property8(PropMode::REPLACE, win, AtomEnum::WM_CLASS, AtomEnum::STRING, WM_CLASS)
            .map_err(display_err)?;
        conn.change_property32(
            PropMode::REPLACE,
            win,
            atoms.net_wm_window_type,
            AtomEnum::ATOM,
            &[atoms.net_wm_window_type_desktop],
        )
        .map_err(display_err)?;
        conn.change_property32(
            PropMode::REPLACE,
            win,
            atoms.net_wm_state,
            AtomEnum::ATOM,
            &[
                atoms.net_wm_state_below,
                atoms.net_wm_state_sticky,
                atoms.net_wm_state_skip_taskbar,
                atoms.net_wm_state_skip_pager,
            ],
        )
        .map_err(display_err)?;
        conn.change_property32(
            PropMode::REPLACE,
            win,
            atoms.net_wm_desktop,
            AtomEnum::CARDINAL,
            &[ALL_DESKTOPS],
        )
        .map_err(display_err)?;

        // Empty input region: clicks reach the desktop underneath
        conn.shape_rectangles(SO::SET, SK::INPUT, ClipOrdering::UNSORTED, win, 0, 0, &[])
            .map_err(display_err)?;

        conn.map_window(win).map_err(display_err)?;
        conn.configure_window(
            win,
            &ConfigureWindowAux::new()
                .x(i32::from(geometry.x))
                .y(i32::from(geometry.y))
                .stack_mode(StackMode::BELOW),
        )
        .map_err(display_err)?;
        conn.flush().map_err(display_err)?;

        Ok(win)
    }

    fn next_socket(&mut self) -> PathBuf {
        self.sequence = self.sequence.wrapping_add(1);
        self.runtime_dir.join(format!(
            "alivepaper-mpv-{}-{}.sock",
            std::process::id(),
            self.sequence
        ))
    }
}

impl SurfaceBackend for X11Surface {
    type Window = DesktopWindow;
    type Player = MpvLoop;

    fn probe(&mut self, path: &Path) -> Result<(), SurfaceError> {
        match self.media.probe(path) {
            Ok(_) => Ok(()),
            Err(e @ MediaError::Spawn { .. }) => Err(SurfaceError::Player(e.to_string())),
            Err(e) => Err(SurfaceError::Decode {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    fn mount(&mut self) -> Result<DesktopWindow, SurfaceError> {
        let geometry = primary_monitor(&self.conn, self.screen());
        let id = self.create_window(geometry)?;
        debug!(
            "Mounted surface 0x{:x} at {}x{}+{}+{}",
            id, geometry.width, geometry.height, geometry.x, geometry.y
        );
        Ok(DesktopWindow { id, geometry })
    }

    fn play(
        &mut self,
        window: &DesktopWindow,
        path: &Path,
        volume: Volume,
    ) -> Result<MpvLoop, SurfaceError> {
        let socket = self.next_socket();
        MpvLoop::start(&self.config, window.id, path, volume, socket)
    }

    fn unmount(&mut self, window: DesktopWindow) {
        if let Err(e) = self.conn.destroy_window(window.id) {
            warn!("Failed to destroy surface 0x{:x}: {}", window.id, e);
        }
        if let Err(e) = self.conn.flush() {
            warn!("Failed to flush X11 connection: {}", e);
        }
        debug!(
            "Unmounted {}x{} surface 0x{:x}",
            window.geometry.width, window.geometry.height, window.id
        );
    }
}
