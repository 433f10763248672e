//! X11 root window background
//!
//! Draws the still into a pixmap, makes it the root background and advertises
//! it through `_XROOTPMAP_ID` / `ESETROOT_PMAP_ID` so compositors and
//! pseudo-transparent clients pick it up. The pixmap outlives our connection
//! via `RETAIN_PERMANENT`; the one it replaces is released only when an
//! earlier setter retained it the same way.

use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use std::path::Path;
use tracing::{debug, info};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::xproto::*;
use x11rb::wrapper::ConnectionExt as _;

use super::{DesktopBackground, FillMode};
use crate::error::FallbackError;
use crate::surface::x11::{Geometry, primary_monitor};

/// Fixed part of a PutImage request
const PUT_IMAGE_HEADER: usize = 24;

fn desktop_err(e: impl std::fmt::Display) -> FallbackError {
    FallbackError::Desktop(e.to_string())
}

/// Scale `image` to exactly `width` x `height`
pub fn fit_image(image: &DynamicImage, width: u32, height: u32, mode: FillMode) -> RgbImage {
    match mode {
        FillMode::Fill => image
            .resize_to_fill(width, height, FilterType::Lanczos3)
            .to_rgb8(),
        FillMode::Fit => {
            let scaled = image.resize(width, height, FilterType::Lanczos3).to_rgb8();
            let mut canvas = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
            let x = (width - scaled.width()) / 2;
            let y = (height - scaled.height()) / 2;
            imageops::overlay(&mut canvas, &scaled, i64::from(x), i64::from(y));
            canvas
        }
    }
}

/// 32 bits per pixel ZPixmap data in the server's byte order
pub fn to_zpixmap(image: &RgbImage, lsb_first: bool) -> Vec<u8> {
    let mut data = Vec::with_capacity(image.as_raw().len() / 3 * 4);
    for Rgb([r, g, b]) in image.pixels() {
        if lsb_first {
            data.extend_from_slice(&[*b, *g, *r, 0]);
        } else {
            data.extend_from_slice(&[0, *r, *g, *b]);
        }
    }
    data
}

/// Rows that fit in one PutImage request
pub fn rows_per_request(max_request_bytes: usize, stride: usize) -> usize {
    (max_request_bytes.saturating_sub(PUT_IMAGE_HEADER) / stride.max(1)).max(1)
}

/// The old background pixmap that is safe to release with `KillClient`.
///
/// Only a pixmap advertised under both properties was left behind by an
/// Esetroot-style setter with `RETAIN_PERMANENT`. When the two differ, the
/// pixmap may belong to a live desktop program and must be left alone.
pub fn retained_pixmap(
    xrootpmap: Option<Pixmap>,
    esetroot: Option<Pixmap>,
    replacement: Pixmap,
) -> Option<Pixmap> {
    match (xrootpmap, esetroot) {
        (Some(root), Some(eset)) if root == eset && root != 0 && root != replacement => Some(root),
        _ => None,
    }
}

/// Root-window implementation of [`DesktopBackground`]
#[derive(Debug, Default)]
pub struct RootWindowBackground;

impl RootWindowBackground {
    pub fn new() -> Self {
        Self
    }

    fn intern<C: Connection>(conn: &C, name: &str) -> Result<Atom, FallbackError> {
        Ok(conn
            .intern_atom(false, name.as_bytes())
            .map_err(desktop_err)?
            .reply()
            .map_err(desktop_err)?
            .atom)
    }

    fn root_pixmap<C: Connection>(
        conn: &C,
        root: Window,
        atom: Atom,
    ) -> Result<Option<Pixmap>, FallbackError> {
        Ok(conn
            .get_property(false, root, atom, AtomEnum::PIXMAP, 0, 1)
            .map_err(desktop_err)?
            .reply()
            .ok()
            .and_then(|reply| reply.value32().and_then(|mut v| v.next())))
    }

    fn draw<C: Connection>(
        conn: &C,
        screen: &Screen,
        pixmap: Pixmap,
        image: &RgbImage,
        at: Geometry,
    ) -> Result<(), FallbackError> {
        let gc = conn.generate_id().map_err(desktop_err)?;
        conn.create_gc(gc, pixmap, &CreateGCAux::new().foreground(screen.black_pixel))
            .map_err(desktop_err)?;

        // Black outside the primary monitor
        conn.poly_fill_rectangle(
            pixmap,
            gc,
            &[Rectangle {
                x: 0,
                y: 0,
                width: screen.width_in_pixels,
                height: screen.height_in_pixels,
            }],
        )
        .map_err(desktop_err)?;

        let lsb_first = conn.setup().image_byte_order == ImageOrder::LSB_FIRST;
        let data = to_zpixmap(image, lsb_first);
        let stride = image.width() as usize * 4;
        let rows = rows_per_request(conn.maximum_request_bytes(), stride);

        for (i, chunk) in data.chunks(rows * stride).enumerate() {
            let y = at.y as i32 + (i * rows) as i32;
            conn.put_image(
                ImageFormat::Z_PIXMAP,
                pixmap,
                gc,
                image.width() as u16,
                (chunk.len() / stride) as u16,
                at.x,
                y as i16,
                0,
                screen.root_depth,
                chunk,
            )
            .map_err(desktop_err)?;
        }

        conn.free_gc(gc).map_err(desktop_err)?;
        Ok(())
    }
}

impl DesktopBackground for RootWindowBackground {
    fn set_background(&self, path: &Path, mode: FillMode) -> Result<(), FallbackError> {
        let (conn, screen_num) = x11rb::connect(None).map_err(desktop_err)?;
        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;

        if screen.root_depth != 24 && screen.root_depth != 32 {
            return Err(FallbackError::Desktop(format!(
                "unsupported root depth {}",
                screen.root_depth
            )));
        }

        let geometry = primary_monitor(&conn, screen);
        let still = image::open(path)?;
        let fitted = fit_image(
            &still,
            u32::from(geometry.width),
            u32::from(geometry.height),
            mode,
        );

        let pixmap = conn.generate_id().map_err(desktop_err)?;
        conn.create_pixmap(
            screen.root_depth,
            pixmap,
            root,
            screen.width_in_pixels,
            screen.height_in_pixels,
        )
        .map_err(desktop_err)?;
        Self::draw(&conn, screen, pixmap, &fitted, geometry)?;

        let xrootpmap = Self::intern(&conn, "_XROOTPMAP_ID")?;
        let esetroot = Self::intern(&conn, "ESETROOT_PMAP_ID")?;

        let previous = retained_pixmap(
            Self::root_pixmap(&conn, root, xrootpmap)?,
            Self::root_pixmap(&conn, root, esetroot)?,
            pixmap,
        );

        conn.change_window_attributes(
            root,
            &ChangeWindowAttributesAux::new().background_pixmap(pixmap),
        )
        .map_err(desktop_err)?;
        conn.clear_area(false, root, 0, 0, 0, 0).map_err(desktop_err)?;

        for atom in [xrootpmap, esetroot] {
            conn.change_property32(PropMode::REPLACE, root, atom, AtomEnum::PIXMAP, &[pixmap])
                .map_err(desktop_err)?;
        }

        if let Some(old) = previous {
            debug!("Releasing previous root pixmap 0x{:x}", old);
            conn.kill_client(old).map_err(desktop_err)?;
        }

        conn.set_close_down_mode(CloseDown::RETAIN_PERMANENT)
            .map_err(desktop_err)?;

        // Round trip so every request is processed before we disconnect
        conn.get_input_focus()
            .map_err(desktop_err)?
            .reply()
            .map_err(desktop_err)?;

        info!(
            "Root background set from {:?} ({}x{})",
            path, geometry.width, geometry.height
        );
        Ok(())
    }
}
