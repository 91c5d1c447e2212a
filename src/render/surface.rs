//! Display surfaces the pattern sequencer projects on.
//!
//! A [`DisplayBackend`] enumerates displays and opens a [`DisplaySurface`] on
//! one of them. The virtual backend renders into in-memory canvases, which the
//! synthetic cameras sample to close the loop without hardware.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use parking_lot::RwLock;
use thiserror::Error;

use crate::config::VirtualDisplay;

/// Canvas shared between a surface and whoever observes it.
pub type SharedCanvas = Arc<RwLock<RgbImage>>;

/// Display error type.
#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("Display {index} not available ({found} display(s) detected)")]
    NotFound { index: usize, found: usize },
    #[error("Cannot present an empty image ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("Display surface error: {0}")]
    Surface(String),
}

/// Information about a connected display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    /// Enumeration index.
    pub index: usize,
    /// Display name.
    pub name: String,
    /// Position in the virtual desktop (top-left corner).
    pub position: (i32, i32),
    /// Resolution in pixels.
    pub size: (u32, u32),
    /// Whether this is the primary display.
    pub is_primary: bool,
}

impl DisplayInfo {
    /// Get a display label suitable for logs (includes resolution).
    pub fn label(&self) -> String {
        format!("{} ({}x{})", self.name, self.size.0, self.size.1)
    }
}

/// Signals raised by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceSignal {
    /// The operator asked to close the pattern window.
    CloseRequested,
}

/// A fullscreen surface patterns are drawn on.
pub trait DisplaySurface {
    /// Surface size in pixels.
    fn size(&self) -> (u32, u32);

    /// Draw `pattern` centered and uniformly scaled, letterboxed on black.
    fn present(&mut self, pattern: &DynamicImage) -> Result<(), DisplayError>;

    /// Drain pending signals without blocking.
    fn poll_signals(&mut self) -> Vec<SurfaceSignal>;
}

/// Enumerates displays and opens surfaces on them.
pub trait DisplayBackend {
    fn displays(&self) -> Vec<DisplayInfo>;

    fn open(&self, display: &DisplayInfo) -> Result<Box<dyn DisplaySurface>, DisplayError>;
}

/// Where a scaled image lands on a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Fit an image into a surface preserving aspect ratio.
///
/// `scale = min(surface_w / image_w, surface_h / image_h)`, the result is
/// centered on both axes.
pub fn fit_rect(surface: (u32, u32), image: (u32, u32)) -> Placement {
    let (sw, sh) = surface;
    let (iw, ih) = image;
    if iw == 0 || ih == 0 || sw == 0 || sh == 0 {
        return Placement {
            x: 0,
            y: 0,
            width: 0,
            height: 0,
        };
    }

    let scale = (sw as f32 / iw as f32).min(sh as f32 / ih as f32);
    let width = ((iw as f32 * scale) as u32).min(sw);
    let height = ((ih as f32 * scale) as u32).min(sh);

    Placement {
        x: (sw as i32 - width as i32) / 2,
        y: (sh as i32 - height as i32) / 2,
        width,
        height,
    }
}

/// Render `pattern` letterboxed into a black canvas of `size`.
pub fn compose_letterboxed(size: (u32, u32), pattern: &DynamicImage) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(size.0, size.1, Rgb([0, 0, 0]));
    let placement = fit_rect(size, (pattern.width(), pattern.height()));
    if placement.width == 0 || placement.height == 0 {
        return canvas;
    }

    let rgb = pattern.to_rgb8();
    let scaled = if rgb.dimensions() == (placement.width, placement.height) {
        rgb
    } else {
        imageops::resize(&rgb, placement.width, placement.height, FilterType::CatmullRom)
    };
    imageops::replace(&mut canvas, &scaled, placement.x as i64, placement.y as i64);
    canvas
}

/// Handle used to raise surface signals from outside the sequencer thread.
#[derive(Debug, Clone)]
pub struct SurfaceControl {
    sender: Sender<SurfaceSignal>,
}

impl SurfaceControl {
    /// Ask the pattern window to close.
    pub fn request_close(&self) {
        let _ = self.sender.send(SurfaceSignal::CloseRequested);
    }
}

/// Surface that renders into a shared in-memory canvas.
pub struct CanvasSurface {
    info: DisplayInfo,
    canvas: SharedCanvas,
    signals: Receiver<SurfaceSignal>,
}

impl CanvasSurface {
    pub fn new(info: DisplayInfo, canvas: SharedCanvas, signals: Receiver<SurfaceSignal>) -> Self {
        Self {
            info,
            canvas,
            signals,
        }
    }
}

impl DisplaySurface for CanvasSurface {
    fn size(&self) -> (u32, u32) {
        self.info.size
    }

    fn present(&mut self, pattern: &DynamicImage) -> Result<(), DisplayError> {
        if pattern.width() == 0 || pattern.height() == 0 {
            return Err(DisplayError::EmptyImage {
                width: pattern.width(),
                height: pattern.height(),
            });
        }

        let frame = compose_letterboxed(self.info.size, pattern);
        *self.canvas.write() = frame;

        log::debug!(
            "Presented pattern {}x{} on {}",
            pattern.width(),
            pattern.height(),
            self.info.label()
        );
        Ok(())
    }

    fn poll_signals(&mut self) -> Vec<SurfaceSignal> {
        self.signals.try_iter().collect()
    }
}

impl Drop for CanvasSurface {
    fn drop(&mut self) {
        // Blank the projector when the surface goes away.
        let (w, h) = self.info.size;
        *self.canvas.write() = RgbImage::from_pixel(w, h, Rgb([0, 0, 0]));
        log::debug!("Closed surface on {}", self.info.label());
    }
}

/// Display backend made of in-memory canvases.
pub struct VirtualDisplayBackend {
    displays: Vec<(DisplayInfo, SharedCanvas)>,
    signal_tx: Sender<SurfaceSignal>,
    signal_rx: Receiver<SurfaceSignal>,
}

impl VirtualDisplayBackend {
    /// Lay the displays out left to right, the first one primary.
    pub fn new(displays: &[VirtualDisplay]) -> Self {
        let (signal_tx, signal_rx) = unbounded();
        let mut x = 0i32;
        let displays = displays
            .iter()
            .enumerate()
            .map(|(index, display)| {
                let info = DisplayInfo {
                    index,
                    name: display.name.clone(),
                    position: (x, 0),
                    size: (display.width, display.height),
                    is_primary: index == 0,
                };
                x += display.width as i32;
                let canvas = Arc::new(RwLock::new(RgbImage::from_pixel(
                    display.width,
                    display.height,
                    Rgb([0, 0, 0]),
                )));
                (info, canvas)
            })
            .collect();

        Self {
            displays,
            signal_tx,
            signal_rx,
        }
    }

    /// Canvas backing display `index`.
    pub fn canvas(&self, index: usize) -> Option<SharedCanvas> {
        self.displays.get(index).map(|(_, canvas)| Arc::clone(canvas))
    }

    /// Handle for raising signals on surfaces opened from this backend.
    pub fn control(&self) -> SurfaceControl {
        SurfaceControl {
            sender: self.signal_tx.clone(),
        }
    }
}

impl DisplayBackend for VirtualDisplayBackend {
    fn displays(&self) -> Vec<DisplayInfo> {
        self.displays.iter().map(|(info, _)| info.clone()).collect()
    }

    fn open(&self, display: &DisplayInfo) -> Result<Box<dyn DisplaySurface>, DisplayError> {
        let (info, canvas) = self
            .displays
            .get(display.index)
            .ok_or(DisplayError::NotFound {
                index: display.index,
                found: self.displays.len(),
            })?;

        // Stale signals from a previous session must not close this one.
        while self.signal_rx.try_recv().is_ok() {}

        log::info!("Opened pattern surface on {}", info.label());
        Ok(Box::new(CanvasSurface::new(
            info.clone(),
            Arc::clone(canvas),
            self.signal_rx.clone(),
        )))
    }
}
