//! Pattern presentation and camera preview.

mod preview;
mod surface;

pub use preview::{FramePreview, LatestFramePreview, NullPreview, PreviewSlot};
pub use surface::{
    compose_letterboxed, fit_rect, CanvasSurface, DisplayBackend, DisplayError, DisplayInfo,
    DisplaySurface, Placement, SharedCanvas, SurfaceControl, SurfaceSignal, VirtualDisplayBackend,
};
