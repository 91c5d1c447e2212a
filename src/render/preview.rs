//! Camera preview sinks.

use std::collections::HashMap;

use image::DynamicImage;
use parking_lot::Mutex;

/// Receives every converted camera frame for live display.
pub trait FramePreview: Send + Sync {
    fn show(&self, name: &str, frame: &DynamicImage);

    fn close(&self, name: &str);
}

/// Preview that drops every frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPreview;

impl FramePreview for NullPreview {
    fn show(&self, _name: &str, _frame: &DynamicImage) {}

    fn close(&self, _name: &str) {}
}

/// Latest frame seen from one camera.
#[derive(Clone, Default)]
pub struct PreviewSlot {
    /// Most recent frame, `None` once the camera closed.
    pub frame: Option<DynamicImage>,
    /// Frames shown since the slot was created.
    pub frames_shown: u64,
    /// Whether the camera has closed its preview.
    pub closed: bool,
}

/// Keeps the most recent frame per camera for a UI to pick up.
#[derive(Default)]
pub struct LatestFramePreview {
    slots: Mutex<HashMap<String, PreviewSlot>>,
}

impl LatestFramePreview {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one camera's slot.
    pub fn slot(&self, name: &str) -> Option<PreviewSlot> {
        self.slots.lock().get(name).cloned()
    }

    /// Names of all cameras that have shown at least one frame.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl FramePreview for LatestFramePreview {
    fn show(&self, name: &str, frame: &DynamicImage) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(name.to_string()).or_default();
        slot.frame = Some(frame.clone());
        slot.frames_shown += 1;
        slot.closed = false;
    }

    fn close(&self, name: &str) {
        if let Some(slot) = self.slots.lock().get_mut(name) {
            slot.frame = None;
            slot.closed = true;
        }
    }
}
