//! Camera input module for structured light capture.
//!
//! Cameras are reached through two traits: a [`CameraProvider`] enumerates and
//! opens devices, and the [`FrameSource`] it hands out is owned by exactly one
//! acquirer thread for its whole lifetime.

mod convert;
mod synthetic;
#[cfg(feature = "uvc")]
mod uvc;

pub use convert::{ConvertError, PixelConverter, StandardConverter};
pub use synthetic::{SyntheticCamera, SyntheticCameraProvider};
#[cfg(feature = "uvc")]
pub use uvc::UvcCameraProvider;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Pixel layout of a raw camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit grayscale.
    Mono8,
    /// Packed 8-bit RGB.
    Rgb8,
    /// Packed 8-bit BGR.
    Bgr8,
    /// Packed YUV 4:2:2, Y0 U Y1 V.
    Yuyv,
    /// 8-bit Bayer mosaic, RGGB order.
    BayerRg8,
}

impl PixelFormat {
    /// Bytes required for a frame of the given size.
    pub fn frame_len(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Mono8 | PixelFormat::BayerRg8 => pixels,
            PixelFormat::Yuyv => pixels * 2,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => pixels * 3,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelFormat::Mono8 => write!(f, "Mono8"),
            PixelFormat::Rgb8 => write!(f, "RGB8"),
            PixelFormat::Bgr8 => write!(f, "BGR8"),
            PixelFormat::Yuyv => write!(f, "YUV422 YUYV"),
            PixelFormat::BayerRg8 => write!(f, "BayerRG8"),
        }
    }
}

/// Raw frame pulled from a camera.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel layout of `data`.
    pub format: PixelFormat,
    /// Raw pixel data.
    pub data: Bytes,
    /// Device frame counter.
    pub frame_number: u64,
    /// Timestamp from grab start.
    pub timestamp: Duration,
}

/// Acquisition trigger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Free-running acquisition.
    #[default]
    Continuous,
    /// Frames on software trigger.
    Software,
    /// Frames on a hardware trigger line.
    Hardware,
}

/// Settings applied to a camera before grabbing starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Requested frame width.
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
    /// Trigger mode.
    pub trigger_mode: TriggerMode,
    /// Gamma correction, if the device supports it.
    pub gamma: Option<f32>,
    /// Exposure time in microseconds.
    pub exposure_us: Option<f32>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            trigger_mode: TriggerMode::Continuous,
            gamma: Some(0.37),
            exposure_us: Some(10_000.0),
        }
    }
}

/// Information about an available camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Enumeration index.
    pub index: usize,
    /// Human readable name.
    pub name: String,
    /// Serial number, if known.
    pub serial: Option<String>,
}

impl DeviceInfo {
    /// Label suitable for logs.
    pub fn label(&self) -> String {
        match &self.serial {
            Some(serial) => format!("{} [{}] ({})", self.name, self.index, serial),
            None => format!("{} [{}]", self.name, self.index),
        }
    }
}

/// Camera error type.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Timed out waiting for a frame")]
    Timeout,
    #[error("Camera not found: {0}")]
    NotFound(String),
    #[error("Failed to set {param}: {reason}")]
    Configure { param: &'static str, reason: String },
    #[error("Grab session error: {0}")]
    Grab(String),
    #[error("Camera error: {0}")]
    Device(String),
}

/// One camera handle.
///
/// Implementations are not required to be `Send`: a source is opened on the
/// acquirer thread that uses it and never leaves that thread.
pub trait FrameSource {
    /// Apply resolution, trigger and exposure settings.
    fn configure(&mut self, settings: &CameraSettings) -> Result<(), SourceError>;

    /// Begin continuous acquisition.
    fn start_grab(&mut self) -> Result<(), SourceError>;

    /// Wait up to `timeout` for the next frame. Returns
    /// [`SourceError::Timeout`] when none arrived in time.
    fn pull_frame(&mut self, timeout: Duration) -> Result<RawFrame, SourceError>;

    /// Stop acquisition. Must be safe to call when not grabbing.
    fn stop_grab(&mut self) -> Result<(), SourceError>;

    /// Release the device.
    fn close(&mut self) -> Result<(), SourceError>;
}

/// Enumerates and opens cameras.
pub trait CameraProvider: Send + Sync {
    /// List the cameras currently attached.
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, SourceError>;

    /// Open a camera returned by [`CameraProvider::enumerate`].
    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn FrameSource>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_len() {
        assert_eq!(PixelFormat::Mono8.frame_len(4, 2), 8);
        assert_eq!(PixelFormat::BayerRg8.frame_len(4, 2), 8);
        assert_eq!(PixelFormat::Yuyv.frame_len(4, 2), 16);
        assert_eq!(PixelFormat::Rgb8.frame_len(4, 2), 24);
    }

    #[test]
    fn test_pixel_format_serde_names() {
        let json = serde_json::to_string(&PixelFormat::BayerRg8).unwrap();
        assert_eq!(json, "\"bayer_rg8\"");
        let parsed: PixelFormat = serde_json::from_str("\"yuyv\"").unwrap();
        assert_eq!(parsed, PixelFormat::Yuyv);
    }

    #[test]
    fn test_device_label() {
        let device = DeviceInfo {
            index: 1,
            name: "Cam".to_string(),
            serial: None,
        };
        assert_eq!(device.label(), "Cam [1]");
    }
}
