//! Loopback cameras that film a virtual projector canvas.
//!
//! Each [`SyntheticCamera`] samples the shared canvas at its configured
//! resolution and re-encodes it in a raw pixel format, so the acquisition,
//! conversion and persistence paths run exactly as they do with hardware.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::RgbImage;

use super::{CameraProvider, CameraSettings, DeviceInfo, FrameSource, PixelFormat, RawFrame, SourceError};
use crate::render::SharedCanvas;

/// Provider exposing a fixed number of loopback cameras.
pub struct SyntheticCameraProvider {
    canvas: SharedCanvas,
    device_count: usize,
    format: PixelFormat,
    frame_interval: Duration,
}

impl SyntheticCameraProvider {
    pub fn new(canvas: SharedCanvas, device_count: usize) -> Self {
        Self {
            canvas,
            device_count,
            format: PixelFormat::Rgb8,
            frame_interval: Duration::from_millis(33),
        }
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }
}

impl CameraProvider for SyntheticCameraProvider {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, SourceError> {
        Ok((0..self.device_count)
            .map(|index| DeviceInfo {
                index,
                name: format!("Loopback Camera {}", index),
                serial: Some(format!("SYN-{:04}", index)),
            })
            .collect())
    }

    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn FrameSource>, SourceError> {
        if device.index >= self.device_count {
            return Err(SourceError::NotFound(device.label()));
        }
        Ok(Box::new(SyntheticCamera::new(
            Arc::clone(&self.canvas),
            self.format,
            self.frame_interval,
        )))
    }
}

/// A single loopback camera.
pub struct SyntheticCamera {
    canvas: SharedCanvas,
    format: PixelFormat,
    frame_interval: Duration,
    settings: Option<CameraSettings>,
    grabbing: bool,
    closed: bool,
    frame_count: u64,
    grab_start: Instant,
    next_frame_at: Instant,
}

impl SyntheticCamera {
    pub fn new(canvas: SharedCanvas, format: PixelFormat, frame_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            canvas,
            format,
            frame_interval,
            settings: None,
            grabbing: false,
            closed: false,
            frame_count: 0,
            grab_start: now,
            next_frame_at: now,
        }
    }

    fn capture(&self, width: u32, height: u32) -> RgbImage {
        let canvas = self.canvas.read();
        if canvas.dimensions() == (width, height) {
            canvas.clone()
        } else {
            imageops::resize(&*canvas, width, height, FilterType::Triangle)
        }
    }
}

impl FrameSource for SyntheticCamera {
    fn configure(&mut self, settings: &CameraSettings) -> Result<(), SourceError> {
        if self.closed {
            return Err(SourceError::Device("camera is closed".into()));
        }
        if settings.width == 0 || settings.height == 0 {
            return Err(SourceError::Configure {
                param: "resolution",
                reason: format!("{}x{} is not a valid resolution", settings.width, settings.height),
            });
        }
        if self.format == PixelFormat::Yuyv && settings.width % 2 != 0 {
            return Err(SourceError::Configure {
                param: "resolution",
                reason: format!("YUYV output needs an even width, got {}", settings.width),
            });
        }
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn start_grab(&mut self) -> Result<(), SourceError> {
        if self.settings.is_none() {
            return Err(SourceError::Grab("camera not configured".into()));
        }
        self.grabbing = true;
        self.grab_start = Instant::now();
        self.next_frame_at = self.grab_start;
        Ok(())
    }

    fn pull_frame(&mut self, timeout: Duration) -> Result<RawFrame, SourceError> {
        if !self.grabbing {
            return Err(SourceError::Grab("not grabbing".into()));
        }
        let (width, height) = match &self.settings {
            Some(settings) => (settings.width, settings.height),
            None => return Err(SourceError::Grab("camera not configured".into())),
        };

        let wait = self.next_frame_at.saturating_duration_since(Instant::now());
        if wait > timeout {
            thread::sleep(timeout);
            return Err(SourceError::Timeout);
        }
        thread::sleep(wait);
        self.next_frame_at = Instant::now() + self.frame_interval;

        let rgb = self.capture(width, height);
        let data = encode(&rgb, self.format);
        let frame_number = self.frame_count;
        self.frame_count += 1;

        Ok(RawFrame {
            width,
            height,
            format: self.format,
            data: Bytes::from(data),
            frame_number,
            timestamp: self.grab_start.elapsed(),
        })
    }

    fn stop_grab(&mut self) -> Result<(), SourceError> {
        self.grabbing = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        self.grabbing = false;
        self.closed = true;
        Ok(())
    }
}

fn luma(px: &[u8]) -> u8 {
    let (r, g, b) = (px[0] as u32, px[1] as u32, px[2] as u32);
    ((r * 299 + g * 587 + b * 114 + 500) / 1000) as u8
}

/// BT.601 studio-range RGB to YUV.
fn rgb_to_yuv(px: &[u8]) -> (u8, u8, u8) {
    let (r, g, b) = (px[0] as i32, px[1] as i32, px[2] as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (y.clamp(0, 255) as u8, u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

/// Encode an RGB image into the raw layout of `format`.
fn encode(rgb: &RgbImage, format: PixelFormat) -> Vec<u8> {
    let (width, height) = rgb.dimensions();
    let raw = rgb.as_raw();

    match format {
        PixelFormat::Rgb8 => raw.clone(),
        PixelFormat::Bgr8 => {
            let mut out = raw.clone();
            for px in out.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            out
        }
        PixelFormat::Mono8 => raw.chunks_exact(3).map(luma).collect(),
        PixelFormat::Yuyv => {
            let mut out = Vec::with_capacity(format.frame_len(width, height));
            for pair in raw.chunks_exact(6) {
                let (y0, u0, v0) = rgb_to_yuv(&pair[..3]);
                let (y1, u1, v1) = rgb_to_yuv(&pair[3..]);
                let u = ((u0 as u16 + u1 as u16) / 2) as u8;
                let v = ((v0 as u16 + v1 as u16) / 2) as u8;
                out.extend_from_slice(&[y0, u, y1, v]);
            }
            out
        }
        PixelFormat::BayerRg8 => {
            let mut out = Vec::with_capacity(format.frame_len(width, height));
            for (x, y, px) in rgb.enumerate_pixels() {
                let channel = match (y % 2, x % 2) {
                    (0, 0) => 0,
                    (1, 1) => 2,
                    _ => 1,
                };
                out.push(px.0[channel]);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{PixelConverter, StandardConverter};
    use image::Rgb;
    use parking_lot::RwLock;

    fn canvas(color: [u8; 3]) -> SharedCanvas {
        Arc::new(RwLock::new(RgbImage::from_pixel(16, 8, Rgb(color))))
    }

    fn settings(width: u32, height: u32) -> CameraSettings {
        CameraSettings {
            width,
            height,
            ..CameraSettings::default()
        }
    }

    #[test]
    fn test_enumerate_and_open() {
        let provider = SyntheticCameraProvider::new(canvas([0, 0, 0]), 2);
        let devices = provider.enumerate().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].serial.as_deref(), Some("SYN-0001"));

        assert!(provider.open(&devices[0]).is_ok());
        let missing = DeviceInfo {
            index: 5,
            name: "ghost".into(),
            serial: None,
        };
        assert!(matches!(provider.open(&missing), Err(SourceError::NotFound(_))));
    }

    #[test]
    fn test_pull_requires_grab() {
        let mut camera = SyntheticCamera::new(canvas([0, 0, 0]), PixelFormat::Rgb8, Duration::ZERO);
        assert!(camera.pull_frame(Duration::from_millis(5)).is_err());
        assert!(camera.start_grab().is_err());

        camera.configure(&settings(4, 4)).unwrap();
        camera.start_grab().unwrap();
        let frame = camera.pull_frame(Duration::from_millis(5)).unwrap();
        assert_eq!((frame.width, frame.height), (4, 4));
        assert_eq!(frame.data.len(), 48);
    }

    #[test]
    fn test_slow_camera_times_out() {
        let mut camera =
            SyntheticCamera::new(canvas([0, 0, 0]), PixelFormat::Mono8, Duration::from_secs(5));
        camera.configure(&settings(4, 4)).unwrap();
        camera.start_grab().unwrap();
        assert!(camera.pull_frame(Duration::from_millis(5)).is_ok());
        assert!(matches!(
            camera.pull_frame(Duration::from_millis(5)),
            Err(SourceError::Timeout)
        ));
    }

    #[test]
    fn test_rejects_zero_resolution() {
        let mut camera = SyntheticCamera::new(canvas([0, 0, 0]), PixelFormat::Rgb8, Duration::ZERO);
        assert!(matches!(
            camera.configure(&settings(0, 4)),
            Err(SourceError::Configure { .. })
        ));
    }

    #[test]
    fn test_closed_camera_rejects_configure() {
        let mut camera = SyntheticCamera::new(canvas([0, 0, 0]), PixelFormat::Rgb8, Duration::ZERO);
        camera.close().unwrap();
        assert!(camera.configure(&settings(4, 4)).is_err());
    }

    #[test]
    fn test_encoded_formats_convert_back() {
        for format in [
            PixelFormat::Rgb8,
            PixelFormat::Bgr8,
            PixelFormat::Mono8,
            PixelFormat::Yuyv,
            PixelFormat::BayerRg8,
        ] {
            let mut camera = SyntheticCamera::new(canvas([255, 255, 255]), format, Duration::ZERO);
            camera.configure(&settings(8, 4)).unwrap();
            camera.start_grab().unwrap();
            let frame = camera.pull_frame(Duration::from_millis(10)).unwrap();
            assert_eq!(frame.data.len(), format.frame_len(8, 4), "{}", format);

            let image = StandardConverter.convert(&frame).unwrap().to_rgb8();
            let px = image.get_pixel(3, 2).0;
            assert!(px.iter().all(|&c| c >= 250), "{} decoded to {:?}", format, px);
        }
    }
}
