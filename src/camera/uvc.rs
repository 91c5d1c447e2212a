//! UVC camera backend using the nokhwa crate.
//!
//! nokhwa cameras are not `Send` on every platform, so the [`Camera`] is only
//! created in [`FrameSource::configure`], on the acquirer thread that owns it.

use std::time::{Duration, Instant};

use bytes::Bytes;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;

use super::{CameraProvider, CameraSettings, DeviceInfo, FrameSource, PixelFormat, RawFrame, SourceError, TriggerMode};

/// Provider for cameras reachable through the native UVC backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct UvcCameraProvider;

impl CameraProvider for UvcCameraProvider {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, SourceError> {
        let cameras = nokhwa::query(ApiBackend::Auto)
            .map_err(|e| SourceError::Device(format!("Failed to enumerate cameras: {:?}", e)))?;

        Ok(cameras
            .iter()
            .enumerate()
            .map(|(index, info)| DeviceInfo {
                index,
                name: info.human_name().to_string(),
                serial: None,
            })
            .collect())
    }

    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn FrameSource>, SourceError> {
        Ok(Box::new(UvcCamera {
            index: CameraIndex::Index(device.index as u32),
            label: device.label(),
            camera: None,
            frame_count: 0,
            grab_start: Instant::now(),
        }))
    }
}

struct UvcCamera {
    index: CameraIndex,
    label: String,
    camera: Option<Camera>,
    frame_count: u64,
    grab_start: Instant,
}

impl FrameSource for UvcCamera {
    fn configure(&mut self, settings: &CameraSettings) -> Result<(), SourceError> {
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::HighestResolution(
            Resolution::new(settings.width, settings.height),
        ));
        let camera = Camera::new(self.index.clone(), requested).map_err(|e| SourceError::Configure {
            param: "resolution",
            reason: format!("{:?}", e),
        })?;

        let resolution = camera.resolution();
        if resolution.width() != settings.width || resolution.height() != settings.height {
            log::warn!(
                "{}: requested {}x{}, camera delivers {}x{}",
                self.label,
                settings.width,
                settings.height,
                resolution.width(),
                resolution.height()
            );
        }
        if settings.trigger_mode != TriggerMode::Continuous {
            log::warn!("{}: only continuous acquisition is supported over UVC", self.label);
        }
        if settings.gamma.is_some() || settings.exposure_us.is_some() {
            log::debug!("{}: gamma/exposure left at device defaults", self.label);
        }

        self.camera = Some(camera);
        Ok(())
    }

    fn start_grab(&mut self) -> Result<(), SourceError> {
        let camera = self
            .camera
            .as_mut()
            .ok_or_else(|| SourceError::Grab("camera not configured".into()))?;
        camera
            .open_stream()
            .map_err(|e| SourceError::Grab(format!("Failed to open camera stream: {:?}", e)))?;
        self.grab_start = Instant::now();
        log::info!("{}: stream opened", self.label);
        Ok(())
    }

    // nokhwa blocks until the next frame arrives; the timeout is not enforced.
    fn pull_frame(&mut self, _timeout: Duration) -> Result<RawFrame, SourceError> {
        let camera = self
            .camera
            .as_mut()
            .ok_or_else(|| SourceError::Grab("camera not configured".into()))?;

        let buffer = camera
            .frame()
            .map_err(|e| SourceError::Device(format!("Failed to capture frame: {:?}", e)))?;
        let decoded = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| SourceError::Device(format!("Failed to decode frame: {:?}", e)))?;

        let frame_number = self.frame_count;
        self.frame_count += 1;

        Ok(RawFrame {
            width: buffer.resolution().width(),
            height: buffer.resolution().height(),
            format: PixelFormat::Rgb8,
            data: Bytes::from(decoded.into_raw()),
            frame_number,
            timestamp: self.grab_start.elapsed(),
        })
    }

    fn stop_grab(&mut self) -> Result<(), SourceError> {
        if let Some(camera) = self.camera.as_mut() {
            if camera.is_stream_open() {
                camera
                    .stop_stream()
                    .map_err(|e| SourceError::Grab(format!("Failed to stop stream: {:?}", e)))?;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        self.camera = None;
        Ok(())
    }
}
