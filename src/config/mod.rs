//! Configuration and serialization module.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::camera::{CameraSettings, PixelFormat};
use crate::export::PngCompression;

/// Errors raised while loading or validating a rig configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Rig configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Directory holding the pattern images to project.
    pub pattern_dir: PathBuf,
    /// Root directory for captured datasets.
    pub output_root: PathBuf,
    /// Cameras taking part in a capture, one acquirer each.
    pub cameras: Vec<CameraSlot>,
    /// Settings applied to every camera.
    pub camera: CameraSettings,
    /// Projector display selection.
    pub display: DisplayConfig,
    /// Cycle timing.
    pub timing: TimingConfig,
    /// Encoder settings for saved frames.
    pub output: OutputConfig,
    /// Synthetic rig settings (used when no hardware backend is selected).
    pub synthetic: SyntheticConfig,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            pattern_dir: PathBuf::from("graycode"),
            output_root: PathBuf::from("data"),
            cameras: vec![CameraSlot::new("left", 0), CameraSlot::new("right", 1)],
            camera: CameraSettings::default(),
            display: DisplayConfig::default(),
            timing: TimingConfig::default(),
            output: OutputConfig::default(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl RigConfig {
    /// Load a configuration file (JSON).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check internal consistency (camera names, quality ranges).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cameras.is_empty() {
            return Err(ConfigError::Invalid("at least one camera is required".into()));
        }
        for (i, slot) in self.cameras.iter().enumerate() {
            if slot.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("camera {} has an empty name", i)));
            }
            if !is_plain_dir_name(&slot.name) {
                return Err(ConfigError::Invalid(format!(
                    "camera name '{}' must be a plain directory name",
                    slot.name
                )));
            }
            if self.cameras[..i].iter().any(|other| other.name == slot.name) {
                return Err(ConfigError::Invalid(format!("duplicate camera name '{}'", slot.name)));
            }
            if self.cameras[..i].iter().any(|other| other.device_index == slot.device_index) {
                return Err(ConfigError::Invalid(format!(
                    "device {} is assigned to more than one camera",
                    slot.device_index
                )));
            }
        }
        if !(1..=100).contains(&self.output.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.output.jpeg_quality
            )));
        }
        if self.timing.poll_ms == 0 {
            return Err(ConfigError::Invalid("poll_ms must be greater than zero".into()));
        }
        Ok(())
    }
}

/// A single normal path component: no separators, no `.` or `..`.
fn is_plain_dir_name(name: &str) -> bool {
    if name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// One camera taking part in a capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSlot {
    /// Acquirer name, also the output sub-directory.
    pub name: String,
    /// Index into the enumerated device list.
    pub device_index: usize,
}

impl CameraSlot {
    pub fn new(name: &str, device_index: usize) -> Self {
        Self {
            name: name.to_string(),
            device_index,
        }
    }
}

/// Projector display selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Index of the display the patterns are projected on.
    pub index: usize,
    /// Displays exposed by the virtual display backend.
    pub virtual_displays: Vec<VirtualDisplay>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            index: 1,
            virtual_displays: vec![
                VirtualDisplay {
                    name: "Primary".to_string(),
                    width: 1920,
                    height: 1080,
                },
                VirtualDisplay {
                    name: "Projector".to_string(),
                    width: 1920,
                    height: 1080,
                },
            ],
        }
    }
}

/// A display simulated in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDisplay {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

/// Cycle timing, all values in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause after a pattern is captured before the next one is shown.
    pub settle_ms: u64,
    /// Delay between presenting a pattern and arming capture.
    pub pre_capture_ms: u64,
    /// Timeout for a single frame pull.
    pub frame_timeout_ms: u64,
    /// Maximum wait for all cameras to save a pattern. `None` waits forever.
    pub completion_timeout_ms: Option<u64>,
    /// Slice used when polling for cancellation and display signals.
    pub poll_ms: u64,
    /// Maximum wait for every camera to finish hardware setup.
    pub ready_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 10_000,
            pre_capture_ms: 0,
            frame_timeout_ms: 1_000,
            completion_timeout_ms: Some(60_000),
            poll_ms: 100,
            ready_timeout_ms: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn pre_capture(&self) -> Duration {
        Duration::from_millis(self.pre_capture_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Encoder settings for saved frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// JPEG quality for coded patterns (1-100).
    pub jpeg_quality: u8,
    /// PNG compression for reference frames.
    pub png_compression: PngCompression,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 90,
            png_compression: PngCompression::Fast,
        }
    }
}

/// Synthetic rig settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Number of loopback cameras to expose.
    pub device_count: usize,
    /// Raw format the loopback cameras emit.
    pub pixel_format: PixelFormat,
    /// Interval between frames.
    pub frame_interval_ms: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            device_count: 2,
            pixel_format: PixelFormat::BayerRg8,
            frame_interval_ms: 33,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_rig() {
        let config = RigConfig::default();
        assert_eq!(config.cameras.len(), 2);
        assert_eq!(config.cameras[0].name, "left");
        assert_eq!(config.cameras[1].name, "right");
        assert_eq!(config.camera.width, 1920);
        assert_eq!(config.camera.height, 1080);
        assert_eq!(config.timing.settle(), Duration::from_secs(10));
        assert_eq!(config.timing.frame_timeout(), Duration::from_secs(1));
        assert_eq!(config.output.jpeg_quality, 90);
        assert_eq!(config.display.index, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "output_root": "scans", "timing": { "settle_ms": 250 } }"#;
        let config: RigConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.output_root, PathBuf::from("scans"));
        assert_eq!(config.timing.settle_ms, 250);
        assert_eq!(config.timing.frame_timeout_ms, 1_000);
        assert_eq!(config.cameras.len(), 2);
    }

    #[test]
    fn test_null_completion_timeout_waits_forever() {
        let json = r#"{ "timing": { "completion_timeout_ms": null } }"#;
        let config: RigConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.timing.completion_timeout(), None);
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = RigConfig::default();
        config.cameras[1].name = "left".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_shared_device() {
        let mut config = RigConfig::default();
        config.cameras[1].device_index = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_path_in_name() {
        let mut config = RigConfig::default();
        config.cameras[0].name = "../left".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_dot_names() {
        for name in [".", "..", "a/b", "a\\b", ""] {
            let mut config = RigConfig::default();
            config.cameras[0].name = name.to_string();
            assert!(config.validate().is_err(), "accepted {:?}", name);
        }
        let mut config = RigConfig::default();
        config.cameras[0].name = "left.cam".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.json");
        let mut config = RigConfig::default();
        config.timing.settle_ms = 42;
        config.save(&path).unwrap();

        let loaded = RigConfig::load(&path).unwrap();
        assert_eq!(loaded.timing.settle_ms, 42);
        assert_eq!(loaded.cameras, config.cameras);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RigConfig::load(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
