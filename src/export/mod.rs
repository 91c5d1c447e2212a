//! Export module for captured frames.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// PNG compression effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PngCompression {
    #[default]
    Fast,
    Default,
    Best,
}

impl From<PngCompression> for CompressionType {
    fn from(value: PngCompression) -> Self {
        match value {
            PngCompression::Fast => CompressionType::Fast,
            PngCompression::Default => CompressionType::Default,
            PngCompression::Best => CompressionType::Best,
        }
    }
}

/// Format-specific encoder hint for a saved frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveHint {
    Jpeg { quality: u8 },
    Png { compression: PngCompression },
}

/// Errors raised while persisting a frame.
#[derive(Error, Debug)]
pub enum SaveError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Persists captured frames.
pub trait FrameSink: Send + Sync {
    /// Write `image` to `path`. Returns only once the data is durable.
    fn save(&self, path: &Path, image: &DynamicImage, hint: SaveHint) -> Result<(), SaveError>;
}

/// Sink that encodes frames to local files.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskSink;

impl FrameSink for DiskSink {
    fn save(&self, path: &Path, image: &DynamicImage, hint: SaveHint) -> Result<(), SaveError> {
        let io_err = |source| SaveError::Io {
            path: path.to_path_buf(),
            source,
        };
        let encode_err = |source| SaveError::Encode {
            path: path.to_path_buf(),
            source,
        };

        let file = File::create(path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);

        match hint {
            SaveHint::Jpeg { quality } => {
                let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
                // JPEG has no alpha channel.
                match image {
                    DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => {
                        image.write_with_encoder(encoder).map_err(encode_err)?
                    }
                    other => DynamicImage::ImageRgb8(other.to_rgb8())
                        .write_with_encoder(encoder)
                        .map_err(encode_err)?,
                }
            }
            SaveHint::Png { compression } => {
                let encoder =
                    PngEncoder::new_with_quality(&mut writer, compression.into(), FilterType::Adaptive);
                image.write_with_encoder(encoder).map_err(encode_err)?;
            }
        }

        writer.flush().map_err(io_err)?;
        let file = writer.into_inner().map_err(|e| io_err(e.into_error()))?;
        file.sync_all().map_err(io_err)?;
        Ok(())
    }
}

/// Create `dir` and any missing parents. An existing directory is not an error,
/// including one created concurrently by another acquirer.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    match std::fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

    #[test]
    fn test_jpeg_written_and_decodable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00.jpg");
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 8, Rgb([200, 10, 10])));

        DiskSink.save(&path, &img, SaveHint::Jpeg { quality: 90 }).unwrap();

        let loaded = image::open(&path).unwrap();
        assert_eq!((loaded.width(), loaded.height()), (16, 8));
        assert_eq!(image::ImageFormat::from_path(&path).unwrap(), image::ImageFormat::Jpeg);
    }

    #[test]
    fn test_png_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("white_ref.png");
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, Luma([123])));

        DiskSink
            .save(&path, &img, SaveHint::Png { compression: PngCompression::Fast })
            .unwrap();

        let loaded = image::open(&path).unwrap().to_luma8();
        assert_eq!(loaded.get_pixel(2, 2).0, [123]);
    }

    #[test]
    fn test_jpeg_drops_alpha() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.jpg");
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 4])));
        assert!(DiskSink.save(&path, &img, SaveHint::Jpeg { quality: 90 }).is_ok());
    }

    #[test]
    fn test_missing_parent_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("00.jpg");
        let img = DynamicImage::ImageLuma8(GrayImage::new(2, 2));
        let err = DiskSink.save(&path, &img, SaveHint::Jpeg { quality: 90 }).unwrap_err();
        assert!(matches!(err, SaveError::Io { .. }));
    }

    #[test]
    fn test_ensure_dir_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data").join("left");

        ensure_dir(&target).unwrap();
        ensure_dir(&target).unwrap();
        assert!(target.is_dir());

        let entries = std::fs::read_dir(dir.path().join("data")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_ensure_dir_concurrent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        let handles: Vec<_> = ["left", "right", "left", "right"]
            .iter()
            .map(|name| {
                let target = root.join(name);
                std::thread::spawn(move || ensure_dir(&target))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert!(root.join("left").is_dir());
        assert!(root.join("right").is_dir());
    }

    #[test]
    fn test_ensure_dir_over_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data");
        std::fs::write(&file, b"x").unwrap();
        assert!(ensure_dir(&file).is_err());
    }
}
