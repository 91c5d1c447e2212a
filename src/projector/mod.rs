//! Projected pattern sequences.
//!
//! A [`PatternSequence`] is the ordered list of images shown on the projector.
//! The last two entries are always the white and black reference frames.

pub mod gray_code;

pub use gray_code::{GrayCodeGenerator, GrayCodePattern, PatternConfig, PatternDirection};

use std::path::{Path, PathBuf};

use image::DynamicImage;
use thiserror::Error;

/// File extensions accepted as patterns (compared lowercase).
pub const PATTERN_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Pattern loading error type.
#[derive(Error, Debug)]
pub enum PatternError {
    #[error("Pattern directory not found: {0}")]
    MissingDir(PathBuf),
    #[error("Failed to read pattern directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No pattern images (jpg, jpeg, png, bmp) in {0}")]
    Empty(PathBuf),
    #[error("Pattern sequence needs at least 2 images (white and black reference), found {found}")]
    TooShort { found: usize },
    #[error("Pattern {index} out of range ({total} patterns)")]
    OutOfRange { index: usize, total: usize },
    #[error("Cannot decode pattern {path}: {source}")]
    Undecodable {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Role of a pattern within its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Coded pattern with its position in the sequence.
    Coded(usize),
    WhiteReference,
    BlackReference,
}

impl PatternKind {
    /// Classify index `index` of a sequence of `total` patterns.
    pub fn classify(index: usize, total: usize) -> Self {
        if total >= 2 && index == total - 2 {
            PatternKind::WhiteReference
        } else if total >= 1 && index == total - 1 {
            PatternKind::BlackReference
        } else {
            PatternKind::Coded(index)
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternKind::Coded(i) => write!(f, "pattern {:02}", i),
            PatternKind::WhiteReference => write!(f, "white reference"),
            PatternKind::BlackReference => write!(f, "black reference"),
        }
    }
}

/// Ordered, immutable list of pattern images.
#[derive(Debug, Clone)]
pub struct PatternSequence {
    dir: PathBuf,
    paths: Vec<PathBuf>,
}

impl PatternSequence {
    /// Scan `dir` for pattern images, sorted by file name.
    ///
    /// Every image header is read up front so an undecodable file fails here
    /// rather than halfway through a capture.
    pub fn load(dir: &Path) -> Result<Self, PatternError> {
        if !dir.is_dir() {
            return Err(PatternError::MissingDir(dir.to_path_buf()));
        }

        let read_err = |source| PatternError::ReadDir {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            if path.is_file() && has_pattern_extension(&path) {
                paths.push(path);
            }
        }
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        Self::from_paths(dir, paths)
    }

    fn from_paths(dir: &Path, paths: Vec<PathBuf>) -> Result<Self, PatternError> {
        match paths.len() {
            0 => return Err(PatternError::Empty(dir.to_path_buf())),
            1 => return Err(PatternError::TooShort { found: 1 }),
            _ => {}
        }

        for path in &paths {
            image::image_dimensions(path).map_err(|source| PatternError::Undecodable {
                path: path.clone(),
                source,
            })?;
        }

        log::info!("Loaded {} patterns from {}", paths.len(), dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            paths,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn path(&self, index: usize) -> Option<&Path> {
        self.paths.get(index).map(PathBuf::as_path)
    }

    pub fn white_index(&self) -> usize {
        self.len() - 2
    }

    pub fn black_index(&self) -> usize {
        self.len() - 1
    }

    pub fn kind(&self, index: usize) -> PatternKind {
        PatternKind::classify(index, self.len())
    }

    /// Decode pattern `index`.
    pub fn load_image(&self, index: usize) -> Result<DynamicImage, PatternError> {
        let path = self.path(index).ok_or(PatternError::OutOfRange {
            index,
            total: self.len(),
        })?;
        image::open(path).map_err(|source| PatternError::Undecodable {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn has_pattern_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| PATTERN_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn write_png(dir: &Path, name: &str, value: u8) {
        GrayImage::from_pixel(4, 3, Luma([value]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_load_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "b.png", 10);
        write_png(dir.path(), "a.png", 20);
        write_png(dir.path(), "c.PNG", 30);
        std::fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();
        std::fs::create_dir(dir.path().join("sub.png")).unwrap();

        let seq = PatternSequence::load(dir.path()).unwrap();
        let names: Vec<_> = seq
            .paths()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.png", "b.png", "c.PNG"]);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(PatternKind::classify(0, 5), PatternKind::Coded(0));
        assert_eq!(PatternKind::classify(2, 5), PatternKind::Coded(2));
        assert_eq!(PatternKind::classify(3, 5), PatternKind::WhiteReference);
        assert_eq!(PatternKind::classify(4, 5), PatternKind::BlackReference);
        assert_eq!(PatternKind::classify(0, 2), PatternKind::WhiteReference);
        assert_eq!(PatternKind::classify(1, 2), PatternKind::BlackReference);
    }

    #[test]
    fn test_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = PatternSequence::load(&dir.path().join("graycode")).unwrap_err();
        assert!(matches!(err, PatternError::MissingDir(_)));
    }

    #[test]
    fn test_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("readme.md"), b"").unwrap();
        assert!(matches!(
            PatternSequence::load(dir.path()),
            Err(PatternError::Empty(_))
        ));
    }

    #[test]
    fn test_single_pattern_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "000.png", 0);
        assert!(matches!(
            PatternSequence::load(dir.path()),
            Err(PatternError::TooShort { found: 1 })
        ));
    }

    #[test]
    fn test_undecodable_pattern_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "000.png", 0);
        std::fs::write(dir.path().join("001.jpg"), b"not a jpeg").unwrap();
        assert!(matches!(
            PatternSequence::load(dir.path()),
            Err(PatternError::Undecodable { .. })
        ));
    }

    #[test]
    fn test_load_image_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "000.png", 0);
        write_png(dir.path(), "001.png", 255);
        let seq = PatternSequence::load(dir.path()).unwrap();
        assert_eq!(seq.load_image(1).unwrap().to_luma8().get_pixel(0, 0).0, [255]);
        assert!(matches!(
            seq.load_image(2),
            Err(PatternError::OutOfRange { index: 2, total: 2 })
        ));
    }
}
