//! On-disk layout of captured frames.

use std::path::{Path, PathBuf};

use crate::config::OutputConfig;
use crate::export::SaveHint;
use crate::projector::PatternKind;

/// How cycle indices map to files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactLayout {
    /// Projected sequence of `total` patterns, one directory per camera.
    Sequence { total: usize },
    /// Operator-triggered groups, every camera in one shared `stereo` directory.
    Stereo,
    /// Operator-triggered groups from a single camera.
    Single,
}

/// Destination of one saved frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    pub path: PathBuf,
    pub hint: SaveHint,
}

impl OutputArtifact {
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }
}

/// Relative path of pattern `index` in a sequence of `total` for camera `name`.
///
/// `{name}/white_ref.png` and `{name}/black_ref.png` for the last two,
/// `{name}/{index:02}.jpg` otherwise.
pub fn sequence_path(name: &str, index: usize, total: usize) -> PathBuf {
    let file = match PatternKind::classify(index, total) {
        PatternKind::WhiteReference => "white_ref.png".to_string(),
        PatternKind::BlackReference => "black_ref.png".to_string(),
        PatternKind::Coded(i) => format!("{:02}.jpg", i),
    };
    Path::new(name).join(file)
}

impl ArtifactLayout {
    /// Path relative to the output root.
    pub fn relative_path(&self, name: &str, index: usize) -> PathBuf {
        match *self {
            ArtifactLayout::Sequence { total } => sequence_path(name, index, total),
            ArtifactLayout::Stereo => Path::new("stereo").join(format!("{}{:02}.jpg", name, index)),
            ArtifactLayout::Single => {
                Path::new(&format!("{}single", name)).join(format!("{}{:02}.jpg", name, index))
            }
        }
    }

    /// Full artifact for camera `name` at cycle `index` under `root`.
    pub fn artifact(
        &self,
        root: &Path,
        name: &str,
        index: usize,
        output: &OutputConfig,
    ) -> OutputArtifact {
        let path = root.join(self.relative_path(name, index));
        let hint = match path.extension().and_then(|e| e.to_str()) {
            Some("png") => SaveHint::Png {
                compression: output.png_compression,
            },
            _ => SaveHint::Jpeg {
                quality: output.jpeg_quality,
            },
        };
        OutputArtifact { path, hint }
    }
}
