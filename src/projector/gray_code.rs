//! Gray code pattern set generation.
//!
//! Produces a projection-ready directory whose lexicographic file order is the
//! projection order, with the white and black references last.

use std::path::{Path, PathBuf};

use image::{GrayImage, Luma};

use crate::export::{ensure_dir, DiskSink, FrameSink, PngCompression, SaveError, SaveHint};

/// Direction of pattern stripes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternDirection {
    /// Stripes run horizontally, encode the Y coordinate.
    Horizontal,
    /// Stripes run vertically, encode the X coordinate.
    Vertical,
}

/// One frame of a Gray code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrayCodePattern {
    Stripes {
        /// Bit of the Gray code this pattern encodes, most significant first.
        bit_index: u32,
        direction: PatternDirection,
        inverted: bool,
    },
    White,
    Black,
}

/// Bit depth needed for a projector resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternConfig {
    pub projector_width: u32,
    pub projector_height: u32,
    /// Bits needed to address every column.
    pub horizontal_bits: u32,
    /// Bits needed to address every row.
    pub vertical_bits: u32,
}

impl PatternConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            projector_width: width,
            projector_height: height,
            horizontal_bits: bits_for(width),
            vertical_bits: bits_for(height),
        }
    }

    /// Total number of frames, stripe pairs plus the two references.
    pub fn total_patterns(&self) -> usize {
        ((self.horizontal_bits + self.vertical_bits) * 2 + 2) as usize
    }

    /// Projection order: horizontal stripes (Y), vertical stripes (X), each
    /// bit positive then inverted, then white, then black.
    pub fn pattern_sequence(&self) -> Vec<GrayCodePattern> {
        let mut patterns = Vec::with_capacity(self.total_patterns());

        for (direction, bits) in [
            (PatternDirection::Horizontal, self.vertical_bits),
            (PatternDirection::Vertical, self.horizontal_bits),
        ] {
            for bit_index in 0..bits {
                for inverted in [false, true] {
                    patterns.push(GrayCodePattern::Stripes {
                        bit_index,
                        direction,
                        inverted,
                    });
                }
            }
        }

        patterns.push(GrayCodePattern::White);
        patterns.push(GrayCodePattern::Black);
        patterns
    }
}

fn bits_for(extent: u32) -> u32 {
    if extent <= 1 {
        1
    } else {
        32 - (extent - 1).leading_zeros()
    }
}

/// Gray code pattern generator.
pub struct GrayCodeGenerator {
    config: PatternConfig,
}

impl GrayCodeGenerator {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            config: PatternConfig::new(width, height),
        }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    /// Convert binary value to Gray code.
    pub fn binary_to_gray(binary: u32) -> u32 {
        binary ^ (binary >> 1)
    }

    /// Convert Gray code back to binary.
    pub fn gray_to_binary(gray: u32) -> u32 {
        let mut binary = gray;
        let mut shift = 1;
        while shift < 32 {
            binary ^= binary >> shift;
            shift *= 2;
        }
        binary
    }

    /// Render one pattern at projector resolution.
    pub fn render(&self, pattern: &GrayCodePattern) -> GrayImage {
        let width = self.config.projector_width;
        let height = self.config.projector_height;

        match *pattern {
            GrayCodePattern::White => GrayImage::from_pixel(width, height, Luma([255])),
            GrayCodePattern::Black => GrayImage::from_pixel(width, height, Luma([0])),
            GrayCodePattern::Stripes {
                bit_index,
                direction,
                inverted,
            } => {
                let total_bits = match direction {
                    PatternDirection::Horizontal => self.config.vertical_bits,
                    PatternDirection::Vertical => self.config.horizontal_bits,
                };
                let bit_position = total_bits - 1 - bit_index;

                GrayImage::from_fn(width, height, |x, y| {
                    let coord = match direction {
                        PatternDirection::Horizontal => y,
                        PatternDirection::Vertical => x,
                    };
                    let bit = (Self::binary_to_gray(coord) >> bit_position) & 1 == 1;
                    if bit != inverted {
                        Luma([255])
                    } else {
                        Luma([0])
                    }
                })
            }
        }
    }

    /// Write the full set into `dir` as `000.png`, `001.png`, ...
    pub fn write_set(&self, dir: &Path) -> Result<Vec<PathBuf>, SaveError> {
        ensure_dir(dir).map_err(|source| SaveError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let sequence = self.config.pattern_sequence();
        let hint = SaveHint::Png {
            compression: PngCompression::Default,
        };
        let mut written = Vec::with_capacity(sequence.len());

        for (i, pattern) in sequence.iter().enumerate() {
            let path = dir.join(format!("{:03}.png", i));
            let image = image::DynamicImage::ImageLuma8(self.render(pattern));
            DiskSink.save(&path, &image, hint)?;
            log::debug!("Wrote {:?} to {}", pattern, path.display());
            written.push(path);
        }

        log::info!(
            "Wrote {} Gray code patterns ({}x{}) to {}",
            written.len(),
            self.config.projector_width,
            self.config.projector_height,
            dir.display()
        );
        Ok(written)
    }
}
