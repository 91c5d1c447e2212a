//! Raw frame to image conversion.

use image::{DynamicImage, GrayImage, RgbImage};
use thiserror::Error;

use super::{PixelFormat, RawFrame};

/// Conversion error type.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConvertError {
    #[error("Empty frame ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("{format} frame needs {expected} bytes, got {actual}")]
    ShortBuffer {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
    #[error("{format} frames need an even width, got {width}")]
    OddWidth { format: PixelFormat, width: u32 },
}

/// Turns raw camera frames into savable images.
pub trait PixelConverter: Send + Sync {
    fn convert(&self, frame: &RawFrame) -> Result<DynamicImage, ConvertError>;
}

/// Converter for the common 8-bit formats.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardConverter;

impl PixelConverter for StandardConverter {
    fn convert(&self, frame: &RawFrame) -> Result<DynamicImage, ConvertError> {
        let (width, height) = (frame.width, frame.height);
        if width == 0 || height == 0 {
            return Err(ConvertError::Empty { width, height });
        }

        let expected = frame.format.frame_len(width, height);
        if frame.data.len() < expected {
            return Err(ConvertError::ShortBuffer {
                format: frame.format,
                expected,
                actual: frame.data.len(),
            });
        }
        let data = &frame.data[..expected];

        let image = match frame.format {
            PixelFormat::Mono8 => DynamicImage::ImageLuma8(gray_image(width, height, data.to_vec())),
            PixelFormat::Rgb8 => DynamicImage::ImageRgb8(rgb_image(width, height, data.to_vec())),
            PixelFormat::Bgr8 => {
                let mut rgb = data.to_vec();
                for px in rgb.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                DynamicImage::ImageRgb8(rgb_image(width, height, rgb))
            }
            PixelFormat::Yuyv => {
                if width % 2 != 0 {
                    return Err(ConvertError::OddWidth {
                        format: frame.format,
                        width,
                    });
                }
                DynamicImage::ImageRgb8(rgb_image(width, height, yuyv_to_rgb(data)))
            }
            PixelFormat::BayerRg8 => {
                DynamicImage::ImageRgb8(rgb_image(width, height, demosaic_rggb(data, width, height)))
            }
        };

        Ok(image)
    }
}

fn gray_image(width: u32, height: u32, data: Vec<u8>) -> GrayImage {
    // Length was checked against frame_len above.
    GrayImage::from_vec(width, height, data).unwrap_or_else(|| GrayImage::new(width, height))
}

fn rgb_image(width: u32, height: u32, data: Vec<u8>) -> RgbImage {
    RgbImage::from_vec(width, height, data).unwrap_or_else(|| RgbImage::new(width, height))
}

/// BT.601 studio-range YUV to RGB.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for quad in data.chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    rgb
}

/// Demosaic an RGGB mosaic by sharing each 2x2 cell between its four pixels.
fn demosaic_rggb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let at = |x: usize, y: usize| data[y * w + x] as u16;

    let mut rgb = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        let y0 = y & !1;
        let y1 = (y0 + 1).min(h - 1);
        for x in 0..w {
            let x0 = x & !1;
            let x1 = (x0 + 1).min(w - 1);

            let r = at(x0, y0);
            let g = (at(x1, y0) + at(x0, y1)) / 2;
            let b = at(x1, y1);
            rgb.extend_from_slice(&[r as u8, g as u8, b as u8]);
        }
    }
    rgb
}
