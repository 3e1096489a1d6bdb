//! RGBA output image.

use std::path::Path;

use crate::error::{Result, SdError};
use crate::latent::Latent;

/// Decoded picture: `width * height` RGBA pixels, alpha always 255.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Image {
    width: usize,
    height: usize,
    rgba: Vec<u8>,
}

impl Image {
    /// Wrap an RGBA buffer.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `rgba.len() != width * height * 4`.
    pub fn new(width: usize, height: usize, rgba: Vec<u8>) -> Result<Self> {
        if rgba.len() != width * height * 4 {
            return Err(SdError::ShapeMismatch {
                expected: vec![height, width, 4],
                got: vec![rgba.len()],
            });
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    /// The 0×0 image returned in place of a failed generation.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Convert a `[3, H, W]` map with values in `[-1, 1]` to bytes.
    ///
    /// Each value maps to `round((v * 0.5 + 0.5) * 255)`, clamped to `0..=255`.
    pub fn from_rgb_planes(rgb: &Latent) -> Result<Self> {
        if rgb.channels != 3 {
            return Err(SdError::ShapeMismatch {
                expected: vec![3, rgb.height, rgb.width],
                got: rgb.shape().to_vec(),
            });
        }
        let plane = rgb.plane();
        let mut rgba = Vec::with_capacity(plane * 4);
        for p in 0..plane {
            for c in 0..3 {
                rgba.push(to_byte(rgb.data[c * plane + p]));
            }
            rgba.push(255);
        }
        Self::new(rgb.width, rgb.height, rgba)
    }

    /// Pixel columns.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Pixel rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Row-major RGBA bytes.
    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }

    /// Consume into the RGBA buffer.
    pub fn into_rgba(self) -> Vec<u8> {
        self.rgba
    }

    /// Whether this is the empty result.
    pub fn is_empty(&self) -> bool {
        self.rgba.is_empty()
    }

    /// RGBA at `(x, y)`.
    pub fn pixel(&self, x: usize, y: usize) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y * self.width + x) * 4;
        Some([self.rgba[i], self.rgba[i + 1], self.rgba[i + 2], self.rgba[i + 3]])
    }

    /// Write as PNG.
    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.is_empty() {
            return Err(SdError::Image("cannot save an empty image".into()));
        }
        let width = u32::try_from(self.width).map_err(|e| SdError::Image(e.to_string()))?;
        let height = u32::try_from(self.height).map_err(|e| SdError::Image(e.to_string()))?;
        let buffer = ::image::RgbaImage::from_raw(width, height, self.rgba.clone())
            .ok_or_else(|| SdError::Image("buffer does not match dimensions".into()))?;
        buffer
            .save_with_format(path.as_ref(), ::image::ImageFormat::Png)
            .map_err(|e| SdError::Image(e.to_string()))
    }
}

fn to_byte(v: f32) -> u8 {
    ((v * 0.5 + 0.5) * 255.0).round().clamp(0.0, 255.0) as u8
}
