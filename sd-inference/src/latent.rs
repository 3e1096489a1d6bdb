//! Channel-major activation maps for the convolutional stages.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Result, SdError};

/// A `[channels, height, width]` float map.
///
/// Layout is row-major: element `(c, y, x)` lives at `(c * height + y) * width + x`.
#[derive(Debug, Clone, PartialEq)]
pub struct Latent {
    /// Channel count.
    pub channels: usize,
    /// Rows.
    pub height: usize,
    /// Columns.
    pub width: usize,
    /// `channels * height * width` values.
    pub data: Vec<f32>,
}

impl Latent {
    /// Wrap existing data.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `data.len() != channels * height * width`.
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        let numel = channels * height * width;
        if data.len() != numel {
            return Err(SdError::ShapeMismatch {
                expected: vec![channels, height, width],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    /// Zero-filled map.
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
            data: vec![0.0; channels * height * width],
        }
    }

    /// Map filled with independent standard normal samples.
    pub fn randn<R: Rng + ?Sized>(
        channels: usize,
        height: usize,
        width: usize,
        rng: &mut R,
    ) -> Self {
        let data = (0..channels * height * width)
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        Self {
            channels,
            height,
            width,
            data,
        }
    }

    /// `[channels, height, width]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    /// Elements per channel plane.
    pub fn plane(&self) -> usize {
        self.height * self.width
    }

    /// Channel `c` as a flat plane.
    pub fn channel(&self, c: usize) -> &[f32] {
        let plane = self.plane();
        &self.data[c * plane..(c + 1) * plane]
    }

    /// Value at `(c, y, x)`.
    #[inline]
    pub fn at(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }

    /// Apply `f` to every element in place.
    pub fn map_inplace(&mut self, f: impl Fn(f32) -> f32) {
        for v in self.data.iter_mut() {
            *v = f(*v);
        }
    }

    /// Same-shape check used at stage boundaries.
    pub fn expect_shape(&self, other: &Latent) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(SdError::ShapeMismatch {
                expected: self.shape().to_vec(),
                got: other.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Element-wise sum of same-shaped maps.
    pub fn add(&self, other: &Latent) -> Result<Latent> {
        self.expect_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a + b)
            .collect();
        Ok(Latent {
            data,
            ..self.clone_shape()
        })
    }

    /// Add `other` element-wise over the shorter of the two buffers.
    ///
    /// Used for skip connections whose shapes may disagree.
    pub fn add_truncated(&mut self, other: &Latent) {
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }

    fn clone_shape(&self) -> Latent {
        Latent {
            channels: self.channels,
            height: self.height,
            width: self.width,
            data: Vec::new(),
        }
    }
}
