//! Layer normalization over the last dimension.
//!
//! # Algorithm
//!
//! ```text
//! LayerNorm(x) = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
//! ```
//!
//! `mean` and `var` are the population statistics of each row.

use crate::error::{Result, SdError};
use crate::tensor::Tensor;

/// Per-token normalization with learned scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// Scale, shape `[dim]`.
    weight: Tensor,
    /// Shift, shape `[dim]`.
    bias: Tensor,
    eps: f32,
}

impl LayerNorm {
    /// Create a LayerNorm from scale and shift.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if either parameter is not 1D or their lengths differ.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sd_inference::layer_norm::LayerNorm;
    /// use sd_inference::tensor::Tensor;
    ///
    /// let weight = Tensor::new(vec![1.0; 8], vec![8]).unwrap();
    /// let bias = Tensor::zeros(&[8]);
    /// let norm = LayerNorm::new(weight, bias, 1e-5).unwrap();
    /// ```
    pub fn new(weight: Tensor, bias: Tensor, eps: f32) -> Result<Self> {
        if weight.ndim() != 1 {
            return Err(SdError::ShapeMismatch {
                expected: vec![0], // Expect 1D
                got: weight.shape().to_vec(),
            });
        }
        if bias.shape() != weight.shape() {
            return Err(SdError::ShapeMismatch {
                expected: weight.shape().to_vec(),
                got: bias.shape().to_vec(),
            });
        }
        Ok(LayerNorm { weight, bias, eps })
    }

    /// Normalized width.
    pub fn dim(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Normalize every row of `x` (`[..., dim]`).
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the last dimension differs from the parameter length.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dim = self.dim();
        let last = x.shape().last().copied().unwrap_or(0);
        if last != dim {
            return Err(SdError::ShapeMismatch {
                expected: vec![dim],
                got: vec![last],
            });
        }

        let weight = self.weight.data();
        let bias = self.bias.data();
        let mut out = x.data().to_vec();

        for row in out.chunks_exact_mut(dim) {
            let mean = row.iter().sum::<f32>() / dim as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / dim as f32;
            let inv_std = 1.0 / (var + self.eps).sqrt();
            for ((v, w), b) in row.iter_mut().zip(weight).zip(bias) {
                *v = (*v - mean) * inv_std * w + b;
            }
        }

        Tensor::new(out, x.shape().to_vec())
    }
}
