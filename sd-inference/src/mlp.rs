//! GELU feed-forward network of the text encoder blocks.
//!
//! # Algorithm
//!
//! ```text
//! MLP(x) = gelu(x @ fc1) @ fc2
//! ```
//!
//! `gelu` is the tanh approximation; `fc1` widens `[hidden, intermediate]`
//! and `fc2` narrows back `[intermediate, hidden]`.

use crate::attention::Linear;
use crate::error::{Result, SdError};
use crate::tensor::{gelu, Tensor};

/// Two-layer GELU MLP.
#[derive(Debug, Clone)]
pub struct Mlp {
    /// [hidden, intermediate]
    fc1: Linear,
    /// [intermediate, hidden]
    fc2: Linear,
}

impl Mlp {
    /// Create an MLP from its two weights.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if either weight is not 2D or `fc2` is not the
    /// transpose shape of `fc1`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sd_inference::mlp::Mlp;
    /// use sd_inference::tensor::Tensor;
    ///
    /// // 4 -> 8 -> 4
    /// let fc1 = Tensor::new(vec![0.1; 32], vec![4, 8]).unwrap();
    /// let fc2 = Tensor::new(vec![0.1; 32], vec![8, 4]).unwrap();
    /// let mlp = Mlp::new(fc1, fc2).unwrap();
    ///
    /// let x = Tensor::new(vec![1.0; 12], vec![3, 4]).unwrap();
    /// assert_eq!(mlp.forward(&x).unwrap().shape(), &[3, 4]);
    /// ```
    pub fn new(fc1: Tensor, fc2: Tensor) -> Result<Self> {
        let fc1 = Linear::new(fc1)?;
        let fc2 = Linear::new(fc2)?;

        if fc2.in_features() != fc1.out_features() || fc2.out_features() != fc1.in_features() {
            return Err(SdError::ShapeMismatch {
                expected: vec![fc1.out_features(), fc1.in_features()],
                got: fc2.weight.shape().to_vec(),
            });
        }

        Ok(Mlp { fc1, fc2 })
    }

    /// Intermediate width.
    pub fn intermediate_size(&self) -> usize {
        self.fc1.out_features()
    }

    /// Forward pass over `[rows, hidden]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(x)?.map(gelu);
        self.fc2.forward(&hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_forward_matches_manual() {
        // 2 -> 1 -> 2
        let fc1 = Tensor::new(vec![1.0, 1.0], vec![2, 1]).unwrap();
        let fc2 = Tensor::new(vec![2.0, -1.0], vec![1, 2]).unwrap();
        let mlp = Mlp::new(fc1, fc2).unwrap();

        let x = Tensor::new(vec![0.25, 0.75], vec![1, 2]).unwrap();
        let y = mlp.forward(&x).unwrap();
        let g = gelu(1.0);
        assert_abs_diff_eq!(y.data()[0], 2.0 * g, epsilon = 1e-6);
        assert_abs_diff_eq!(y.data()[1], -g, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_input_gives_zero() {
        let mlp = Mlp::new(Tensor::new(vec![0.3; 6], vec![2, 3]).unwrap(), Tensor::new(vec![0.7; 6], vec![3, 2]).unwrap())
            .unwrap();
        let y = mlp.forward(&Tensor::zeros(&[4, 2])).unwrap();
        assert!(y.data().iter().all(|&v| v == 0.0));
        assert_eq!(mlp.intermediate_size(), 3);
    }

    #[test]
    fn test_mismatched_weights() {
        let fc1 = Tensor::zeros(&[4, 8]);
        let fc2 = Tensor::zeros(&[4, 8]);
        assert!(matches!(Mlp::new(fc1, fc2), Err(SdError::ShapeMismatch { .. })));
    }
}
