//! Single-head self-attention for the text encoder.
//!
//! The text tower projects with full-width square matrices and attends with one
//! head of width `hidden_size`:
//!
//! ```text
//! Attn(x) = softmax((xWq)(xWk)^T / sqrt(D) + mask) (xWv) Wo
//! ```

use crate::error::{Result, SdError};
use crate::tensor::Tensor;

/// Bias-free linear projection.
///
/// Computes `x @ weight` with the weight stored `[in_features, out_features]`,
/// the layout the blob exporter writes.
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weight matrix [in_features, out_features]
    pub(crate) weight: Tensor,
}

impl Linear {
    /// Create a linear layer from a weight tensor.
    ///
    /// # Errors
    ///
    /// Returns error if weight is not a 2D tensor.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sd_inference::attention::Linear;
    /// use sd_inference::tensor::Tensor;
    ///
    /// // Linear layer: 4 inputs -> 8 outputs
    /// let weight = Tensor::new(vec![0.0; 32], vec![4, 8]).unwrap();
    /// let linear = Linear::new(weight).unwrap();
    /// assert_eq!(linear.out_features(), 8);
    /// ```
    pub fn new(weight: Tensor) -> Result<Self> {
        weight.dims2()?;
        Ok(Linear { weight })
    }

    /// Input width.
    pub fn in_features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Output width.
    pub fn out_features(&self) -> usize {
        self.weight.shape()[1]
    }

    /// Project `[rows, in_features] -> [rows, out_features]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `x` is not 2D or its width differs from `in_features`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.matmul(&self.weight)
    }
}

/// Self-attention block with four square projections.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    hidden_size: usize,
}

impl SelfAttention {
    /// Bind the projections.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` unless all four weights are `[D, D]` for the same `D`.
    pub fn new(q_proj: Linear, k_proj: Linear, v_proj: Linear, out_proj: Linear) -> Result<Self> {
        let hidden_size = q_proj.in_features();
        let square = [hidden_size, hidden_size];
        for proj in [&q_proj, &k_proj, &v_proj, &out_proj] {
            if proj.weight.shape() != square {
                return Err(SdError::ShapeMismatch {
                    expected: square.to_vec(),
                    got: proj.weight.shape().to_vec(),
                });
            }
        }
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            hidden_size,
        })
    }

    /// Width `D`.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Attend over a `[seq_len, D]` sequence.
    ///
    /// `mask`, when given, is `[seq_len, seq_len]` and added to the scores
    /// before softmax.
    ///
    /// # Process
    ///
    /// 1. Project to Q, K, V
    /// 2. Scores: `Q @ K^T / sqrt(D)`
    /// 3. Apply mask and softmax over keys
    /// 4. Weighted sum of V, then output projection
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        let scale = 1.0 / (self.hidden_size as f32).sqrt();
        let scores = q.matmul(&k.transpose()?)?.mul_scalar(scale);

        let scores = match mask {
            Some(mask) => scores.add(mask)?,
            None => scores,
        };

        let weights = scores.softmax_last_dim()?;
        let context = weights.matmul(&v)?;
        self.out_proj.forward(&context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::causal_mask::{attention_mask, MaskPolicy};
    use approx::assert_abs_diff_eq;

    fn identity(d: usize) -> Tensor {
        let mut data = vec![0.0; d * d];
        for i in 0..d {
            data[i * d + i] = 1.0;
        }
        Tensor::new(data, vec![d, d]).unwrap()
    }

    fn identity_attention(d: usize) -> SelfAttention {
        SelfAttention::new(
            Linear::new(identity(d)).unwrap(),
            Linear::new(identity(d)).unwrap(),
            Linear::new(identity(d)).unwrap(),
            Linear::new(identity(d)).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_linear_uses_in_out_layout() {
        // [1, 2] @ [[1, 0, 2], [0, 1, 3]] = [1, 2, 8]
        let w = Tensor::new(vec![1.0, 0.0, 2.0, 0.0, 1.0, 3.0], vec![2, 3]).unwrap();
        let linear = Linear::new(w).unwrap();
        let y = linear.forward(&Tensor::new(vec![1.0, 2.0], vec![1, 2]).unwrap()).unwrap();
        assert_eq!(y.data(), &[1.0, 2.0, 8.0]);
    }

    #[test]
    fn test_linear_rejects_non_2d() {
        assert!(Linear::new(Tensor::zeros(&[4])).is_err());
    }

    #[test]
    fn test_identical_tokens_attend_uniformly() {
        let attn = identity_attention(2);
        let x = Tensor::new(vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0], vec![3, 2]).unwrap();
        let y = attn.forward(&x, None).unwrap();
        assert_eq!(y.shape(), &[3, 2]);
        for row in y.data().chunks(2) {
            assert_abs_diff_eq!(row[0], 1.0, epsilon = 1e-5);
            assert_abs_diff_eq!(row[1], 2.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_unmasked_first_position_sees_future() {
        let attn = identity_attention(1);
        let x = Tensor::new(vec![0.0, 10.0], vec![2, 1]).unwrap();
        let y = attn.forward(&x, None).unwrap();
        // Position 0 has zero query, so weights are uniform: mean of V = 5
        assert_abs_diff_eq!(y.data()[0], 5.0, epsilon = 1e-4);
    }

    #[test]
    fn test_causal_first_position_sees_only_itself() {
        let attn = identity_attention(1);
        let x = Tensor::new(vec![0.0, 10.0], vec![2, 1]).unwrap();
        let mask = attention_mask(MaskPolicy::Causal, 2).unwrap();
        let y = attn.forward(&x, mask.as_ref()).unwrap();
        assert_abs_diff_eq!(y.data()[0], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_non_square_projection_rejected() {
        let result = SelfAttention::new(
            Linear::new(identity(2)).unwrap(),
            Linear::new(identity(2)).unwrap(),
            Linear::new(Tensor::zeros(&[2, 3])).unwrap(),
            Linear::new(identity(2)).unwrap(),
        );
        assert!(matches!(result, Err(SdError::ShapeMismatch { .. })));
    }
}
