//! Transformer encoder block of the text tower.
//!
//! # Architecture (Pre-norm)
//!
//! ```text
//! h = x + attention(layer_norm1(x))
//! out = h + mlp(layer_norm2(h))
//! ```

use crate::attention::{Linear, SelfAttention};
use crate::error::Result;
use crate::layer_norm::LayerNorm;
use crate::loader::WeightStore;
use crate::mlp::Mlp;
use crate::tensor::Tensor;

/// One pre-norm encoder block.
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    self_attn: SelfAttention,
    mlp: Mlp,
    /// LayerNorm before self-attention
    layer_norm1: LayerNorm,
    /// LayerNorm before MLP
    layer_norm2: LayerNorm,
}

impl EncoderLayer {
    /// Assemble a block from its parts.
    pub fn new(
        self_attn: SelfAttention,
        mlp: Mlp,
        layer_norm1: LayerNorm,
        layer_norm2: LayerNorm,
    ) -> Self {
        EncoderLayer {
            self_attn,
            mlp,
            layer_norm1,
            layer_norm2,
        }
    }

    /// Load block `prefix` (e.g. `text_model.encoder.layers.3`) from a weight store.
    ///
    /// Expected tensors under the prefix:
    /// - `layernorm1.{weight,bias}`, `layernorm2.{weight,bias}`: `[D]`
    /// - `self_attn.{q,k,v,out}_proj.weight`: `[D, D]`
    /// - `mlp.fc1.weight`: `[D, M]`, `mlp.fc2.weight`: `[M, D]`
    ///
    /// # Errors
    ///
    /// Returns `MissingTensor` for an absent tensor, `ShapeMismatch` if any
    /// shape disagrees with `hidden_size`.
    pub fn load(weights: &WeightStore, prefix: &str, hidden_size: usize, eps: f32) -> Result<Self> {
        let vec_param = |name: &str| -> Result<Tensor> {
            Ok(weights
                .require_shape(&format!("{}.{}", prefix, name), &[hidden_size])?
                .clone())
        };
        let square = |name: &str| -> Result<Linear> {
            let w = weights.require_shape(
                &format!("{}.self_attn.{}.weight", prefix, name),
                &[hidden_size, hidden_size],
            )?;
            Linear::new(w.clone())
        };

        let layer_norm1 = LayerNorm::new(vec_param("layernorm1.weight")?, vec_param("layernorm1.bias")?, eps)?;
        let layer_norm2 = LayerNorm::new(vec_param("layernorm2.weight")?, vec_param("layernorm2.bias")?, eps)?;

        let self_attn = SelfAttention::new(
            square("q_proj")?,
            square("k_proj")?,
            square("v_proj")?,
            square("out_proj")?,
        )?;

        let fc1 = weights.require(&format!("{}.mlp.fc1.weight", prefix))?.clone();
        let fc2 = weights.require(&format!("{}.mlp.fc2.weight", prefix))?.clone();
        let (fc1_in, _) = fc1.dims2()?;
        if fc1_in != hidden_size {
            return Err(crate::error::SdError::ShapeMismatch {
                expected: vec![hidden_size, fc1.shape()[1]],
                got: fc1.shape().to_vec(),
            });
        }
        let mlp = Mlp::new(fc1, fc2)?;

        Ok(Self::new(self_attn, mlp, layer_norm1, layer_norm2))
    }

    /// Forward pass over `[seq_len, D]`, same shape out.
    ///
    /// # Algorithm (Pre-norm)
    ///
    /// 1. `h = x + self_attn(layer_norm1(x), mask)`
    /// 2. `out = h + mlp(layer_norm2(h))`
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let x_norm = self.layer_norm1.forward(x)?;
        let attn_out = self.self_attn.forward(&x_norm, mask)?;
        let h = x.add(&attn_out)?;

        let h_norm = self.layer_norm2.forward(&h)?;
        let mlp_out = self.mlp.forward(&h_norm)?;
        h.add(&mlp_out)
    }
}
