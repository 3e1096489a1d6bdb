//! Token and position embeddings of the text encoder.
//!
//! `x[p] = token_embedding[ids[p]] + position_embedding[p]`, producing a
//! `[seq_len, hidden]` tensor.

use crate::error::{Result, SdError};
use crate::tensor::Tensor;

/// Token table plus learned absolute position table.
///
/// # Example
///
/// ```rust
/// use sd_inference::embedding::TextEmbeddings;
/// use sd_inference::tensor::Tensor;
///
/// let token = Tensor::new((0..40).map(|x| x as f32).collect(), vec![10, 4]).unwrap();
/// let position = Tensor::new(vec![0.5; 12], vec![3, 4]).unwrap();
/// let emb = TextEmbeddings::new(token, position).unwrap();
///
/// let x = emb.forward(&[2, 0, 1]).unwrap();
/// assert_eq!(x.shape(), &[3, 4]);
/// assert_eq!(x.data()[0], 8.5);
/// ```
#[derive(Debug, Clone)]
pub struct TextEmbeddings {
    token: Tensor,
    position: Tensor,
}

impl TextEmbeddings {
    /// Bind the two tables.
    ///
    /// # Arguments
    ///
    /// * `token` - `[vocab_size, hidden]`
    /// * `position` - `[max_position, hidden]`
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if either table is not 2D or their widths differ.
    pub fn new(token: Tensor, position: Tensor) -> Result<Self> {
        let (_, hidden) = token.dims2()?;
        let (_, pos_hidden) = position.dims2()?;
        if pos_hidden != hidden {
            return Err(SdError::ShapeMismatch {
                expected: vec![position.shape()[0], hidden],
                got: position.shape().to_vec(),
            });
        }
        Ok(Self { token, position })
    }

    /// Embedding width.
    pub fn hidden_size(&self) -> usize {
        self.token.shape()[1]
    }

    /// Rows of the token table.
    pub fn vocab_size(&self) -> usize {
        self.token.shape()[0]
    }

    /// Rows of the position table.
    pub fn max_position(&self) -> usize {
        self.position.shape()[0]
    }

    /// Embed a token sequence.
    ///
    /// Ids outside the token table read row 0.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the sequence is longer than the position table.
    pub fn forward(&self, ids: &[u32]) -> Result<Tensor> {
        if ids.len() > self.max_position() {
            return Err(SdError::ShapeMismatch {
                expected: vec![self.max_position()],
                got: vec![ids.len()],
            });
        }

        let hidden = self.hidden_size();
        let vocab = self.vocab_size();
        let mut out = Vec::with_capacity(ids.len() * hidden);

        for (p, &id) in ids.iter().enumerate() {
            let row = if (id as usize) < vocab { id as usize } else { 0 };
            let tok = self.token.row(row)?;
            let pos = self.position.row(p)?;
            out.extend(tok.iter().zip(pos).map(|(a, b)| a + b));
        }

        Tensor::new(out, vec![ids.len(), hidden])
    }
}
