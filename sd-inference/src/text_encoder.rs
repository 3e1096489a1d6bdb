//! CLIP-style text encoder: prompt in, pooled conditioning vector out.
//!
//! # Architecture
//!
//! ```text
//! prompt
//!   ↓ Tokenizer (BPE, padded to 77)
//! ids [77]
//!   ↓ token_embedding + position_embedding
//! x [77, D]
//!   ↓ layers[0..N]: EncoderLayer
//! x [77, D]
//!   ↓ mean over positions
//! conditioning [D]
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use sd_inference::config::TextEncoderConfig;
//! use sd_inference::text_encoder::TextEncoder;
//!
//! let encoder = TextEncoder::load("models/sd", &TextEncoderConfig::default())?;
//! let cond = encoder.encode("a lighthouse at dusk")?;
//! assert_eq!(cond.len(), encoder.hidden_size());
//! # Ok::<(), sd_inference::error::SdError>(())
//! ```

use std::path::Path;

use tracing::{debug, info};

use crate::causal_mask::{attention_mask, MaskPolicy};
use crate::config::TextEncoderConfig;
use crate::embedding::TextEmbeddings;
use crate::error::{Result, SdError};
use crate::loader::WeightStore;
use crate::tensor::Tensor;
use crate::tokenizer::Tokenizer;
use crate::transformer::EncoderLayer;

/// Weight blob file name inside a model directory.
pub const WEIGHTS_FILE: &str = "clip_weights.bin";

const TOKEN_EMBEDDING: &str = "text_model.embeddings.token_embedding.weight";
const POSITION_EMBEDDING: &str = "text_model.embeddings.position_embedding.weight";

/// Tokenizer, embeddings and encoder stack.
#[derive(Debug, Clone)]
pub struct TextEncoder {
    tokenizer: Tokenizer,
    embeddings: TextEmbeddings,
    layers: Vec<EncoderLayer>,
    mask: Option<Tensor>,
    seq_len: usize,
}

impl TextEncoder {
    /// Load `clip_weights.bin`, `vocab.txt` and `merges.txt` from `model_dir`.
    ///
    /// # Errors
    ///
    /// Fails on any I/O or format fault in the blob, a missing tokenizer file,
    /// or any missing or wrong-shaped tensor.
    pub fn load(model_dir: impl AsRef<Path>, config: &TextEncoderConfig) -> Result<Self> {
        let dir = model_dir.as_ref();
        let weights = WeightStore::open(dir.join(WEIGHTS_FILE))?;
        let tokenizer = Tokenizer::from_model_dir(dir)?;
        Self::from_weights(&weights, tokenizer, config)
    }

    /// Build from an already-open weight store.
    pub fn from_weights(
        weights: &WeightStore,
        tokenizer: Tokenizer,
        config: &TextEncoderConfig,
    ) -> Result<Self> {
        let token = weights.require(TOKEN_EMBEDDING)?.clone();
        let position = weights.require(POSITION_EMBEDDING)?.clone();
        let seq_len = config.max_position;
        if position.shape().first().copied().unwrap_or(0) < seq_len {
            return Err(SdError::ShapeMismatch {
                expected: vec![seq_len, position.shape().get(1).copied().unwrap_or(0)],
                got: position.shape().to_vec(),
            });
        }
        let embeddings = TextEmbeddings::new(token, position)?;
        let hidden = embeddings.hidden_size();

        let mut layers = Vec::with_capacity(config.num_layers);
        for layer_idx in 0..config.num_layers {
            let prefix = format!("text_model.encoder.layers.{}", layer_idx);
            layers.push(EncoderLayer::load(weights, &prefix, hidden, config.layer_norm_eps)?);
        }

        let mask = attention_mask(config.attention_mask, seq_len)?;

        info!(
            vocab = embeddings.vocab_size(),
            hidden,
            layers = layers.len(),
            causal = config.attention_mask == MaskPolicy::Causal,
            "text encoder ready"
        );

        Ok(Self {
            tokenizer,
            embeddings,
            layers,
            mask,
            seq_len,
        })
    }

    /// Width of the conditioning vector.
    pub fn hidden_size(&self) -> usize {
        self.embeddings.hidden_size()
    }

    /// Number of encoder blocks.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// The tokenizer bound at load.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Tokenize and encode a prompt.
    pub fn encode(&self, prompt: &str) -> Result<Vec<f32>> {
        let ids = self.tokenizer.encode_with_len(prompt, self.seq_len);
        debug!(prompt, tokens = ids.len(), "encoding prompt");
        self.encode_ids(&ids)
    }

    /// Encode a fixed-length id sequence into the pooled vector.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `ids.len()` is not the configured sequence length.
    pub fn encode_ids(&self, ids: &[u32]) -> Result<Vec<f32>> {
        self.hidden_states(ids)?.mean_rows()
    }

    /// Per-position outputs of the last block, `[seq_len, D]`.
    pub fn hidden_states(&self, ids: &[u32]) -> Result<Tensor> {
        if ids.len() != self.seq_len {
            return Err(SdError::ShapeMismatch {
                expected: vec![self.seq_len],
                got: vec![ids.len()],
            });
        }

        let mut x = self.embeddings.forward(ids)?;
        for layer in &self.layers {
            x = layer.forward(&x, self.mask.as_ref())?;
        }
        Ok(x)
    }
}
