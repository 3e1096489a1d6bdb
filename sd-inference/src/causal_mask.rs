//! Attention mask policy for the text encoder.
//!
//! The text encoder always runs on a fixed-length padded sequence. By default
//! every position attends to every other position, pad positions included.
//! `Causal` restricts each position to itself and earlier positions, as a
//! standard CLIP text tower does.
//!
//! The mask contains:
//! - `0.0` for positions that can be attended to
//! - `-inf` for positions that are masked out
//!
//! # Example
//!
//! ```rust
//! use sd_inference::causal_mask::{attention_mask, MaskPolicy};
//!
//! assert!(attention_mask(MaskPolicy::Unmasked, 4).unwrap().is_none());
//!
//! let mask = attention_mask(MaskPolicy::Causal, 4).unwrap().unwrap();
//! assert_eq!(mask.shape(), &[4, 4]);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdError};
use crate::tensor::Tensor;

/// Which positions a query may attend to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskPolicy {
    /// Full attention over the padded sequence.
    #[default]
    Unmasked,
    /// Lower-triangular attention.
    Causal,
}

/// Build the additive mask for `seq_len` positions.
///
/// Returns `Ok(None)` for [`MaskPolicy::Unmasked`], so callers skip the add.
///
/// # Mask Layout
///
/// ```text
/// Position: 0    1    2
///        0  0.0  -inf -inf
///        1  0.0  0.0  -inf
///        2  0.0  0.0  0.0
/// ```
///
/// # Errors
///
/// Returns `InvalidConfig` if `seq_len == 0`.
pub fn attention_mask(policy: MaskPolicy, seq_len: usize) -> Result<Option<Tensor>> {
    if seq_len == 0 {
        return Err(SdError::InvalidConfig(
            "seq_len must be greater than 0".to_string(),
        ));
    }

    match policy {
        MaskPolicy::Unmasked => Ok(None),
        MaskPolicy::Causal => {
            let mut data = vec![0.0f32; seq_len * seq_len];
            for i in 0..seq_len {
                for j in (i + 1)..seq_len {
                    data[i * seq_len + j] = f32::NEG_INFINITY;
                }
            }
            Tensor::new(data, vec![seq_len, seq_len]).map(Some)
        }
    }
}
