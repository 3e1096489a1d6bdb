//! Convolutional noise predictor.
//!
//! Three stages of plain `conv → tanh` blocks:
//!
//! ```text
//! latent ──down[0]──┬─pool──down[1]──┬─pool── … ──mid── … ─┬─up[n-2]─…─┬─up[n-1]──▶ eps
//!                  skip0            skip1                  + skip1      + skip0
//! ```
//!
//! Every down block's output is kept as a skip and then average-pooled 2×.
//! Before each up block the running map is resized (nearest) to its skip's
//! size and the skip is added element-wise over the shorter buffer.
//!
//! The conditioning vector and timestep fraction are accepted but do not
//! enter the convolution path.

use std::path::Path;

use tracing::{info, trace};

use crate::conv::{avg_pool2x, upsample_nearest, Conv2d};
use crate::error::{Result, SdError};
use crate::latent::Latent;
use crate::loader::WeightStore;

/// Weight blob file name inside a model directory.
pub const WEIGHTS_FILE: &str = "unet_weights.bin";

/// Down, mid and up block stacks.
#[derive(Debug, Clone)]
pub struct NoisePredictor {
    down: Vec<Conv2d>,
    mid: Vec<Conv2d>,
    up: Vec<Conv2d>,
}

impl NoisePredictor {
    /// Load `unet_weights.bin` from `model_dir`.
    pub fn load(model_dir: impl AsRef<Path>) -> Result<Self> {
        let weights = WeightStore::open(model_dir.as_ref().join(WEIGHTS_FILE))?;
        Self::from_weights(&weights)
    }

    /// Discover `down_blocks.{i}`, `mid_blocks.{i}` and `up_blocks.{i}` convs.
    ///
    /// Indices are read from 0 until the first missing `conv.weight`. Biases
    /// are optional.
    ///
    /// # Errors
    ///
    /// Returns `MissingTensor` if a stage has no blocks, `Model` if the down
    /// and up stages differ in length, and `ShapeMismatch` if the last up
    /// block does not return to the first down block's channel count.
    pub fn from_weights(weights: &WeightStore) -> Result<Self> {
        let down = load_stage(weights, "down_blocks")?;
        let mid = load_stage(weights, "mid_blocks")?;
        let up = load_stage(weights, "up_blocks")?;

        if down.len() != up.len() {
            return Err(SdError::Model(format!(
                "unet has {} down blocks but {} up blocks",
                down.len(),
                up.len()
            )));
        }

        let in_channels = down[0].in_channels();
        let out_channels = up[up.len() - 1].out_channels();
        if in_channels != out_channels {
            return Err(SdError::ShapeMismatch {
                expected: vec![in_channels],
                got: vec![out_channels],
            });
        }

        info!(
            down = down.len(),
            mid = mid.len(),
            up = up.len(),
            channels = in_channels,
            "noise predictor ready"
        );

        Ok(Self { down, mid, up })
    }

    /// Latent channel count the network consumes and produces.
    pub fn latent_channels(&self) -> usize {
        self.down[0].in_channels()
    }

    /// Predict the noise in `x`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if a block's channels disagree with its input
    /// or the prediction's shape differs from `x`.
    pub fn forward(&self, x: &Latent, conditioning: &[f32], t: f32) -> Result<Latent> {
        trace!(cond_dim = conditioning.len(), t, "unet forward");

        let mut h = x.clone();
        let mut skips = Vec::with_capacity(self.down.len());

        for block in &self.down {
            h = conv_tanh(block, &h)?;
            skips.push(h.clone());
            h = avg_pool2x(&h);
        }

        for block in &self.mid {
            h = conv_tanh(block, &h)?;
        }

        for block in &self.up {
            let skip = skips
                .pop()
                .ok_or_else(|| SdError::Model("unet skip stack exhausted".into()))?;
            if (h.height, h.width) != (skip.height, skip.width) {
                h = upsample_nearest(&h, skip.height, skip.width);
            }
            h.add_truncated(&skip);
            h = conv_tanh(block, &h)?;
        }

        x.expect_shape(&h)?;
        Ok(h)
    }
}

fn conv_tanh(block: &Conv2d, x: &Latent) -> Result<Latent> {
    let mut y = block.forward(x)?;
    y.map_inplace(f32::tanh);
    Ok(y)
}

fn load_stage(weights: &WeightStore, stage: &str) -> Result<Vec<Conv2d>> {
    let mut blocks = Vec::new();
    loop {
        let prefix = format!("{}.{}.conv", stage, blocks.len());
        if !weights.contains(&format!("{}.weight", prefix)) {
            break;
        }
        blocks.push(Conv2d::load_optional_bias(weights, &prefix)?);
    }
    if blocks.is_empty() {
        return Err(SdError::MissingTensor(format!("{}.0.conv.weight", stage)));
    }
    Ok(blocks)
}
