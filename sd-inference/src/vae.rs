//! Convolutional image decoder: latent in, RGBA image out.
//!
//! # Architecture
//!
//! ```text
//! latent [4, h, w] / latent_scale
//!   ↓ conv_in
//!   ↓ mid.block_1, mid.block_2          (residual)
//!   ↓ up.0: block.0..2
//!   ↓ up.1: upsample 2× + conv, block.0..2
//!   ↓ up.2: upsample 2× + conv, block.0..2
//!   ↓ up.3: upsample 2× + conv, block.0..2
//!   ↓ norm_out, SiLU, conv_out, tanh
//! rgb [3, 8h, 8w] → bytes
//! ```

use std::path::Path;

use tracing::{debug, info};

use crate::config::DecoderConfig;
use crate::conv::{upsample2x, Conv2d, GroupNorm};
use crate::error::{Result, SdError};
use crate::latent::Latent;
use crate::loader::WeightStore;
use crate::output::Image;
use crate::tensor::silu;

/// Weight blob file name inside a model directory.
pub const WEIGHTS_FILE: &str = "vae_weights.bin";

const PREFIX: &str = "decoder";
const NUM_UP_STAGES: usize = 4;
const BLOCKS_PER_STAGE: usize = 3;

/// `GN → SiLU → conv → GN → SiLU → conv`, plus the (projected) input.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
}

impl ResidualBlock {
    /// Load `{prefix}.{norm1,conv1,norm2,conv2}` and the optional `{prefix}.nin_shortcut`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the convs do not chain, or if there is no
    /// shortcut and the block changes the channel count.
    pub fn load(weights: &WeightStore, prefix: &str, config: &DecoderConfig) -> Result<Self> {
        let norm = |name: &str| {
            GroupNorm::load(
                weights,
                &format!("{}.{}", prefix, name),
                config.num_groups,
                config.group_norm_eps,
            )
        };
        let norm1 = norm("norm1")?;
        let conv1 = Conv2d::load(weights, &format!("{}.conv1", prefix))?;
        let norm2 = norm("norm2")?;
        let conv2 = Conv2d::load(weights, &format!("{}.conv2", prefix))?;

        let shortcut_name = format!("{}.nin_shortcut", prefix);
        let nin_shortcut = if weights.contains(&format!("{}.weight", shortcut_name)) {
            Some(Conv2d::load(weights, &shortcut_name)?)
        } else {
            None
        };

        let in_channels = norm1.channels();
        check_channels(conv1.in_channels(), in_channels)?;
        check_channels(norm2.channels(), conv1.out_channels())?;
        check_channels(conv2.in_channels(), conv1.out_channels())?;
        match &nin_shortcut {
            Some(sc) => {
                check_channels(sc.in_channels(), in_channels)?;
                check_channels(sc.out_channels(), conv2.out_channels())?;
            }
            None => check_channels(conv2.out_channels(), in_channels)?,
        }

        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            nin_shortcut,
        })
    }

    /// Input channel count.
    pub fn in_channels(&self) -> usize {
        self.norm1.channels()
    }

    /// Output channel count.
    pub fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }

    /// Forward pass; spatial size is preserved.
    pub fn forward(&self, x: &Latent) -> Result<Latent> {
        let mut h = self.norm1.forward(x)?;
        h.map_inplace(silu);
        let h = self.conv1.forward(&h)?;
        let mut h = self.norm2.forward(&h)?;
        h.map_inplace(silu);
        let h = self.conv2.forward(&h)?;

        match &self.nin_shortcut {
            Some(sc) => h.add(&sc.forward(x)?),
            None => h.add(x),
        }
    }
}

fn check_channels(got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(SdError::ShapeMismatch {
            expected: vec![expected],
            got: vec![got],
        });
    }
    Ok(())
}

/// One resolution stage: optional `upsample 2× + conv`, then residual blocks.
#[derive(Debug, Clone)]
struct UpStage {
    upsample: Option<Conv2d>,
    blocks: Vec<ResidualBlock>,
}

impl UpStage {
    fn forward(&self, x: Latent) -> Result<Latent> {
        let mut h = match &self.upsample {
            Some(conv) => conv.forward(&upsample2x(&x))?,
            None => x,
        };
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        Ok(h)
    }
}

/// The VAE decoder.
#[derive(Debug, Clone)]
pub struct ImageDecoder {
    conv_in: Conv2d,
    mid: [ResidualBlock; 2],
    up: Vec<UpStage>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
    latent_scale: f32,
}

impl ImageDecoder {
    /// Load `vae_weights.bin` from `model_dir`.
    pub fn load(model_dir: impl AsRef<Path>, config: &DecoderConfig) -> Result<Self> {
        let weights = WeightStore::open(model_dir.as_ref().join(WEIGHTS_FILE))?;
        Self::from_weights(&weights, config)
    }

    /// Bind every decoder tensor. All are required except `nin_shortcut`.
    pub fn from_weights(weights: &WeightStore, config: &DecoderConfig) -> Result<Self> {
        let conv_in = Conv2d::load(weights, &format!("{}.conv_in", PREFIX))?;
        let mid = [
            ResidualBlock::load(weights, &format!("{}.mid.block_1", PREFIX), config)?,
            ResidualBlock::load(weights, &format!("{}.mid.block_2", PREFIX), config)?,
        ];

        let mut channels = conv_in.out_channels();
        for block in &mid {
            check_channels(block.in_channels(), channels)?;
            channels = block.out_channels();
        }

        let mut up = Vec::with_capacity(NUM_UP_STAGES);
        for stage in 0..NUM_UP_STAGES {
            let prefix = format!("{}.up.{}", PREFIX, stage);
            let upsample = if stage == 0 {
                None
            } else {
                let conv = Conv2d::load(weights, &format!("{}.upsample.conv", prefix))?;
                check_channels(conv.in_channels(), channels)?;
                channels = conv.out_channels();
                Some(conv)
            };

            let mut blocks = Vec::with_capacity(BLOCKS_PER_STAGE);
            for b in 0..BLOCKS_PER_STAGE {
                let block = ResidualBlock::load(weights, &format!("{}.block.{}", prefix, b), config)?;
                check_channels(block.in_channels(), channels)?;
                channels = block.out_channels();
                blocks.push(block);
            }
            debug!(stage, channels, upsample = upsample.is_some(), "decoder stage bound");
            up.push(UpStage { upsample, blocks });
        }

        let norm_out = GroupNorm::load(
            weights,
            &format!("{}.norm_out", PREFIX),
            config.num_groups,
            config.group_norm_eps,
        )?;
        check_channels(norm_out.channels(), channels)?;
        let conv_out = Conv2d::load(weights, &format!("{}.conv_out", PREFIX))?;
        check_channels(conv_out.in_channels(), channels)?;
        check_channels(conv_out.out_channels(), 3)?;

        info!(
            latent_channels = conv_in.in_channels(),
            base_channels = conv_in.out_channels(),
            "image decoder ready"
        );

        Ok(Self {
            conv_in,
            mid,
            up,
            norm_out,
            conv_out,
            latent_scale: config.latent_scale,
        })
    }

    /// Latent channel count `conv_in` expects.
    pub fn latent_channels(&self) -> usize {
        self.conv_in.in_channels()
    }

    /// Pixel size of one latent cell.
    pub fn upscale_factor(&self) -> usize {
        1 << self.up.iter().filter(|s| s.upsample.is_some()).count()
    }

    /// Decode a latent to `[3, H, W]` values in `[-1, 1]`.
    pub fn decode_planes(&self, latent: &Latent) -> Result<Latent> {
        if latent.channels != self.latent_channels() {
            return Err(SdError::ShapeMismatch {
                expected: vec![self.latent_channels(), latent.height, latent.width],
                got: latent.shape().to_vec(),
            });
        }

        let mut x = latent.clone();
        let inv_scale = 1.0 / self.latent_scale;
        x.map_inplace(|v| v * inv_scale);

        let mut h = self.conv_in.forward(&x)?;
        for block in &self.mid {
            h = block.forward(&h)?;
        }
        for stage in &self.up {
            h = stage.forward(h)?;
        }

        let mut h = self.norm_out.forward(&h)?;
        h.map_inplace(silu);
        let mut rgb = self.conv_out.forward(&h)?;
        rgb.map_inplace(f32::tanh);
        Ok(rgb)
    }

    /// Decode a latent to an RGBA image.
    pub fn decode(&self, latent: &Latent) -> Result<Image> {
        let rgb = self.decode_planes(latent)?;
        debug!(width = rgb.width, height = rgb.height, "decoded image");
        Image::from_rgb_planes(&rgb)
    }
}
