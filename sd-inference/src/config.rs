//! Pipeline configuration and per-request parameters.
//!
//! [`PipelineConfig`] holds the architecture constants every stage reads at
//! init. It is optional on disk: a model directory may carry a
//! `pipeline.json`, and any field it omits keeps its default.
//! [`GenerationRequest`] is what a caller passes to each `generate` call.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::causal_mask::MaskPolicy;
use crate::error::{Result, SdError};

/// File name looked up inside a model directory.
pub const PIPELINE_CONFIG_FILE: &str = "pipeline.json";

/// Text encoder hyperparameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TextEncoderConfig {
    /// Number of transformer blocks.
    pub num_layers: usize,

    /// Fixed sequence length. Also the tokenizer's output length.
    pub max_position: usize,

    /// LayerNorm epsilon.
    pub layer_norm_eps: f32,

    /// Attention masking over the padded sequence.
    pub attention_mask: MaskPolicy,
}

impl Default for TextEncoderConfig {
    fn default() -> Self {
        Self {
            num_layers: 12,
            max_position: 77,
            layer_norm_eps: 1e-5,
            attention_mask: MaskPolicy::Unmasked,
        }
    }
}

/// Noise schedule family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Beta interpolated linearly between `beta_start` and `beta_end`.
    #[default]
    Linear,
    /// Alpha-cumprod following a squared cosine.
    Cosine,
}

/// Step scheduler parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Schedule family.
    pub kind: SchedulerKind,
    /// First beta of the linear schedule.
    pub beta_start: f32,
    /// Last beta of the linear schedule.
    pub beta_end: f32,
    /// Small offset `s` of the cosine schedule.
    pub cosine_offset: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::Linear,
            beta_start: 1e-4,
            beta_end: 0.02,
            cosine_offset: 0.008,
        }
    }
}

/// Image decoder constants.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Latents are divided by this before decoding.
    pub latent_scale: f32,
    /// Group count of every group norm.
    pub num_groups: usize,
    /// Group norm epsilon.
    pub group_norm_eps: f32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            latent_scale: 0.18215,
            num_groups: 32,
            group_norm_eps: 1e-5,
        }
    }
}

/// Architecture constants for the whole pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Text encoder section.
    pub text_encoder: TextEncoderConfig,
    /// Scheduler section.
    pub scheduler: SchedulerConfig,
    /// Image decoder section.
    pub decoder: DecoderConfig,
    /// Channels of the diffusion latent.
    pub latent_channels: usize,
    /// Pixel size of one latent cell.
    pub downscale_factor: usize,
}

impl PipelineConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Example
    /// ```no_run
    /// use sd_inference::config::PipelineConfig;
    ///
    /// let config = PipelineConfig::from_file("models/sd/pipeline.json")?;
    /// assert_eq!(config.latent_channels, 4);
    /// # Ok::<(), sd_inference::error::SdError>(())
    /// ```
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// `model_dir/pipeline.json` if present, defaults otherwise.
    pub fn from_model_dir(model_dir: impl AsRef<Path>) -> Result<Self> {
        let path = model_dir.as_ref().join(PIPELINE_CONFIG_FILE);
        if path.exists() {
            debug!(path = %path.display(), "reading pipeline config");
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject values no stage can run with.
    pub fn validate(&self) -> Result<()> {
        let te = &self.text_encoder;
        if te.max_position == 0 {
            return Err(SdError::InvalidConfig("max_position must be > 0".into()));
        }
        if te.layer_norm_eps <= 0.0 || self.decoder.group_norm_eps <= 0.0 {
            return Err(SdError::InvalidConfig("norm epsilon must be > 0".into()));
        }
        if self.decoder.num_groups == 0 {
            return Err(SdError::InvalidConfig("num_groups must be > 0".into()));
        }
        if self.decoder.latent_scale == 0.0 {
            return Err(SdError::InvalidConfig("latent_scale must be non-zero".into()));
        }
        if self.latent_channels == 0 || self.downscale_factor == 0 {
            return Err(SdError::InvalidConfig(
                "latent_channels and downscale_factor must be > 0".into(),
            ));
        }
        let s = &self.scheduler;
        if !(s.beta_start > 0.0 && s.beta_end > 0.0 && s.beta_start < 1.0 && s.beta_end < 1.0) {
            return Err(SdError::InvalidConfig(format!(
                "betas must lie in (0, 1), got {}..{}",
                s.beta_start, s.beta_end
            )));
        }
        if s.cosine_offset < 0.0 {
            return Err(SdError::InvalidConfig("cosine_offset must be >= 0".into()));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            text_encoder: TextEncoderConfig::default(),
            scheduler: SchedulerConfig::default(),
            decoder: DecoderConfig::default(),
            latent_channels: 4,
            downscale_factor: 8,
        }
    }
}

/// Output resolution preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// 32×32 pixels.
    Small,
    /// 512×512 pixels.
    #[default]
    Large,
}

impl Mode {
    /// Square output edge in pixels.
    pub fn pixel_size(self) -> usize {
        match self {
            Mode::Small => 32,
            Mode::Large => 512,
        }
    }

    /// Square latent edge for a given downscale factor.
    pub fn latent_size(self, downscale_factor: usize) -> usize {
        self.pixel_size() / downscale_factor
    }
}

impl std::str::FromStr for Mode {
    type Err = SdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "small" | "pixel32" => Ok(Mode::Small),
            "large" | "highres512" => Ok(Mode::Large),
            other => Err(SdError::InvalidConfig(format!("unknown mode '{}'", other))),
        }
    }
}

/// Parameters of one `generate` call.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GenerationRequest {
    /// Text prompt.
    pub prompt: String,
    /// Denoising steps. Values below 1 run one step.
    pub steps: usize,
    /// Classifier-free guidance scale. Accepted, not applied.
    pub guidance: f32,
    /// Output resolution.
    pub mode: Mode,
    /// Seed of the initial latent noise.
    pub seed: u64,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            steps: 20,
            guidance: 7.5,
            mode: Mode::Large,
            seed: 1234,
        }
    }
}

impl GenerationRequest {
    /// Request with default parameters for `prompt`.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Set the step count.
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    /// Set the output mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the noise seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Step count actually run.
    pub fn effective_steps(&self) -> usize {
        self.steps.max(1)
    }
}
