//! Text-to-image orchestration.
//!
//! Implements the reverse diffusion loop:
//! 1. Encode the prompt to a conditioning vector
//! 2. Sample a Gaussian latent from the request seed
//! 3. For each step `i` from `N-1` down to 0, predict noise and apply the DDIM update
//! 4. Decode the final latent to RGBA
//!
//! # Example
//!
//! ```no_run
//! use sd_inference::config::{GenerationRequest, Mode};
//! use sd_inference::pipeline::PipelineContext;
//!
//! let ctx = PipelineContext::init("models/sd")?;
//! let request = GenerationRequest::new("a red fox").with_steps(10).with_mode(Mode::Small);
//! let image = ctx.generate(&request)?;
//! image.save_png("fox.png")?;
//! # Ok::<(), sd_inference::error::SdError>(())
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info};

use crate::config::{GenerationRequest, PipelineConfig};
use crate::error::{Result, SdError};
use crate::latent::Latent;
use crate::output::Image;
use crate::scheduler::Schedule;
use crate::text_encoder::TextEncoder;
use crate::unet::NoisePredictor;
use crate::vae::ImageDecoder;

/// Loaded stages of the pipeline.
///
/// Construction is initialization and dropping releases every weight.
/// All methods take `&self`; weights are never mutated after `init`.
#[derive(Debug)]
pub struct PipelineContext {
    config: PipelineConfig,
    text_encoder: TextEncoder,
    noise_predictor: NoisePredictor,
    decoder: ImageDecoder,
}

impl PipelineContext {
    /// Load every stage from `model_dir`, reading `pipeline.json` if present.
    pub fn init(model_dir: impl AsRef<Path>) -> Result<Self> {
        let config = PipelineConfig::from_model_dir(model_dir.as_ref())?;
        Self::init_with_config(model_dir, config)
    }

    /// Load every stage from `model_dir` with an explicit configuration.
    ///
    /// Stages load in order: text encoder, noise predictor, image decoder.
    /// The first failure is returned and nothing is kept.
    ///
    /// # Errors
    ///
    /// Returns the failing stage's error, or `Model` if the stages disagree
    /// on the latent layout.
    pub fn init_with_config(model_dir: impl AsRef<Path>, config: PipelineConfig) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        config.validate()?;
        info!(model_dir = %model_dir.display(), "initializing pipeline");

        let text_encoder = TextEncoder::load(model_dir, &config.text_encoder)?;
        let noise_predictor = NoisePredictor::load(model_dir)?;
        let decoder = ImageDecoder::load(model_dir, &config.decoder)?;

        if noise_predictor.latent_channels() != config.latent_channels
            || decoder.latent_channels() != config.latent_channels
        {
            return Err(SdError::Model(format!(
                "latent channels disagree: config {}, unet {}, decoder {}",
                config.latent_channels,
                noise_predictor.latent_channels(),
                decoder.latent_channels()
            )));
        }
        if decoder.upscale_factor() != config.downscale_factor {
            return Err(SdError::Model(format!(
                "decoder upscales {}x but downscale_factor is {}",
                decoder.upscale_factor(),
                config.downscale_factor
            )));
        }

        info!("pipeline ready");
        Ok(Self {
            config,
            text_encoder,
            noise_predictor,
            decoder,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Text encoder stage.
    pub fn text_encoder(&self) -> &TextEncoder {
        &self.text_encoder
    }

    /// Generate one image.
    pub fn generate(&self, request: &GenerationRequest) -> Result<Image> {
        self.generate_with_progress(request, |_, _| {})
    }

    /// Generate one image, calling `progress(done, total)` after every step.
    ///
    /// # Algorithm
    ///
    /// ```text
    /// x  ~ N(0, I)                                    [C, S/8, S/8]
    /// for i in N-1 ..= 0:
    ///     eps = unet(x, cond, i / N)
    ///     x0  = (x - sqrt(1 - ā_i) * eps) / sqrt(ā_i)
    ///     x   = sqrt(ā_{i-1}) * x0 + sqrt(1 - ā_{i-1}) * eps      ā_{-1} = 1
    /// image = decode(x)
    /// ```
    ///
    /// # Errors
    ///
    /// Any stage failure voids the request; no partial image is returned.
    pub fn generate_with_progress(
        &self,
        request: &GenerationRequest,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<Image> {
        let steps = request.effective_steps();
        let latent_size = request.mode.latent_size(self.config.downscale_factor);
        if latent_size == 0 {
            return Err(SdError::InvalidConfig(format!(
                "{:?} output is smaller than one latent cell",
                request.mode
            )));
        }
        info!(
            steps,
            mode = ?request.mode,
            seed = request.seed,
            guidance = request.guidance,
            "generating"
        );

        let conditioning = self.text_encoder.encode(&request.prompt)?;
        if conditioning.is_empty() {
            return Err(SdError::Model("text encoder returned an empty embedding".into()));
        }

        let schedule = Schedule::new(steps, &self.config.scheduler)?;
        let mut rng = StdRng::seed_from_u64(request.seed);
        let mut x = Latent::randn(self.config.latent_channels, latent_size, latent_size, &mut rng);

        for (done, i) in (0..steps).rev().enumerate() {
            let t = i as f32 / steps as f32;
            let eps = self.noise_predictor.forward(&x, &conditioning, t)?;
            x = ddim_step(
                &x,
                &eps,
                schedule.alpha_cumprod(i)?,
                schedule.alpha_cumprod_prev(i)?,
            )?;
            debug!(step = i, t, "denoising step");
            progress(done + 1, steps);
        }

        self.decoder.decode(&x)
    }
}

/// One deterministic DDIM update from `x_t` to `x_{t-1}`.
///
/// # Errors
///
/// Returns `ShapeMismatch` if `eps` and `x` differ in shape.
pub fn ddim_step(x: &Latent, eps: &Latent, alpha_cumprod: f32, alpha_cumprod_prev: f32) -> Result<Latent> {
    x.expect_shape(eps)?;

    let sqrt_a = alpha_cumprod.sqrt();
    let sqrt_one_minus_a = (1.0 - alpha_cumprod).max(0.0).sqrt();
    let sqrt_a_prev = alpha_cumprod_prev.sqrt();
    let sqrt_one_minus_a_prev = (1.0 - alpha_cumprod_prev).max(0.0).sqrt();

    let data = x
        .data
        .iter()
        .zip(&eps.data)
        .map(|(&xv, &e)| {
            let x0 = (xv - sqrt_one_minus_a * e) / (sqrt_a + 1e-8);
            sqrt_a_prev * x0 + sqrt_one_minus_a_prev * e
        })
        .collect();
    Latent::new(x.channels, x.height, x.width, data)
}

/// Lifecycle wrapper: `init`, `generate`, `free`.
///
/// Holds no stage state until `init` succeeds. A failed `init` leaves the
/// pipeline unready.
#[derive(Debug, Default)]
pub struct Pipeline {
    context: Option<PipelineContext>,
    model_dir: Option<PathBuf>,
}

impl Pipeline {
    /// An unready pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load all stages from `model_dir`, replacing any previous state.
    pub fn init(&mut self, model_dir: impl AsRef<Path>) -> Result<()> {
        self.free();
        let model_dir = model_dir.as_ref();
        match PipelineContext::init(model_dir) {
            Ok(ctx) => {
                self.context = Some(ctx);
                self.model_dir = Some(model_dir.to_path_buf());
                Ok(())
            }
            Err(e) => {
                error!(model_dir = %model_dir.display(), error = %e, "pipeline init failed");
                Err(e)
            }
        }
    }

    /// Whether `init` has succeeded and `free` has not been called since.
    pub fn is_ready(&self) -> bool {
        self.context.is_some()
    }

    /// Directory the current stages were loaded from.
    pub fn model_dir(&self) -> Option<&Path> {
        self.model_dir.as_deref()
    }

    /// Loaded stages, if ready.
    pub fn context(&self) -> Option<&PipelineContext> {
        self.context.as_ref()
    }

    /// Generate one image.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` before `init` or after `free`.
    pub fn generate(&self, request: &GenerationRequest) -> Result<Image> {
        self.context
            .as_ref()
            .ok_or(SdError::NotReady)?
            .generate(request)
    }

    /// Generate one image, returning the empty image on any failure.
    pub fn generate_or_empty(&self, request: &GenerationRequest) -> Image {
        self.generate(request).unwrap_or_else(|e| {
            error!(error = %e, "generation failed");
            Image::empty()
        })
    }

    /// Release every stage and clear the ready state.
    pub fn free(&mut self) {
        if self.context.take().is_some() {
            info!("pipeline freed");
        }
        self.model_dir = None;
    }
}

/// A [`Pipeline`] shared between threads behind one mutex.
///
/// Every call holds the lock for its whole duration, so `init`, `generate`
/// and `free` never overlap.
#[derive(Debug, Clone, Default)]
pub struct SharedPipeline {
    inner: Arc<Mutex<Pipeline>>,
}

impl SharedPipeline {
    /// An unready shared pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`Pipeline::init`].
    pub fn init(&self, model_dir: impl AsRef<Path>) -> Result<()> {
        self.lock().init(model_dir)
    }

    /// See [`Pipeline::generate`].
    pub fn generate(&self, request: &GenerationRequest) -> Result<Image> {
        self.lock().generate(request)
    }

    /// See [`Pipeline::generate_or_empty`].
    pub fn generate_or_empty(&self, request: &GenerationRequest) -> Image {
        self.lock().generate_or_empty(request)
    }

    /// See [`Pipeline::free`].
    pub fn free(&self) {
        self.lock().free()
    }

    /// See [`Pipeline::is_ready`].
    pub fn is_ready(&self) -> bool {
        self.lock().is_ready()
    }

    // Stages are swapped wholesale, so a poisoned lock still guards a consistent pipeline.
    fn lock(&self) -> MutexGuard<'_, Pipeline> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
