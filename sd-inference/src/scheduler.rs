//! Noise-variance schedule for the reverse diffusion loop.
//!
//! For `N` steps the schedule holds, per step `i`:
//!
//! ```text
//! beta_i   linear: beta_start + i/(N-1) * (beta_end - beta_start)
//!          cosine: 1 - f(i+1)/f(i),  f(t) = cos²(((t/N) + s)/(1 + s) · π/2)
//! alpha_i  = 1 - clamp(beta_i, 1e-4, 0.999)
//! ᾱ_i      = alpha_0 · … · alpha_i
//! sigma_i  = sqrt((1 - ᾱ_i) / ᾱ_i)
//! ```
//!
//! Step 0 is the least noisy; the denoising loop walks from `N-1` down to 0.

use crate::config::{SchedulerConfig, SchedulerKind};
use crate::error::{Result, SdError};

/// Lower clamp for beta.
pub const BETA_MIN: f32 = 1e-4;
/// Upper clamp for beta.
pub const BETA_MAX: f32 = 0.999;

/// Per-step alpha, cumulative alpha and sigma, fixed after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    alphas: Vec<f32>,
    alphas_cumprod: Vec<f32>,
    sigmas: Vec<f32>,
}

impl Schedule {
    /// Precompute a schedule of `num_steps` steps.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `num_steps == 0`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sd_inference::config::SchedulerConfig;
    /// use sd_inference::scheduler::Schedule;
    ///
    /// let schedule = Schedule::new(20, &SchedulerConfig::default()).unwrap();
    /// assert_eq!(schedule.len(), 20);
    /// assert!(schedule.alpha_cumprod(19).unwrap() < schedule.alpha_cumprod(0).unwrap());
    /// ```
    pub fn new(num_steps: usize, config: &SchedulerConfig) -> Result<Self> {
        if num_steps == 0 {
            return Err(SdError::InvalidConfig(
                "scheduler needs at least one step".to_string(),
            ));
        }

        let betas: Vec<f32> = match config.kind {
            SchedulerKind::Linear => linear_betas(num_steps, config.beta_start, config.beta_end),
            SchedulerKind::Cosine => cosine_betas(num_steps, config.cosine_offset),
        };

        let mut alphas = Vec::with_capacity(num_steps);
        let mut alphas_cumprod = Vec::with_capacity(num_steps);
        let mut sigmas = Vec::with_capacity(num_steps);
        let mut cumprod = 1.0f32;

        for beta in betas {
            let alpha = 1.0 - beta.clamp(BETA_MIN, BETA_MAX);
            cumprod *= alpha;
            alphas.push(alpha);
            alphas_cumprod.push(cumprod);
            sigmas.push(((1.0 - cumprod) / cumprod).sqrt());
        }

        Ok(Self {
            alphas,
            alphas_cumprod,
            sigmas,
        })
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.alphas.len()
    }

    /// Always false; a schedule has at least one step.
    pub fn is_empty(&self) -> bool {
        self.alphas.is_empty()
    }

    /// `alpha_i`.
    pub fn alpha(&self, step: usize) -> Result<f32> {
        self.lookup(&self.alphas, step)
    }

    /// `ᾱ_i`.
    pub fn alpha_cumprod(&self, step: usize) -> Result<f32> {
        self.lookup(&self.alphas_cumprod, step)
    }

    /// `ᾱ_{i-1}`, with `ᾱ_{-1} = 1`.
    pub fn alpha_cumprod_prev(&self, step: usize) -> Result<f32> {
        match step {
            0 => Ok(1.0),
            s => self.lookup(&self.alphas_cumprod, s - 1),
        }
    }

    /// `sigma_i`.
    pub fn sigma(&self, step: usize) -> Result<f32> {
        self.lookup(&self.sigmas, step)
    }

    /// All alphas.
    pub fn alphas(&self) -> &[f32] {
        &self.alphas
    }

    /// All cumulative alphas.
    pub fn alphas_cumprod(&self) -> &[f32] {
        &self.alphas_cumprod
    }

    /// All sigmas.
    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    fn lookup(&self, values: &[f32], step: usize) -> Result<f32> {
        values.get(step).copied().ok_or_else(|| {
            SdError::Model(format!(
                "scheduler step {} out of range for {} steps",
                step,
                self.len()
            ))
        })
    }
}

fn linear_betas(n: usize, start: f32, end: f32) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let t = if n > 1 { i as f32 / (n - 1) as f32 } else { 0.0 };
            start + t * (end - start)
        })
        .collect()
}

fn cosine_betas(n: usize, s: f32) -> Vec<f32> {
    let f = |t: f64| {
        let v = ((t / n as f64 + s as f64) / (1.0 + s as f64) * std::f64::consts::FRAC_PI_2).cos();
        v * v
    };
    (0..n)
        .map(|i| (1.0 - f(i as f64 + 1.0) / f(i as f64)) as f32)
        .collect()
}
