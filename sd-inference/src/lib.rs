//! SD Inference
//!
//! Pure Rust CPU implementation of a latent-diffusion text-to-image pipeline:
//! BPE tokenizer, CLIP-style text encoder, convolutional UNet noise predictor,
//! VAE image decoder and a DDIM sampling loop.
//!
//! Weights are read from a model directory holding `clip_weights.bin`,
//! `unet_weights.bin`, `vae_weights.bin`, `vocab.txt` and `merges.txt`.
//! See [`loader`] for the blob format and [`convert`] for producing blobs
//! from SafeTensors checkpoints.

#![warn(missing_docs)]

pub mod error;
pub mod tensor;
pub mod latent;
pub mod loader;
pub mod convert;
pub mod config;

// Text side
pub mod tokenizer;
pub mod embedding;
pub mod layer_norm;
pub mod causal_mask;
pub mod attention;
pub mod mlp;
pub mod transformer;
pub mod text_encoder;

// Image side
pub mod conv;
pub mod unet;
pub mod vae;
pub mod output;

pub mod scheduler;
pub mod pipeline;

pub use config::{GenerationRequest, Mode, PipelineConfig};
pub use error::{Result, SdError};
pub use output::Image;
pub use pipeline::{Pipeline, PipelineContext, SharedPipeline};
