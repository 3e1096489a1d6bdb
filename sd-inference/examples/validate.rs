//! Stage-by-stage comparison of pipeline outputs against reference dumps.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example validate -- reference_data/prompt1 models/sd
//! ```
//!
//! The reference directory holds `.npy` files produced by a reference
//! implementation for one prompt:
//!
//! | file              | contents                                   |
//! |-------------------|--------------------------------------------|
//! | `input_ids.npy`   | 77 token ids (i64)                         |
//! | `conditioning.npy`| pooled text embedding `[D]`                |
//! | `latent.npy`      | latent fed to the UNet and decoder `[C,H,W]` |
//! | `noise_pred.npy`  | UNet output for `latent.npy` at `t`        |
//! | `decoded.npy`     | decoder output `[3, 8H, 8W]` in `[-1, 1]`  |
//!
//! Missing files skip their stage.

use ndarray::ArrayD;
use ndarray_npy::ReadNpyExt;
use std::fs::File;
use std::path::{Path, PathBuf};

use sd_inference::config::PipelineConfig;
use sd_inference::latent::Latent;
use sd_inference::text_encoder::TextEncoder;
use sd_inference::unet::NoisePredictor;
use sd_inference::vae::ImageDecoder;

/// Validation metrics for a single stage.
#[derive(Debug)]
struct ValidationMetrics {
    name: String,
    mse: f64,
    cosine_similarity: f64,
    max_abs_diff: f64,
    mean_abs_diff: f64,
}

impl ValidationMetrics {
    fn new(name: &str, predicted: &[f32], reference: &[f32]) -> Option<Self> {
        if predicted.len() != reference.len() || predicted.is_empty() {
            eprintln!(
                "  ✗ {:30} length mismatch: {} vs {}",
                name,
                predicted.len(),
                reference.len()
            );
            return None;
        }

        let n = predicted.len() as f64;
        let mut sq = 0.0f64;
        let mut max_abs_diff = 0.0f64;
        let mut sum_abs_diff = 0.0f64;
        let mut dot = 0.0f64;
        let mut p_norm = 0.0f64;
        let mut r_norm = 0.0f64;

        for (&p, &r) in predicted.iter().zip(reference) {
            let (p, r) = (p as f64, r as f64);
            let d = (p - r).abs();
            sq += d * d;
            max_abs_diff = max_abs_diff.max(d);
            sum_abs_diff += d;
            dot += p * r;
            p_norm += p * p;
            r_norm += r * r;
        }

        let cosine_similarity = if p_norm > 0.0 && r_norm > 0.0 {
            dot / (p_norm.sqrt() * r_norm.sqrt())
        } else {
            0.0
        };

        Some(Self {
            name: name.to_string(),
            mse: sq / n,
            cosine_similarity,
            max_abs_diff,
            mean_abs_diff: sum_abs_diff / n,
        })
    }

    fn is_valid(&self) -> bool {
        self.mse < 1e-4 && self.cosine_similarity > 0.999 && self.max_abs_diff < 1e-2
    }

    fn print(&self) {
        let status = if self.is_valid() { "✓" } else { "✗" };
        println!(
            "  {} {:30} MSE={:.2e}  Cosine={:.6}  MaxDiff={:.2e}  MeanDiff={:.2e}",
            status, self.name, self.mse, self.cosine_similarity, self.max_abs_diff, self.mean_abs_diff
        );
    }
}

fn load_npy(path: &Path) -> Result<Option<ArrayD<f32>>, Box<dyn std::error::Error>> {
    if !path.exists() {
        println!("  - {} not found, skipping", path.display());
        return Ok(None);
    }
    Ok(Some(ArrayD::read_npy(File::open(path)?)?))
}

fn load_latent(path: &Path) -> Result<Option<Latent>, Box<dyn std::error::Error>> {
    let Some(array) = load_npy(path)? else {
        return Ok(None);
    };
    // Accept [C,H,W] or [1,C,H,W]
    let shape: Vec<usize> = array.shape().iter().copied().skip_while(|&d| d == 1).collect();
    if shape.len() != 3 {
        return Err(format!("{}: expected a 3D latent, got {:?}", path.display(), array.shape()).into());
    }
    let (data, _offset) = array.as_standard_layout().into_owned().into_raw_vec_and_offset();
    Ok(Some(Latent::new(shape[0], shape[1], shape[2], data)?))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <reference_dir> [model_dir] [t]", args[0]);
        std::process::exit(1);
    }
    let reference_dir = PathBuf::from(&args[1]);
    let model_dir = PathBuf::from(args.get(2).map(String::as_str).unwrap_or("models/sd"));
    let t: f32 = args.get(3).map(|s| s.parse::<f32>()).transpose()?.unwrap_or(0.5);

    if !reference_dir.is_dir() {
        eprintln!("Error: reference directory does not exist: {}", reference_dir.display());
        std::process::exit(1);
    }
    if !model_dir.is_dir() {
        eprintln!("Error: model directory does not exist: {}", model_dir.display());
        std::process::exit(1);
    }

    println!("=== Pipeline Validation ===");
    println!("Reference data: {}", reference_dir.display());
    println!("Model:          {}", model_dir.display());
    println!();

    let config = PipelineConfig::from_model_dir(&model_dir)?;
    let mut results = Vec::new();

    // Text encoder
    println!("Text encoder");
    let encoder = TextEncoder::load(&model_dir, &config.text_encoder)?;
    let ids_path = reference_dir.join("input_ids.npy");
    if ids_path.exists() {
        let ids: ArrayD<i64> = ArrayD::read_npy(File::open(&ids_path)?)?;
        let ids: Vec<u32> = ids.iter().map(|&x| x as u32).collect();
        if let Some(reference) = load_npy(&reference_dir.join("conditioning.npy"))? {
            let conditioning = encoder.encode_ids(&ids)?;
            let reference: Vec<f32> = reference.iter().copied().collect();
            results.extend(ValidationMetrics::new("conditioning", &conditioning, &reference));
        }
    } else {
        println!("  - input_ids.npy not found, skipping");
    }

    let latent = load_latent(&reference_dir.join("latent.npy"))?;

    // Noise predictor
    println!("Noise predictor (t = {})", t);
    if let (Some(latent), Some(reference)) = (&latent, load_npy(&reference_dir.join("noise_pred.npy"))?) {
        let unet = NoisePredictor::load(&model_dir)?;
        let eps = unet.forward(latent, &[], t)?;
        let reference: Vec<f32> = reference.iter().copied().collect();
        results.extend(ValidationMetrics::new("noise_pred", &eps.data, &reference));
    }

    // Image decoder
    println!("Image decoder");
    if let (Some(latent), Some(reference)) = (&latent, load_npy(&reference_dir.join("decoded.npy"))?) {
        let decoder = ImageDecoder::load(&model_dir, &config.decoder)?;
        let rgb = decoder.decode_planes(latent)?;
        let reference: Vec<f32> = reference.iter().copied().collect();
        results.extend(ValidationMetrics::new("decoded", &rgb.data, &reference));
    }

    println!();
    println!("=== Validation Results ===");
    if results.is_empty() {
        println!("  nothing compared");
        return Ok(());
    }
    for metrics in &results {
        metrics.print();
    }
    println!();

    if results.iter().all(ValidationMetrics::is_valid) {
        println!("✓ VALIDATION PASSED");
    } else {
        println!("✗ VALIDATION FAILED");
        std::process::exit(2);
    }
    Ok(())
}
