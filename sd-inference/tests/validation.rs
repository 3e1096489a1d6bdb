//! Validation against reference stage outputs.
//!
//! Compares each pipeline stage with activations dumped by a reference
//! implementation for the same weights and inputs. Tests skip when the
//! reference data or model directory is absent.
//!
//! # Tolerance Thresholds
//!
//! - Mean Squared Error (MSE): < 1e-5 for the text encoder, < 1e-4 for image stages
//! - Cosine similarity: > 0.999
//!
//! # Expected Reference Data Format
//!
//! ```text
//! reference_data/
//!   prompt1/
//!     input_ids.npy       [77] i64
//!     hidden_states.npy   [77, D]
//!     conditioning.npy    [D]
//!     latent.npy          [4, h, w]
//!     noise_pred.npy      [4, h, w]
//!     decoded.npy         [3, 8h, 8w]
//! models/sd/
//!     clip_weights.bin unet_weights.bin vae_weights.bin vocab.txt merges.txt
//! ```

use approx::assert_relative_eq;
use ndarray::ArrayD;
use ndarray_npy::ReadNpyExt;
use std::fs::File;
use std::path::{Path, PathBuf};

use sd_inference::config::PipelineConfig;
use sd_inference::latent::Latent;
use sd_inference::text_encoder::TextEncoder;
use sd_inference::unet::NoisePredictor;
use sd_inference::vae::ImageDecoder;

/// Comparison of one stage output against its reference.
#[derive(Debug, Clone)]
struct StageValidation {
    name: &'static str,
    mse: f64,
    cosine_similarity: f64,
    max_abs_diff: f64,
    mean_abs_diff: f64,
}

impl StageValidation {
    fn is_valid(&self, mse_threshold: f64, cosine_threshold: f64) -> bool {
        self.mse < mse_threshold && self.cosine_similarity > cosine_threshold
    }

    fn format(&self) -> String {
        format!(
            "{:16} MSE={:.2e} cos={:.6} max={:.2e} mean={:.2e}",
            self.name, self.mse, self.cosine_similarity, self.max_abs_diff, self.mean_abs_diff
        )
    }
}

fn compute_validation_metrics(name: &'static str, predicted: &[f32], reference: &[f32]) -> StageValidation {
    assert_eq!(predicted.len(), reference.len(), "{}: length mismatch", name);
    let n = predicted.len() as f64;

    let mut sq = 0.0f64;
    let mut max_abs_diff = 0.0f64;
    let mut sum_abs_diff = 0.0f64;
    let (mut dot, mut pn, mut rn) = (0.0f64, 0.0f64, 0.0f64);
    for (&p, &r) in predicted.iter().zip(reference) {
        let (p, r) = (p as f64, r as f64);
        let d = (p - r).abs();
        sq += d * d;
        max_abs_diff = max_abs_diff.max(d);
        sum_abs_diff += d;
        dot += p * r;
        pn += p * p;
        rn += r * r;
    }

    let cosine_similarity = if pn > 0.0 && rn > 0.0 {
        dot / (pn.sqrt() * rn.sqrt())
    } else {
        0.0
    };

    StageValidation {
        name,
        mse: sq / n,
        cosine_similarity,
        max_abs_diff,
        mean_abs_diff: sum_abs_diff / n,
    }
}

fn load_npy_flat(path: &Path) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
    let array: ArrayD<f32> = ArrayD::read_npy(File::open(path)?)?;
    Ok(array.iter().copied().collect())
}

fn load_npy_ids(path: &Path) -> Result<Vec<u32>, Box<dyn std::error::Error>> {
    let array: ArrayD<i64> = ArrayD::read_npy(File::open(path)?)?;
    Ok(array.iter().map(|&x| x as u32).collect())
}

fn load_npy_latent(path: &Path) -> Result<Latent, Box<dyn std::error::Error>> {
    let array: ArrayD<f32> = ArrayD::read_npy(File::open(path)?)?;
    let shape: Vec<usize> = array.shape().iter().copied().skip_while(|&d| d == 1).collect();
    if shape.len() != 3 {
        return Err(format!("expected [C, H, W], got {:?}", array.shape()).into());
    }
    let data = array.iter().copied().collect();
    Ok(Latent::new(shape[0], shape[1], shape[2], data)?)
}

/// First prompt directory under `reference_data/`.
fn find_reference_dir() -> Option<PathBuf> {
    let candidates = [
        PathBuf::from("reference_data"),
        PathBuf::from("../reference_data"),
    ];
    let root = candidates.into_iter().find(|p| p.is_dir())?;
    std::fs::read_dir(root)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.is_dir())
}

fn find_model_dir() -> Option<PathBuf> {
    [PathBuf::from("models/sd"), PathBuf::from("../models/sd")]
        .into_iter()
        .find(|p| p.is_dir())
}

/// Reference and model directories, or a skip message.
fn fixtures(required: &[&str]) -> Option<(PathBuf, PathBuf)> {
    let Some(ref_dir) = find_reference_dir() else {
        eprintln!("Skipping: reference_data directory not found");
        return None;
    };
    let Some(model_dir) = find_model_dir() else {
        eprintln!("Skipping: model directory not found");
        return None;
    };
    for file in required {
        if !ref_dir.join(file).exists() {
            eprintln!("Skipping: {} not found", file);
            return None;
        }
    }
    Some((ref_dir, model_dir))
}

#[test]
fn test_validation_metrics() {
    let values = vec![1.0, 2.0, 3.0, 4.0];
    let metrics = compute_validation_metrics("same", &values, &values);

    assert_relative_eq!(metrics.mse, 0.0, epsilon = 1e-10);
    assert_relative_eq!(metrics.cosine_similarity, 1.0, epsilon = 1e-10);
    assert_relative_eq!(metrics.max_abs_diff, 0.0, epsilon = 1e-10);
    assert!(metrics.is_valid(1e-5, 0.999));
}

#[test]
fn test_validation_metrics_small_diff() {
    let predicted = vec![1.0, 2.0, 3.0, 4.0];
    let reference = vec![1.001, 2.001, 3.001, 4.001];
    let metrics = compute_validation_metrics("shifted", &predicted, &reference);

    assert!(metrics.mse < 1e-5);
    assert!(metrics.cosine_similarity > 0.9999);
    assert!(metrics.max_abs_diff < 0.002);
    assert!(metrics.format().starts_with("shifted"));
}

#[test]
fn test_validation_metrics_opposite() {
    let metrics = compute_validation_metrics("flip", &[1.0, -1.0], &[-1.0, 1.0]);
    assert_relative_eq!(metrics.cosine_similarity, -1.0, epsilon = 1e-10);
    assert!(!metrics.is_valid(1.0, 0.999));
}

#[test]
fn test_text_encoder_against_reference() {
    let Some((ref_dir, model_dir)) = fixtures(&["input_ids.npy", "conditioning.npy"]) else {
        return;
    };
    let config = PipelineConfig::from_model_dir(&model_dir).unwrap();
    let encoder = TextEncoder::load(&model_dir, &config.text_encoder).unwrap();
    let ids = load_npy_ids(&ref_dir.join("input_ids.npy")).unwrap();

    let hidden_path = ref_dir.join("hidden_states.npy");
    if hidden_path.exists() {
        let hidden = encoder.hidden_states(&ids).unwrap();
        let reference = load_npy_flat(&hidden_path).unwrap();
        let metrics = compute_validation_metrics("hidden_states", hidden.data(), &reference);
        eprintln!("{}", metrics.format());
        assert!(metrics.is_valid(1e-5, 0.999), "{}", metrics.format());
    }

    let conditioning = encoder.encode_ids(&ids).unwrap();
    let reference = load_npy_flat(&ref_dir.join("conditioning.npy")).unwrap();
    let metrics = compute_validation_metrics("conditioning", &conditioning, &reference);
    eprintln!("{}", metrics.format());
    assert!(metrics.is_valid(1e-5, 0.999), "{}", metrics.format());
}

#[test]
fn test_noise_predictor_against_reference() {
    let Some((ref_dir, model_dir)) = fixtures(&["latent.npy", "noise_pred.npy"]) else {
        return;
    };
    let unet = NoisePredictor::load(&model_dir).unwrap();
    let latent = load_npy_latent(&ref_dir.join("latent.npy")).unwrap();
    let eps = unet.forward(&latent, &[], 0.5).unwrap();
    let reference = load_npy_flat(&ref_dir.join("noise_pred.npy")).unwrap();

    let metrics = compute_validation_metrics("noise_pred", &eps.data, &reference);
    eprintln!("{}", metrics.format());
    assert!(metrics.is_valid(1e-4, 0.999), "{}", metrics.format());
}

#[test]
fn test_decoder_against_reference() {
    let Some((ref_dir, model_dir)) = fixtures(&["latent.npy", "decoded.npy"]) else {
        return;
    };
    let config = PipelineConfig::from_model_dir(&model_dir).unwrap();
    let decoder = ImageDecoder::load(&model_dir, &config.decoder).unwrap();
    let latent = load_npy_latent(&ref_dir.join("latent.npy")).unwrap();
    let rgb = decoder.decode_planes(&latent).unwrap();
    let reference = load_npy_flat(&ref_dir.join("decoded.npy")).unwrap();

    let metrics = compute_validation_metrics("decoded", &rgb.data, &reference);
    eprintln!("{}", metrics.format());
    assert!(metrics.is_valid(1e-4, 0.999), "{}", metrics.format());
}
