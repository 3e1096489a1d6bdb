//! End-to-end pipeline tests against a tiny synthetic model directory.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use sd_inference::config::{DecoderConfig, GenerationRequest, Mode, PipelineConfig, TextEncoderConfig};
use sd_inference::loader::{NamedTensor, WeightStore};
use sd_inference::pipeline::{Pipeline, PipelineContext, SharedPipeline};
use sd_inference::tensor::Tensor;
use sd_inference::{text_encoder, unet, vae, SdError};

const D: usize = 4;
const VAE_C: usize = 8;

fn wave(n: usize, seed: usize, scale: f32) -> Vec<f32> {
    (0..n).map(|v| (((v + seed) as f32) * 0.61).sin() * scale).collect()
}

fn named(name: impl Into<String>, data: Vec<f32>, shape: &[usize]) -> NamedTensor {
    NamedTensor::new(name, Tensor::new(data, shape.to_vec()).unwrap())
}

fn clip_tensors() -> Vec<NamedTensor> {
    let mut t = vec![
        named("text_model.embeddings.token_embedding.weight", wave(8 * D, 0, 0.5), &[8, D]),
        named("text_model.embeddings.position_embedding.weight", wave(77 * D, 3, 0.05), &[77, D]),
    ];
    let p = "text_model.encoder.layers.0";
    for ln in ["layernorm1", "layernorm2"] {
        t.push(named(format!("{}.{}.weight", p, ln), vec![1.0; D], &[D]));
        t.push(named(format!("{}.{}.bias", p, ln), vec![0.0; D], &[D]));
    }
    for (i, proj) in ["q_proj", "k_proj", "v_proj", "out_proj"].iter().enumerate() {
        t.push(named(format!("{}.self_attn.{}.weight", p, proj), wave(D * D, i, 0.3), &[D, D]));
    }
    t.push(named(format!("{}.mlp.fc1.weight", p), wave(D * 8, 5, 0.2), &[D, 8]));
    t.push(named(format!("{}.mlp.fc2.weight", p), wave(8 * D, 6, 0.2), &[8, D]));
    t
}

fn push_conv(t: &mut Vec<NamedTensor>, name: &str, o: usize, i: usize, k: usize, seed: usize) {
    t.push(named(format!("{}.weight", name), wave(o * i * k * k, seed, 0.3), &[o, i, k, k]));
    t.push(named(format!("{}.bias", name), vec![0.01; o], &[o]));
}

fn unet_tensors() -> Vec<NamedTensor> {
    let mut t = Vec::new();
    push_conv(&mut t, "down_blocks.0.conv", 8, 4, 3, 0);
    push_conv(&mut t, "down_blocks.1.conv", 8, 8, 3, 1);
    push_conv(&mut t, "mid_blocks.0.conv", 8, 8, 3, 2);
    push_conv(&mut t, "up_blocks.0.conv", 8, 8, 3, 3);
    push_conv(&mut t, "up_blocks.1.conv", 4, 8, 3, 4);
    t
}

fn push_norm(t: &mut Vec<NamedTensor>, name: &str) {
    t.push(named(format!("{}.weight", name), vec![1.0; VAE_C], &[VAE_C]));
    t.push(named(format!("{}.bias", name), vec![0.0; VAE_C], &[VAE_C]));
}

fn push_block(t: &mut Vec<NamedTensor>, name: &str, seed: usize) {
    push_norm(t, &format!("{}.norm1", name));
    push_conv(t, &format!("{}.conv1", name), VAE_C, VAE_C, 1, seed);
    push_norm(t, &format!("{}.norm2", name));
    push_conv(t, &format!("{}.conv2", name), VAE_C, VAE_C, 1, seed + 1);
}

fn vae_tensors() -> Vec<NamedTensor> {
    let mut t = Vec::new();
    push_conv(&mut t, "decoder.conv_in", VAE_C, 4, 3, 0);
    push_block(&mut t, "decoder.mid.block_1", 1);
    push_block(&mut t, "decoder.mid.block_2", 2);
    for stage in 0..4 {
        if stage > 0 {
            push_conv(&mut t, &format!("decoder.up.{}.upsample.conv", stage), VAE_C, VAE_C, 1, stage);
        }
        for b in 0..3 {
            push_block(&mut t, &format!("decoder.up.{}.block.{}", stage, b), 10 + stage * 3 + b);
        }
    }
    push_norm(&mut t, "decoder.norm_out");
    push_conv(&mut t, "decoder.conv_out", 3, VAE_C, 3, 9);
    t
}

fn tiny_config() -> PipelineConfig {
    PipelineConfig {
        text_encoder: TextEncoderConfig {
            num_layers: 1,
            ..TextEncoderConfig::default()
        },
        decoder: DecoderConfig {
            num_groups: 4,
            ..DecoderConfig::default()
        },
        ..PipelineConfig::default()
    }
}

fn write_model_dir(dir: &Path) {
    WeightStore::write(dir.join(text_encoder::WEIGHTS_FILE), &clip_tensors()).unwrap();
    WeightStore::write(dir.join(unet::WEIGHTS_FILE), &unet_tensors()).unwrap();
    WeightStore::write(dir.join(vae::WEIGHTS_FILE), &vae_tensors()).unwrap();
    std::fs::write(
        dir.join("vocab.txt"),
        "<|startoftext|> 1\n<|endoftext|> 2\nc 3\na 4\nt 5\nca 6\ncat 7\n",
    )
    .unwrap();
    std::fs::write(dir.join("merges.txt"), "#version: 0.2\nc a\nca t\n").unwrap();
    std::fs::write(
        dir.join("pipeline.json"),
        serde_json::to_string_pretty(&tiny_config()).unwrap(),
    )
    .unwrap();
}

fn small(prompt: &str) -> GenerationRequest {
    GenerationRequest::new(prompt).with_mode(Mode::Small).with_steps(3)
}

#[test]
fn test_generate_small_image() {
    let dir = tempfile::tempdir().unwrap();
    write_model_dir(dir.path());

    let ctx = PipelineContext::init(dir.path()).unwrap();
    assert_eq!(ctx.config(), &tiny_config());
    assert_eq!(ctx.text_encoder().hidden_size(), D);

    let image = ctx.generate(&small("a cat")).unwrap();
    assert_eq!((image.width(), image.height()), (32, 32));
    assert_eq!(image.rgba().len(), 32 * 32 * 4);
    assert!(image.rgba().chunks_exact(4).all(|px| px[3] == 255));

    let path = dir.path().join("cat.png");
    image.save_png(&path).unwrap();
    assert!(path.exists());
}

#[test]
fn test_generation_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    write_model_dir(dir.path());
    let ctx = PipelineContext::init(dir.path()).unwrap();

    let a = ctx.generate(&small("cat").with_seed(7)).unwrap();
    let b = ctx.generate(&small("cat").with_seed(7)).unwrap();
    assert_eq!(a, b);

    let c = ctx.generate(&small("cat").with_seed(8)).unwrap();
    assert_ne!(a, c);
}

#[test]
fn test_single_and_zero_steps() {
    let dir = tempfile::tempdir().unwrap();
    write_model_dir(dir.path());
    let ctx = PipelineContext::init(dir.path()).unwrap();

    let mut calls = Vec::new();
    let one = ctx
        .generate_with_progress(&small("cat").with_steps(1), |done, total| calls.push((done, total)))
        .unwrap();
    assert_eq!(calls, vec![(1, 1)]);
    assert_eq!((one.width(), one.height()), (32, 32));

    // Zero steps runs one step
    let zero = ctx.generate(&small("cat").with_steps(0)).unwrap();
    assert_eq!(zero, one);
}

#[test]
fn test_progress_counts_every_step() {
    let dir = tempfile::tempdir().unwrap();
    write_model_dir(dir.path());
    let ctx = PipelineContext::init(dir.path()).unwrap();

    let mut seen = Vec::new();
    ctx.generate_with_progress(&small("cat").with_steps(4), |done, total| seen.push((done, total)))
        .unwrap();
    assert_eq!(seen, vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
}

#[test]
fn test_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    write_model_dir(dir.path());

    let mut pipeline = Pipeline::new();
    match pipeline.generate(&small("cat")).unwrap_err() {
        SdError::NotReady => (),
        other => panic!("Expected NotReady, got: {:?}", other),
    }

    pipeline.init(dir.path()).unwrap();
    assert!(pipeline.is_ready());
    assert_eq!(pipeline.model_dir(), Some(dir.path()));
    assert!(!pipeline.generate_or_empty(&small("cat")).is_empty());

    pipeline.free();
    assert!(!pipeline.is_ready());
    assert!(pipeline.generate_or_empty(&small("cat")).is_empty());
    assert!(matches!(pipeline.generate(&small("cat")), Err(SdError::NotReady)));
}

#[test]
fn test_corrupted_dtype_fails_init() {
    let dir = tempfile::tempdir().unwrap();
    write_model_dir(dir.path());

    // Append a record with dtype 1 to the noise predictor blob
    let mut record = Vec::new();
    let name = b"up_blocks.9.conv.weight";
    record.extend_from_slice(&(name.len() as u32).to_le_bytes());
    record.extend_from_slice(name);
    record.extend_from_slice(&1u32.to_le_bytes());
    record.extend_from_slice(&1u32.to_le_bytes());
    record.extend_from_slice(&1u32.to_le_bytes());
    record.extend_from_slice(&[0u8; 2]);
    let mut file = OpenOptions::new()
        .append(true)
        .open(dir.path().join(unet::WEIGHTS_FILE))
        .unwrap();
    file.write_all(&record).unwrap();
    drop(file);

    match PipelineContext::init(dir.path()).unwrap_err() {
        SdError::Format { reason, .. } => assert!(reason.contains("dtype"), "{}", reason),
        other => panic!("Expected Format, got: {:?}", other),
    }

    let mut pipeline = Pipeline::new();
    assert!(pipeline.init(dir.path()).is_err());
    assert!(!pipeline.is_ready());
}

#[test]
fn test_missing_vocab_fails_init() {
    let dir = tempfile::tempdir().unwrap();
    write_model_dir(dir.path());
    std::fs::remove_file(dir.path().join("vocab.txt")).unwrap();

    assert!(matches!(PipelineContext::init(dir.path()), Err(SdError::Io(_))));
}

#[test]
fn test_reinit_after_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = Pipeline::new();
    assert!(pipeline.init(dir.path()).is_err());

    write_model_dir(dir.path());
    pipeline.init(dir.path()).unwrap();
    assert!(pipeline.is_ready());
}

#[test]
fn test_shared_pipeline_across_threads() {
    let dir = tempfile::tempdir().unwrap();
    write_model_dir(dir.path());

    let shared = SharedPipeline::new();
    shared.init(dir.path()).unwrap();

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let shared = shared.clone();
            std::thread::spawn(move || shared.generate(&small("cat").with_seed(11)).unwrap())
        })
        .collect();
    let images: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(images.windows(2).all(|w| w[0] == w[1]));

    shared.free();
    assert!(!shared.is_ready());
    assert!(shared.generate_or_empty(&small("cat")).is_empty());
}
