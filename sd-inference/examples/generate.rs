//! Generate one image from a text prompt.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example generate -- \
//!     --model-dir models/sd --prompt "a lighthouse at dusk" --steps 20 --mode large
//! ```

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;

use sd_inference::config::{GenerationRequest, Mode};
use sd_inference::pipeline::PipelineContext;

#[derive(Parser)]
#[command(name = "sd-generate", about = "CPU text-to-image generation")]
struct Args {
    /// Directory holding the weight blobs, vocab.txt and merges.txt
    #[arg(short, long)]
    model_dir: PathBuf,

    /// Text prompt
    #[arg(short, long)]
    prompt: String,

    /// Denoising steps
    #[arg(short, long, default_value = "20")]
    steps: usize,

    /// Output size: small (32 px) or large (512 px)
    #[arg(long, default_value = "large")]
    mode: String,

    /// Seed of the initial latent noise
    #[arg(long, default_value = "1234")]
    seed: u64,

    /// Guidance scale (accepted, not applied)
    #[arg(short, long, default_value = "7.5")]
    guidance: f32,

    /// Output PNG path
    #[arg(short, long, default_value = "output.png")]
    output: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let mode: Mode = args.mode.parse()?;

    let start = Instant::now();
    let ctx = PipelineContext::init(&args.model_dir)?;
    println!("Loaded pipeline in {:.2}s", start.elapsed().as_secs_f64());

    let mut request = GenerationRequest::new(args.prompt)
        .with_steps(args.steps)
        .with_mode(mode)
        .with_seed(args.seed);
    request.guidance = args.guidance;

    let start = Instant::now();
    let image = ctx.generate_with_progress(&request, |done, total| {
        eprint!("\rstep {}/{}", done, total);
    })?;
    eprintln!();
    println!(
        "Generated {}x{} in {:.2}s",
        image.width(),
        image.height(),
        start.elapsed().as_secs_f64()
    );

    image.save_png(&args.output)?;
    println!("Saved {}", args.output.display());
    Ok(())
}
