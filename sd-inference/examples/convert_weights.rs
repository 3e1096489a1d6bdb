//! Convert a SafeTensors checkpoint to the pipeline's tensor blob format.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example convert_weights -- \
//!     --input vae.safetensors --output models/sd/vae_weights.bin --prefix decoder.
//! ```

use std::path::PathBuf;

use clap::Parser;

use sd_inference::convert::safetensors_to_blob;

#[derive(Parser)]
#[command(name = "sd-convert", about = "SafeTensors to f32 tensor blob")]
struct Args {
    /// Source .safetensors file
    #[arg(short, long)]
    input: PathBuf,

    /// Destination blob
    #[arg(short, long)]
    output: PathBuf,

    /// Keep only tensors whose name starts with this prefix
    #[arg(short, long)]
    prefix: Option<String>,
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
    let count = safetensors_to_blob(&args.input, &args.output, args.prefix.as_deref())?;
    println!("Wrote {} tensors to {}", count, args.output.display());
    Ok(())
}
