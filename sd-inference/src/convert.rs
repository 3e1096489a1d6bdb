//! SafeTensors to tensor-blob conversion.
//!
//! Checkpoints ship as `.safetensors`; the pipeline reads the flat f32 blob
//! format of [`crate::loader`]. F32, BF16 and F16 tensors are widened to f32.
//! Tensors are written sorted by name.

use std::path::Path;

use memmap2::Mmap;
use safetensors::SafeTensors;
use tracing::{debug, info, warn};

use crate::error::{Result, SdError};
use crate::loader::{NamedTensor, WeightStore};
use crate::tensor::Tensor;

/// Convert `src` to a blob at `dst`, keeping names that start with `prefix`.
///
/// Returns the number of tensors written.
///
/// # Errors
///
/// - `Io` if `src` cannot be read or `dst` cannot be written
/// - `SafeTensors` if the checkpoint is malformed, holds an unsupported
///   dtype, or nothing matches `prefix`
///
/// # Example
///
/// ```rust,no_run
/// use sd_inference::convert::safetensors_to_blob;
///
/// let n = safetensors_to_blob("vae.safetensors", "models/sd/vae_weights.bin", Some("decoder."))?;
/// println!("wrote {} tensors", n);
/// # Ok::<(), sd_inference::error::SdError>(())
/// ```
pub fn safetensors_to_blob(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    prefix: Option<&str>,
) -> Result<usize> {
    let src = src.as_ref();
    let tensors = read_safetensors(src, prefix)?;
    if tensors.is_empty() {
        return Err(SdError::SafeTensors(format!(
            "no tensors in {} match prefix {:?}",
            src.display(),
            prefix
        )));
    }
    WeightStore::write(dst.as_ref(), &tensors)?;
    info!(
        src = %src.display(),
        dst = %dst.as_ref().display(),
        count = tensors.len(),
        "converted checkpoint"
    );
    Ok(tensors.len())
}

/// Read every tensor of a SafeTensors file as f32, sorted by name.
pub fn read_safetensors(path: impl AsRef<Path>, prefix: Option<&str>) -> Result<Vec<NamedTensor>> {
    let file = std::fs::File::open(path.as_ref())?;
    // SAFETY: the map is read-only and dropped before this function returns.
    let mmap = unsafe { Mmap::map(&file)? };

    let st = SafeTensors::deserialize(&mmap)
        .map_err(|e| SdError::SafeTensors(format!("Failed to parse SafeTensors: {}", e)))?;

    let mut out = Vec::new();
    for (name, view) in st.tensors() {
        if let Some(p) = prefix {
            if !name.starts_with(p) {
                continue;
            }
        }
        let tensor = view_to_tensor(&name, &view)?;
        debug!(name = %name, shape = ?tensor.shape(), "tensor converted");
        out.push(NamedTensor::new(name, tensor));
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

fn view_to_tensor(name: &str, view: &safetensors::tensor::TensorView) -> Result<Tensor> {
    let mut shape = view.shape().to_vec();
    if shape.is_empty() {
        warn!(name, "scalar tensor stored as shape [1]");
        shape.push(1);
    }
    let num_elements = shape.iter().product::<usize>();
    let bytes = view.data();

    let (width, widen): (usize, fn(&[u8]) -> f32) = match view.dtype() {
        safetensors::Dtype::F32 => (4, |c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        safetensors::Dtype::BF16 => (2, |c| bf16_to_f32(u16::from_le_bytes([c[0], c[1]]))),
        safetensors::Dtype::F16 => (2, |c| f16_to_f32(u16::from_le_bytes([c[0], c[1]]))),
        other => {
            return Err(SdError::SafeTensors(format!(
                "Unsupported dtype {:?} for {}. Only F32, BF16 and F16 are supported.",
                other, name
            )))
        }
    };

    if bytes.len() != num_elements * width {
        return Err(SdError::SafeTensors(format!(
            "{}: size mismatch, expected {} bytes, got {}",
            name,
            num_elements * width,
            bytes.len()
        )));
    }

    let data = bytes.chunks_exact(width).map(widen).collect();
    Tensor::new(data, shape)
}

/// BF16 is the upper half of an f32.
fn bf16_to_f32(bits: u16) -> f32 {
    f32::from_bits((bits as u32) << 16)
}

/// IEEE 754 binary16 to binary32.
fn f16_to_f32(bits: u16) -> f32 {
    let sign = ((bits >> 15) as u32) << 31;
    let exp = ((bits >> 10) & 0x1f) as u32;
    let mant = (bits & 0x3ff) as u32;

    let out = match (exp, mant) {
        (0, 0) => sign,
        (0, m) => {
            // Subnormal: renormalize
            let mut e: i32 = -14;
            let mut m = m;
            while m & 0x400 == 0 {
                m <<= 1;
                e -= 1;
            }
            sign | (((e + 127) as u32) << 23) | ((m & 0x3ff) << 13)
        }
        (0x1f, 0) => sign | 0x7f80_0000,
        (0x1f, m) => sign | 0x7f80_0000 | (m << 13),
        (e, m) => sign | ((e + 112) << 23) | (m << 13),
    };
    f32::from_bits(out)
}
