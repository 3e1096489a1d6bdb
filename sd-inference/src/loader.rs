//! Tensor blob weight store.
//!
//! Each pipeline stage ships its weights as one flat binary file of named
//! float32 tensors. The file is a sequence of records, read until end-of-file:
//!
//! ```text
//! u32 name_len | name[name_len] | u32 ndims | u32 dims[ndims] | u32 dtype | f32 data[product(dims)]
//! ```
//!
//! All integers and floats are little-endian. Only `dtype == 0` (float32) is
//! accepted. The first malformed record ends parsing: [`WeightStore::load`]
//! keeps what came before it and records the fault, [`WeightStore::open`]
//! turns the fault into an error.
//!
//! # Example
//!
//! ```rust,no_run
//! use sd_inference::loader::WeightStore;
//!
//! let weights = WeightStore::open("models/sd/clip_weights.bin")?;
//! let embed = weights.require("text_model.embeddings.token_embedding.weight")?;
//! println!("token table {:?}", embed.shape());
//! # Ok::<(), sd_inference::error::SdError>(())
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, error};

use crate::error::{Result, SdError};
use crate::tensor::Tensor;

/// Longest tensor name accepted in a blob record.
pub const MAX_NAME_LEN: usize = 10_000;

/// Highest rank accepted in a blob record.
pub const MAX_NDIMS: usize = 8;

/// The only supported record dtype (float32).
pub const DTYPE_F32: u32 = 0;

/// A tensor together with the name it was stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    /// Fully qualified parameter name, e.g. `decoder.conv_in.weight`.
    pub name: String,
    /// Shape and data.
    pub tensor: Tensor,
}

impl NamedTensor {
    /// Pair a name with a tensor.
    pub fn new(name: impl Into<String>, tensor: Tensor) -> Self {
        Self {
            name: name.into(),
            tensor,
        }
    }
}

/// Ordered list of named tensors read from one blob file.
///
/// Lookup is a linear scan over the records in file order; stage weight files
/// hold at most a few hundred tensors. When a name repeats, the first record wins.
#[derive(Debug)]
pub struct WeightStore {
    path: PathBuf,
    tensors: Vec<NamedTensor>,
    fault: Option<SdError>,
}

impl WeightStore {
    /// Read a blob without failing.
    ///
    /// A missing or unreadable file yields an empty store. A malformed record
    /// stops parsing and the tensors parsed before it are kept. In both cases
    /// the cause is logged and available through [`WeightStore::fault`].
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let (tensors, fault) = match read_blob(&path) {
            Ok(parsed) => parsed,
            Err(e) => (Vec::new(), Some(e)),
        };

        if let Some(e) = &fault {
            error!(path = %path.display(), kept = tensors.len(), "weight blob fault: {}", e);
        } else {
            debug!(path = %path.display(), tensors = tensors.len(), "loaded weight blob");
        }

        Self {
            path,
            tensors,
            fault,
        }
    }

    /// Read a blob, failing on any fault.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be opened or mapped, and `Format` for the
    /// first malformed record (bad dtype, zero dimension, rank outside `[1, 8]`,
    /// empty or oversized name, truncated data).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut store = Self::load(path);
        match store.fault.take() {
            Some(e) => Err(e),
            None => Ok(store),
        }
    }

    /// Build a store from tensors already in memory.
    pub fn from_tensors(tensors: Vec<NamedTensor>) -> Self {
        Self {
            path: PathBuf::new(),
            tensors,
            fault: None,
        }
    }

    /// Serialize tensors in blob format.
    ///
    /// # Errors
    ///
    /// Returns `Format` if a tensor cannot be represented (empty or oversized
    /// name, rank outside `[1, 8]`, a zero or >u32 dimension), or `Io` on write failure.
    pub fn write(path: impl AsRef<Path>, tensors: &[NamedTensor]) -> Result<()> {
        let path = path.as_ref();
        let mut out = BufWriter::new(File::create(path)?);
        let mut offset = 0usize;

        for nt in tensors {
            let reject = |reason: String| SdError::Format {
                path: path.to_path_buf(),
                offset,
                reason,
            };
            let name = nt.name.as_bytes();
            if name.is_empty() || name.len() > MAX_NAME_LEN {
                return Err(reject(format!("name length {} not representable", name.len())));
            }
            let shape = nt.tensor.shape();
            if shape.is_empty() || shape.len() > MAX_NDIMS {
                return Err(reject(format!("{}: rank {} not representable", nt.name, shape.len())));
            }

            out.write_all(&(name.len() as u32).to_le_bytes())?;
            out.write_all(name)?;
            out.write_all(&(shape.len() as u32).to_le_bytes())?;
            for &d in shape {
                let d32 = u32::try_from(d)
                    .ok()
                    .filter(|&d| d > 0)
                    .ok_or_else(|| reject(format!("{}: dimension {} not representable", nt.name, d)))?;
                out.write_all(&d32.to_le_bytes())?;
            }
            out.write_all(&DTYPE_F32.to_le_bytes())?;
            for v in nt.tensor.data() {
                out.write_all(&v.to_le_bytes())?;
            }

            offset += 4 + name.len() + 4 + 4 * shape.len() + 4 + 4 * nt.tensor.numel();
        }

        out.flush()?;
        debug!(path = %path.display(), tensors = tensors.len(), bytes = offset, "wrote weight blob");
        Ok(())
    }

    /// Look up a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors
            .iter()
            .find(|nt| nt.name == name)
            .map(|nt| &nt.tensor)
    }

    /// Look up a tensor a stage cannot run without.
    ///
    /// # Errors
    ///
    /// Returns `MissingTensor` if no record carries `name`.
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.get(name)
            .ok_or_else(|| SdError::MissingTensor(name.to_string()))
    }

    /// Look up a required tensor and check its shape.
    ///
    /// # Errors
    ///
    /// Returns `MissingTensor` if absent, `ShapeMismatch` if the shape differs.
    pub fn require_shape(&self, name: &str, expected: &[usize]) -> Result<&Tensor> {
        let t = self.require(name)?;
        if t.shape() != expected {
            return Err(SdError::ShapeMismatch {
                expected: expected.to_vec(),
                got: t.shape().to_vec(),
            });
        }
        Ok(t)
    }

    /// Whether a record named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// The fault that ended parsing, if any.
    pub fn fault(&self) -> Option<&SdError> {
        self.fault.as_ref()
    }

    /// Source file (empty for in-memory stores).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of tensors held.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether no tensors were read.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensor names in file order.
    pub fn tensor_names(&self) -> Vec<&str> {
        self.tensors.iter().map(|nt| nt.name.as_str()).collect()
    }

    /// All records in file order.
    pub fn tensors(&self) -> &[NamedTensor] {
        &self.tensors
    }

    /// Consume the store, returning its records.
    pub fn into_tensors(self) -> Vec<NamedTensor> {
        self.tensors
    }
}

/// Map a blob and parse it. Open/map failures are hard errors; record faults
/// come back alongside the tensors parsed so far.
fn read_blob(path: &Path) -> Result<(Vec<NamedTensor>, Option<SdError>)> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok((Vec::new(), None));
    }
    // SAFETY: the map is read-only and dropped before this function returns;
    // every tensor is copied out of it.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(parse_records(path, &mmap))
}

/// Byte cursor over a blob.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

fn parse_records(path: &Path, bytes: &[u8]) -> (Vec<NamedTensor>, Option<SdError>) {
    let mut reader = Reader { bytes, pos: 0 };
    let mut tensors = Vec::new();

    while !reader.at_end() {
        let start = reader.pos;
        match parse_record(&mut reader) {
            Ok(nt) => tensors.push(nt),
            Err(reason) => {
                let fault = SdError::Format {
                    path: path.to_path_buf(),
                    offset: start,
                    reason,
                };
                return (tensors, Some(fault));
            }
        }
    }

    (tensors, None)
}

fn parse_record(r: &mut Reader<'_>) -> std::result::Result<NamedTensor, String> {
    let name_len = r.u32().ok_or("truncated name length")? as usize;
    if name_len == 0 || name_len > MAX_NAME_LEN {
        return Err(format!("invalid name length {}", name_len));
    }
    let name_bytes = r.take(name_len).ok_or("truncated name")?;
    let name = String::from_utf8_lossy(name_bytes).into_owned();

    let ndims = r.u32().ok_or_else(|| format!("{}: truncated rank", name))? as usize;
    if ndims == 0 || ndims > MAX_NDIMS {
        return Err(format!("{}: invalid rank {}", name, ndims));
    }

    let mut shape = Vec::with_capacity(ndims);
    for _ in 0..ndims {
        let d = r.u32().ok_or_else(|| format!("{}: truncated shape", name))? as usize;
        if d == 0 {
            return Err(format!("{}: zero dimension", name));
        }
        shape.push(d);
    }

    let dtype = r.u32().ok_or_else(|| format!("{}: truncated dtype", name))?;
    if dtype != DTYPE_F32 {
        return Err(format!("{}: unsupported dtype {}", name, dtype));
    }

    let numel = shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| format!("{}: element count overflows", name))?;
    let byte_len = numel
        .checked_mul(4)
        .ok_or_else(|| format!("{}: byte count overflows", name))?;
    let raw = r
        .take(byte_len)
        .ok_or_else(|| format!("{}: truncated data ({} bytes expected)", name, byte_len))?;

    let data: Vec<f32> = raw
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let tensor = Tensor::new(data, shape).map_err(|e| format!("{}: {}", name, e))?;
    Ok(NamedTensor { name, tensor })
}
