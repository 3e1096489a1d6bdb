//! Error types for sd-inference.
//!
//! Every failure mode of the pipeline is one variant here:
//! - IO errors (weight blobs, vocabulary and merge files)
//! - Format errors (malformed tensor blob records)
//! - Shape errors (a tensor disagrees with what a consuming block expects)
//! - State errors (generation requested on an unready pipeline)
//! - Config errors (pipeline.json, request parameters)

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for sd-inference.
///
/// All library functions return `Result<T, SdError>`.
/// No panics in library code - all failures go through this error type.
#[derive(Error, Debug)]
pub enum SdError {
    /// Shape mismatch between tensors or operations.
    ///
    /// Example: a convolution expects 320 input channels but receives 4.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Expected shape dimensions
        expected: Vec<usize>,
        /// Actual shape dimensions received
        got: Vec<usize>,
    },

    /// IO operation failed.
    ///
    /// Wraps standard library IO errors (file not found, read failures, etc).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed record in a tensor blob.
    ///
    /// `offset` is the byte position where the bad record started.
    #[error("Format error in {path} at byte {offset}: {reason}")]
    Format {
        /// Blob that failed to parse
        path: PathBuf,
        /// Byte offset of the offending record
        offset: usize,
        /// What was wrong with it
        reason: String,
    },

    /// SafeTensors parsing error (converter only).
    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    /// A tensor a stage needs is not present in its weight blob.
    #[error("Missing tensor: {0}")]
    MissingTensor(String),

    /// Tokenizer files are unusable.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// JSON parsing error.
    ///
    /// Wraps serde_json errors when parsing `pipeline.json`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration or request parameter out of range.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Model structure error.
    ///
    /// Example: channel count not divisible by the group-norm group count.
    #[error("Model error: {0}")]
    Model(String),

    /// Pipeline used before `init` succeeded, or after `free`.
    #[error("Pipeline not ready: call init first")]
    NotReady,

    /// Image encoding failed while writing output.
    #[error("Image error: {0}")]
    Image(String),
}

/// Result type alias for sd-inference.
pub type Result<T> = std::result::Result<T, SdError>;
