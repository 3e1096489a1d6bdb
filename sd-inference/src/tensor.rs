//! Core tensor type for the text encoder's dense math.
//!
//! Storage is always row-major `f32`: blobs only carry float32, and every
//! kernel in the pipeline computes in float32. Convolution paths use
//! [`crate::latent::Latent`] instead, which names its three axes.
//!
//! # Example
//!
//! ```rust
//! use sd_inference::tensor::Tensor;
//!
//! let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap();
//! assert_eq!(t.shape(), &[2, 3]);
//! assert_eq!(t.numel(), 6);
//! assert_eq!(t.ndim(), 2);
//! ```

use crate::error::{Result, SdError};

/// Multi-dimensional float32 tensor with a row-major layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
}

impl Tensor {
    /// Create a tensor from data and shape.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the product of shape dimensions doesn't match data length.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(SdError::ShapeMismatch {
                expected: vec![numel],
                got: vec![data.len()],
            });
        }
        Ok(Tensor { data, shape })
    }

    /// Zero-filled tensor of the given shape.
    pub fn zeros(shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Tensor {
            data: vec![0.0; numel],
            shape: shape.to_vec(),
        }
    }

    /// Tensor dimensions.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Flat row-major view of the data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable flat view of the data.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consume the tensor, returning its flat data.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Row `i` of a 2D tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is not 2D or `i` is out of range.
    pub fn row(&self, i: usize) -> Result<&[f32]> {
        let (rows, cols) = self.dims2()?;
        if i >= rows {
            return Err(SdError::Model(format!(
                "row {} out of range for tensor with {} rows",
                i, rows
            )));
        }
        Ok(&self.data[i * cols..(i + 1) * cols])
    }

    /// Reshape without copying semantics changes (same element count).
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the element counts differ.
    pub fn reshape(&self, new_shape: &[usize]) -> Result<Tensor> {
        let numel: usize = new_shape.iter().product();
        if numel != self.numel() {
            return Err(SdError::ShapeMismatch {
                expected: vec![self.numel()],
                got: vec![numel],
            });
        }
        Ok(Tensor {
            data: self.data.clone(),
            shape: new_shape.to_vec(),
        })
    }

    /// `(rows, cols)` of a 2D tensor.
    pub fn dims2(&self) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            &[r, c] => Ok((r, c)),
            other => Err(SdError::ShapeMismatch {
                expected: vec![0, 0], // Expect 2D
                got: other.to_vec(),
            }),
        }
    }

    /// Transpose a 2D tensor: `[M, N] -> [N, M]`.
    pub fn transpose(&self) -> Result<Tensor> {
        let (m, n) = self.dims2()?;
        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                out[j * m + i] = self.data[i * n + j];
            }
        }
        Tensor::new(out, vec![n, m])
    }

    /// 2D matrix multiplication: `[M, K] @ [K, N] -> [M, N]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if either operand is not 2D or the inner dimensions differ.
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        let (m, k_lhs) = self.dims2()?;
        let (k_rhs, n) = rhs.dims2()?;
        if k_lhs != k_rhs {
            return Err(SdError::ShapeMismatch {
                expected: vec![m, k_rhs, k_rhs, n],
                got: vec![m, k_lhs, k_rhs, n],
            });
        }
        let data = matmul_2d(&self.data, &rhs.data, m, k_lhs, n);
        Tensor::new(data, vec![m, n])
    }

    /// Element-wise addition of a same-shaped tensor.
    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        if self.shape != rhs.shape {
            return Err(SdError::ShapeMismatch {
                expected: self.shape.clone(),
                got: rhs.shape.clone(),
            });
        }
        let data = self
            .data
            .iter()
            .zip(rhs.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Tensor::new(data, self.shape.clone())
    }

    /// In-place element-wise addition.
    pub fn add_assign(&mut self, rhs: &Tensor) -> Result<()> {
        if self.shape != rhs.shape {
            return Err(SdError::ShapeMismatch {
                expected: self.shape.clone(),
                got: rhs.shape.clone(),
            });
        }
        for (a, b) in self.data.iter_mut().zip(rhs.data.iter()) {
            *a += b;
        }
        Ok(())
    }

    /// Multiply every element by a scalar.
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        self.map(|v| v * scalar)
    }

    /// Apply `f` to every element.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            data: self.data.iter().map(|&v| f(v)).collect(),
            shape: self.shape.clone(),
        }
    }

    /// Softmax over the last dimension.
    ///
    /// Rows are max-shifted before exponentiation, and the normalizer carries a
    /// `1e-9` guard so an all-masked row yields zeros rather than NaN.
    pub fn softmax_last_dim(&self) -> Result<Tensor> {
        let last = *self.shape.last().ok_or_else(|| SdError::ShapeMismatch {
            expected: vec![1],
            got: vec![],
        })?;
        let mut data = self.data.clone();
        if last == 0 {
            return Tensor::new(data, self.shape.clone());
        }
        for row in data.chunks_exact_mut(last) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for v in row.iter_mut() {
                *v = if max == f32::NEG_INFINITY {
                    0.0
                } else {
                    (*v - max).exp()
                };
                sum += *v;
            }
            let inv = 1.0 / (sum + 1e-9);
            for v in row.iter_mut() {
                *v *= inv;
            }
        }
        Tensor::new(data, self.shape.clone())
    }

    /// Mean over the first axis of a 2D tensor: `[T, D] -> [D]`.
    pub fn mean_rows(&self) -> Result<Vec<f32>> {
        let (rows, cols) = self.dims2()?;
        if rows == 0 {
            return Err(SdError::Model("cannot pool an empty sequence".into()));
        }
        let mut out = vec![0.0f32; cols];
        if cols == 0 {
            return Ok(out);
        }
        for row in self.data.chunks_exact(cols) {
            for (o, v) in out.iter_mut().zip(row) {
                *o += v;
            }
        }
        let inv = 1.0 / rows as f32;
        for o in out.iter_mut() {
            *o *= inv;
        }
        Ok(out)
    }
}

/// GELU, tanh approximation.
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044715 * x * x * x)).tanh())
}

/// SiLU (swish): `x * sigmoid(x)`.
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// 2D matrix multiplication over flat row-major slices.
///
/// PERF: i-k-j loop order keeps the inner loop streaming over contiguous rows
/// of both `rhs` and the output. No blocking, no SIMD.
fn matmul_2d(lhs: &[f32], rhs: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut result = vec![0.0f32; m * n];
    for i in 0..m {
        let out_row = &mut result[i * n..(i + 1) * n];
        for k_idx in 0..k {
            let a = lhs[i * k + k_idx];
            if a == 0.0 {
                continue;
            }
            let rhs_row = &rhs[k_idx * n..(k_idx + 1) * n];
            for (o, b) in out_row.iter_mut().zip(rhs_row) {
                *o += a * b;
            }
        }
    }
    result
}
