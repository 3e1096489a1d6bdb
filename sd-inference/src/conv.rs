//! Convolution, group normalization and resampling over [`Latent`] maps.
//!
//! Shared by the noise predictor and the image decoder. All kernels are
//! direct loops over channel-major data.

use crate::error::{Result, SdError};
use crate::latent::Latent;
use crate::loader::WeightStore;
use crate::tensor::Tensor;

/// 2-D correlation with "same" zero padding.
///
/// Weight layout is `[out_channels, in_channels, k, k]`. Output pixel `(y, x)`
/// reads input taps `(y + ky - k/2, x + kx - k/2)`; taps outside the map are
/// skipped, so spatial size is preserved for any kernel size.
#[derive(Debug, Clone)]
pub struct Conv2d {
    weight: Vec<f32>,
    bias: Vec<f32>,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
}

impl Conv2d {
    /// Bind a weight and an optional bias. A missing bias is zeros.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the weight is not `[O, I, k, k]` with a square
    /// non-empty kernel, or the bias length is not `O`.
    pub fn new(weight: &Tensor, bias: Option<&Tensor>) -> Result<Self> {
        let (out_channels, in_channels, kernel) = match weight.shape() {
            &[o, i, kh, kw] if kh == kw && kh > 0 => (o, i, kh),
            other => {
                return Err(SdError::ShapeMismatch {
                    expected: vec![0, 0, 0, 0], // Expect [O, I, k, k]
                    got: other.to_vec(),
                })
            }
        };

        let bias = match bias {
            Some(b) if b.numel() == out_channels => b.data().to_vec(),
            Some(b) => {
                return Err(SdError::ShapeMismatch {
                    expected: vec![out_channels],
                    got: b.shape().to_vec(),
                })
            }
            None => vec![0.0; out_channels],
        };

        Ok(Self {
            weight: weight.data().to_vec(),
            bias,
            in_channels,
            out_channels,
            kernel,
        })
    }

    /// Load `{prefix}.weight` and `{prefix}.bias`, both required.
    pub fn load(weights: &WeightStore, prefix: &str) -> Result<Self> {
        let w = weights.require(&format!("{}.weight", prefix))?;
        let b = weights.require(&format!("{}.bias", prefix))?;
        Self::new(w, Some(b))
    }

    /// Load `{prefix}.weight` and, if present, `{prefix}.bias`.
    pub fn load_optional_bias(weights: &WeightStore, prefix: &str) -> Result<Self> {
        let w = weights.require(&format!("{}.weight", prefix))?;
        let b = weights.get(&format!("{}.bias", prefix));
        Self::new(w, b)
    }

    /// Input channel count.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Output channel count.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Kernel edge.
    pub fn kernel_size(&self) -> usize {
        self.kernel
    }

    /// Convolve `[in_channels, H, W]` into `[out_channels, H, W]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the input channel count differs.
    pub fn forward(&self, x: &Latent) -> Result<Latent> {
        if x.channels != self.in_channels {
            return Err(SdError::ShapeMismatch {
                expected: vec![self.in_channels, x.height, x.width],
                got: x.shape().to_vec(),
            });
        }

        let (h, w, k) = (x.height, x.width, self.kernel);
        let pad = k / 2;
        let plane = h * w;
        let mut out = Latent::zeros(self.out_channels, h, w);

        for (co, out_plane) in out.data.chunks_exact_mut(plane.max(1)).enumerate().take(self.out_channels) {
            out_plane.fill(self.bias[co]);
            for ci in 0..self.in_channels {
                let in_plane = x.channel(ci);
                let w_base = (co * self.in_channels + ci) * k * k;
                for ky in 0..k {
                    // Rows y where iy = y + ky - pad lies in [0, h)
                    let y_lo = pad.saturating_sub(ky);
                    let y_hi = (h + pad).saturating_sub(ky).min(h);
                    for kx in 0..k {
                        let wv = self.weight[w_base + ky * k + kx];
                        if wv == 0.0 {
                            continue;
                        }
                        let x_lo = pad.saturating_sub(kx);
                        let x_hi = (w + pad).saturating_sub(kx).min(w);
                        if x_lo >= x_hi {
                            continue;
                        }
                        for y in y_lo..y_hi {
                            let iy = y + ky - pad;
                            let src = &in_plane[iy * w + x_lo + kx - pad..iy * w + x_hi + kx - pad];
                            let dst = &mut out_plane[y * w + x_lo..y * w + x_hi];
                            for (d, s) in dst.iter_mut().zip(src) {
                                *d += wv * s;
                            }
                        }
                    }
                }
            }
        }

        Ok(out)
    }
}

/// Group normalization with per-location statistics.
///
/// Channels are split into `num_groups` equal groups. At every spatial
/// location, each group is normalized by the population mean and variance of
/// its channels there, then scaled and shifted per channel.
#[derive(Debug, Clone)]
pub struct GroupNorm {
    weight: Vec<f32>,
    bias: Vec<f32>,
    num_groups: usize,
    eps: f32,
}

impl GroupNorm {
    /// Bind scale and shift for `weight.numel()` channels.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the lengths differ and `Model` if the channel
    /// count is not a positive multiple of `num_groups`.
    pub fn new(weight: &Tensor, bias: &Tensor, num_groups: usize, eps: f32) -> Result<Self> {
        if weight.numel() != bias.numel() {
            return Err(SdError::ShapeMismatch {
                expected: weight.shape().to_vec(),
                got: bias.shape().to_vec(),
            });
        }
        let channels = weight.numel();
        if num_groups == 0 || channels == 0 || channels % num_groups != 0 {
            return Err(SdError::Model(format!(
                "group norm: {} channels not divisible into {} groups",
                channels, num_groups
            )));
        }
        Ok(Self {
            weight: weight.data().to_vec(),
            bias: bias.data().to_vec(),
            num_groups,
            eps,
        })
    }

    /// Load `{prefix}.weight` and `{prefix}.bias`.
    pub fn load(weights: &WeightStore, prefix: &str, num_groups: usize, eps: f32) -> Result<Self> {
        let w = weights.require(&format!("{}.weight", prefix))?;
        let b = weights.require(&format!("{}.bias", prefix))?;
        Self::new(w, b, num_groups, eps)
    }

    /// Channel count.
    pub fn channels(&self) -> usize {
        self.weight.len()
    }

    /// Normalize a `[C, H, W]` map.
    pub fn forward(&self, x: &Latent) -> Result<Latent> {
        let channels = self.channels();
        if x.channels != channels {
            return Err(SdError::ShapeMismatch {
                expected: vec![channels, x.height, x.width],
                got: x.shape().to_vec(),
            });
        }

        let per_group = channels / self.num_groups;
        let plane = x.plane();
        let mut out = x.clone();

        for g in 0..self.num_groups {
            let c0 = g * per_group;
            for p in 0..plane {
                let mut sum = 0.0f64;
                let mut sum_sq = 0.0f64;
                for c in c0..c0 + per_group {
                    let v = x.data[c * plane + p] as f64;
                    sum += v;
                    sum_sq += v * v;
                }
                let mean = sum / per_group as f64;
                let var = (sum_sq / per_group as f64 - mean * mean).max(0.0);
                let inv_std = 1.0 / (var + self.eps as f64).sqrt();

                for c in c0..c0 + per_group {
                    let idx = c * plane + p;
                    let norm = ((x.data[idx] as f64 - mean) * inv_std) as f32;
                    out.data[idx] = norm * self.weight[c] + self.bias[c];
                }
            }
        }

        Ok(out)
    }
}

/// Nearest-neighbor resize to `(out_h, out_w)`.
pub fn upsample_nearest(x: &Latent, out_h: usize, out_w: usize) -> Latent {
    let mut out = Latent::zeros(x.channels, out_h, out_w);
    if x.height == 0 || x.width == 0 {
        return out;
    }
    for c in 0..x.channels {
        let src = x.channel(c);
        let dst = &mut out.data[c * out_h * out_w..(c + 1) * out_h * out_w];
        for y in 0..out_h {
            let sy = y * x.height / out_h;
            for xx in 0..out_w {
                let sx = xx * x.width / out_w;
                dst[y * out_w + xx] = src[sy * x.width + sx];
            }
        }
    }
    out
}

/// 2× nearest-neighbor upsample.
pub fn upsample2x(x: &Latent) -> Latent {
    upsample_nearest(x, x.height * 2, x.width * 2)
}

/// 2× average pooling, output `ceil(H/2) × ceil(W/2)`.
///
/// Edge windows average only their in-bounds taps.
pub fn avg_pool2x(x: &Latent) -> Latent {
    let out_h = x.height.div_ceil(2);
    let out_w = x.width.div_ceil(2);
    let mut out = Latent::zeros(x.channels, out_h, out_w);

    for c in 0..x.channels {
        let src = x.channel(c);
        for y in 0..out_h {
            for xx in 0..out_w {
                let mut sum = 0.0f32;
                let mut n = 0usize;
                for sy in 2 * y..(2 * y + 2).min(x.height) {
                    for sx in 2 * xx..(2 * xx + 2).min(x.width) {
                        sum += src[sy * x.width + sx];
                        n += 1;
                    }
                }
                out.data[(c * out_h + y) * out_w + xx] = sum / n as f32;
            }
        }
    }
    out
}
