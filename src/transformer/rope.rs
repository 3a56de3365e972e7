// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rotary position embeddings (`RoPE`).
//!
//! Pre-computes `cos` and `sin` tables at load time, with optional
//! frequency scaling, and rotates query/key tensors at a position offset so
//! that cached keys keep their original encoding.

use candle_core::{DType, Device, Tensor};

use crate::config::{RopeScaling, TransformerConfig};
use crate::error::Result;

/// Pre-computed cosine and sine tables.
pub struct RopeCache {
    /// Cosine values: `[max_position, head_dim / 2]`.
    cos: Tensor,
    /// Sine values: `[max_position, head_dim / 2]`.
    sin: Tensor,
}

impl RopeCache {
    /// Pre-compute the tables for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Model`](crate::ProbeError::Model) on tensor
    /// operation failures.
    pub fn new(config: &TransformerConfig, device: &Device, dtype: DType) -> Result<Self> {
        let head_dim = config.head_dim;
        let half_dim = head_dim / 2;
        let max_position = config.max_position_embeddings;

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let base: Vec<f64> = (0..half_dim)
            .map(|i| 1.0 / config.rope_theta.powf(2.0 * i as f64 / head_dim as f64))
            .collect();

        let inv_freq: Vec<f32> = scale_frequencies(base, config.rope_scaling)
            .into_iter()
            .map(|f| {
                // Safe: f64 -> f32 truncation is intentional for RoPE frequencies
                #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
                let f32_freq = f as f32;
                f32_freq
            })
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let positions: Vec<f32> = (0..max_position).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (max_position, 1), device)?;

        // Outer product: [max_position, half_dim]
        let freqs = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    /// Rotate a query or key tensor whose first position is `start_pos`.
    ///
    /// # Shapes
    /// - `x`: `[batch, n_heads, seq_len, head_dim]`
    /// - returns: `[batch, n_heads, seq_len, head_dim]`
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Model`](crate::ProbeError::Model) if
    /// `start_pos + seq_len` exceeds the table length.
    pub fn apply(&self, x: &Tensor, start_pos: usize) -> Result<Tensor> {
        let (_, _, seq_len, head_dim) = x.dims4()?;
        let half_dim = head_dim / 2;

        let cos = self.cos.narrow(0, start_pos, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;

        let x1 = x.narrow(candle_core::D::Minus1, 0, half_dim)?;
        let x2 = x.narrow(candle_core::D::Minus1, half_dim, half_dim)?;

        // [x1*cos - x2*sin, x1*sin + x2*cos]
        let rotated_x1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let rotated_x2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;

        Ok(Tensor::cat(&[&rotated_x1, &rotated_x2], candle_core::D::Minus1)?)
    }
}

/// Apply `rope_scaling` to the base inverse frequencies.
fn scale_frequencies(inv_freq: Vec<f64>, scaling: Option<RopeScaling>) -> Vec<f64> {
    match scaling {
        None => inv_freq,
        Some(RopeScaling::Linear { factor }) => inv_freq.into_iter().map(|f| f / factor).collect(),
        Some(RopeScaling::Llama3 {
            factor,
            low_freq_factor,
            high_freq_factor,
            original_max_position_embeddings,
        }) => {
            #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
            let original = original_max_position_embeddings as f64;
            let low_freq_wavelen = original / low_freq_factor;
            let high_freq_wavelen = original / high_freq_factor;
            inv_freq
                .into_iter()
                .map(|freq| {
                    let wavelen = 2.0 * std::f64::consts::PI / freq;
                    if wavelen < high_freq_wavelen {
                        freq
                    } else if wavelen > low_freq_wavelen {
                        freq / factor
                    } else {
                        let smooth = (original / wavelen - low_freq_factor)
                            / (high_freq_factor - low_freq_factor);
                        (1.0 - smooth) * freq / factor + smooth * freq
                    }
                })
                .collect()
        }
    }
}
