// SPDX-License-Identifier: MIT OR Apache-2.0

//! Additive attention masks.
//!
//! Masks are `0.0` where attention is allowed and `-inf` elsewhere, shaped
//! `[1, 1, seq_q, seq_k]` so they broadcast over batch and heads.

use candle_core::{DType, Device, Tensor};

use crate::error::Result;

/// Build a causal mask for `seq_q` new queries attending over `seq_k` keys.
///
/// When `seq_k > seq_q` the first `seq_k - seq_q` keys are cached context
/// and every query may see all of them.  With `sliding_window = Some(w)`, a
/// query at absolute position `p` additionally cannot see keys at positions
/// `<= p - w`.
///
/// # Shapes
/// - returns: `[1, 1, seq_q, seq_k]`
///
/// # Errors
///
/// Returns [`ProbeError::Model`](crate::ProbeError::Model) on tensor
/// creation failure.
pub fn causal_mask(
    seq_q: usize,
    seq_k: usize,
    sliding_window: Option<usize>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let offset = seq_k.saturating_sub(seq_q);
    let mask: Vec<f32> = (0..seq_q)
        .flat_map(|i| {
            let pos = offset + i;
            (0..seq_k).map(move |j| {
                let future = j > pos;
                let outside_window = sliding_window.is_some_and(|w| pos - j.min(pos) >= w);
                if future || outside_window {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, seq_q, seq_k), device)?.to_dtype(dtype)?)
}

/// Whether `causal_mask` would mask anything at all.
///
/// A single query over a cache without a sliding window needs no mask.
#[must_use]
pub fn needs_mask(seq_q: usize, seq_k: usize, sliding_window: Option<usize>) -> bool {
    seq_q > 1 || sliding_window.is_some_and(|w| seq_k > w)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn rows(t: &Tensor) -> Vec<Vec<f32>> {
        t.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap()
    }

    #[test]
    fn square_mask_is_lower_triangular() {
        let m = rows(&causal_mask(3, 3, None, &Device::Cpu, DType::F32).unwrap());
        assert_eq!(m[0][0], 0.0);
        assert!(m[0][1].is_infinite());
        assert!(m[0][2].is_infinite());
        assert_eq!(m[2][0], 0.0);
        assert_eq!(m[2][2], 0.0);
    }

    #[test]
    fn cached_keys_are_visible() {
        // Two new queries after three cached positions.
        let m = rows(&causal_mask(2, 5, None, &Device::Cpu, DType::F32).unwrap());
        assert_eq!(m[0][..4], [0.0, 0.0, 0.0, 0.0]);
        assert!(m[0][4].is_infinite());
        assert!(m[1].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn sliding_window_hides_old_keys() {
        let m = rows(&causal_mask(4, 4, Some(2), &Device::Cpu, DType::F32).unwrap());
        // Query 3 sees keys 2 and 3 only.
        assert!(m[3][0].is_infinite());
        assert!(m[3][1].is_infinite());
        assert_eq!(m[3][2], 0.0);
        assert_eq!(m[3][3], 0.0);
    }

    #[test]
    fn single_query_needs_no_mask() {
        assert!(!needs_mask(1, 10, None));
        assert!(needs_mask(2, 2, None));
        assert!(needs_mask(1, 10, Some(4)));
    }
}
