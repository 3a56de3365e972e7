// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key/value cache for autoregressive decoding.
//!
//! After the prompt is processed once, each decoding step feeds a single
//! token; the keys and values of earlier positions are read back from this
//! cache instead of being recomputed.
//!
//! ## Memory layout
//!
//! Each layer stores, **before** grouped-query expansion:
//! - keys: `[batch, num_kv_heads, seq_len, head_dim]`
//! - values: `[batch, num_kv_heads, seq_len, head_dim]`
//!
//! For Llama 3.1 8B in BF16 (8 KV heads, head dim 128, 32 layers) that is
//! 8 * 128 * 2 (k+v) * 2 bytes * 32 = 128 KiB per token.

use candle_core::Tensor;

use crate::error::{ProbeError, Result};

/// Per-layer key/value cache.
///
/// # Shapes
///
/// - `keys[i]`: `[batch, num_kv_heads, seq_len, head_dim]`
/// - `values[i]`: `[batch, num_kv_heads, seq_len, head_dim]`
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Cached keys per layer.
    keys: Vec<Option<Tensor>>,
    /// Cached values per layer.
    values: Vec<Option<Tensor>>,
}

impl KvCache {
    /// Create an empty cache for `n_layers` layers.
    #[must_use]
    pub fn new(n_layers: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            values: vec![None; n_layers],
        }
    }

    /// Number of positions already cached (0 if empty).
    ///
    /// All layers advance together, so the first populated layer decides.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Model`] if a cached tensor is not 4D.
    pub fn seq_len(&self) -> Result<usize> {
        match self.keys.iter().find_map(Option::as_ref) {
            Some(k) => Ok(k.dim(2)?),
            None => Ok(0),
        }
    }

    /// Number of layers in the cache.
    #[must_use]
    pub const fn n_layers(&self) -> usize {
        self.keys.len()
    }

    /// Append this step's keys and values for `layer` and return the full
    /// history (cached + new) along the sequence axis.
    ///
    /// # Shapes
    /// - `k`, `v`: `[batch, num_kv_heads, new_len, head_dim]`
    /// - returns: `[batch, num_kv_heads, cached_len + new_len, head_dim]` each
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Hook`] if `layer` is out of range and
    /// [`ProbeError::Model`] if concatenation fails.
    pub fn append(&mut self, layer: usize, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let n_layers = self.keys.len();
        let (Some(k_slot), Some(v_slot)) = (self.keys.get_mut(layer), self.values.get_mut(layer))
        else {
            return Err(ProbeError::Hook(format!(
                "layer {layer} out of range for KV cache with {n_layers} layers"
            )));
        };

        let k_all = match k_slot.as_ref() {
            Some(prev) => Tensor::cat(&[prev, k], 2)?,
            None => k.clone(),
        };
        let v_all = match v_slot.as_ref() {
            Some(prev) => Tensor::cat(&[prev, v], 2)?,
            None => v.clone(),
        };
        *k_slot = Some(k_all.clone());
        *v_slot = Some(v_all.clone());
        Ok((k_all, v_all))
    }

    /// Total bytes held by cached tensors.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.keys
            .iter()
            .chain(self.values.iter())
            .filter_map(Option::as_ref)
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}

impl Default for KvCache {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn kv(len: usize) -> Tensor {
        Tensor::zeros((1, 2, len, 4), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn new_cache_is_empty() {
        let cache = KvCache::new(32);
        assert_eq!(cache.n_layers(), 32);
        assert_eq!(cache.seq_len().unwrap(), 0);
        assert_eq!(cache.memory_usage(), 0);
    }

    #[test]
    fn append_grows_sequence() {
        let mut cache = KvCache::new(2);
        let (k, v) = cache.append(0, &kv(3), &kv(3)).unwrap();
        assert_eq!(k.dims(), &[1, 2, 3, 4]);
        assert_eq!(v.dims(), &[1, 2, 3, 4]);
        assert_eq!(cache.seq_len().unwrap(), 3);

        let (k, _) = cache.append(0, &kv(1), &kv(1)).unwrap();
        assert_eq!(k.dims(), &[1, 2, 4, 4]);
        assert_eq!(cache.seq_len().unwrap(), 4);
        assert_eq!(cache.memory_usage(), 2 * (2 * 4 * 4) * 4);
    }

    #[test]
    fn append_out_of_range() {
        let mut cache = KvCache::new(4);
        assert!(cache.append(10, &kv(1), &kv(1)).is_err());
    }
}
