// SPDX-License-Identifier: MIT OR Apache-2.0

//! Grouped-query self-attention with `RoPE`, KV caching and capture hooks.
//!
//! Covers MHA, GQA and MQA through `num_kv_heads`.  The eager path
//! materialises the attention pattern; the optional flash path (CUDA,
//! half precision) never does, so any layer asked for its scores or
//! pattern runs eagerly.

use candle_core::{DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::cache::KvCache;
use crate::config::TransformerConfig;
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::util::masks;

use super::rope::RopeCache;

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

/// Self-attention layer with hook points.
pub struct Attention {
    /// Query projection.
    q_proj: Linear,
    /// Key projection.
    k_proj: Linear,
    /// Value projection.
    v_proj: Linear,
    /// Output projection.
    o_proj: Linear,
    /// Number of query heads.
    num_attention_heads: usize,
    /// Number of key/value heads.
    num_kv_heads: usize,
    /// Dimension per head.
    head_dim: usize,
    /// `1/sqrt(head_dim)`.
    scale: f64,
    /// Sliding attention window, if any.
    sliding_window: Option<usize>,
    /// Whether the fused kernel may be used when conditions allow.
    use_flash: bool,
}

impl Attention {
    /// Load attention weights from a [`VarBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Model`](crate::ProbeError::Model) if weight
    /// loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let q_dim = config.num_attention_heads * config.head_dim;
        let kv_dim = config.num_kv_heads * config.head_dim;
        let hidden = config.hidden_size;

        let proj = |out: usize, name: &str| -> Result<Linear> {
            if config.qkv_bias {
                Ok(candle_nn::linear(hidden, out, vb.pp(name))?)
            } else {
                Ok(candle_nn::linear_no_bias(hidden, out, vb.pp(name))?)
            }
        };
        let q_proj = proj(q_dim, "q_proj")?;
        let k_proj = proj(kv_dim, "k_proj")?;
        let v_proj = proj(kv_dim, "v_proj")?;
        let o_proj = candle_nn::linear_no_bias(q_dim, hidden, vb.pp("o_proj"))?;

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let scale = 1.0 / (config.head_dim as f64).sqrt();

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_attention_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
            scale,
            sliding_window: config.sliding_window,
            use_flash: false,
        })
    }

    /// Allow the fused attention kernel for this layer.
    pub fn set_flash(&mut self, enabled: bool) {
        self.use_flash = enabled;
    }

    /// Run attention over `x`, whose first token sits at absolute
    /// position `start_pos`.
    ///
    /// With `kv_cache`, this step's keys and values are appended to the
    /// layer's history and attention runs over the whole history.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Model`](crate::ProbeError::Model) on tensor
    /// operation failures.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        x: &Tensor,
        rope: &RopeCache,
        layer_idx: usize,
        start_pos: usize,
        kv_cache: Option<&mut KvCache>,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let (batch, seq_len, _hidden) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_attention_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        if hooks.is_captured(&HookPoint::AttnQ(layer_idx)) {
            cache.store(HookPoint::AttnQ(layer_idx), q.clone());
        }
        if hooks.is_captured(&HookPoint::AttnK(layer_idx)) {
            cache.store(HookPoint::AttnK(layer_idx), k.clone());
        }
        if hooks.is_captured(&HookPoint::AttnV(layer_idx)) {
            cache.store(HookPoint::AttnV(layer_idx), v.clone());
        }

        // CONTIGUOUS: rope narrows along the last dim of a transposed view
        let q = rope.apply(&q.contiguous()?, start_pos)?;
        let k = rope.apply(&k.contiguous()?, start_pos)?;

        let (k, v) = match kv_cache {
            Some(kv) => kv.append(layer_idx, &k, &v.contiguous()?)?,
            None => (k, v),
        };

        let attn_output = if self.flash_applies(&q, layer_idx, hooks) {
            self.flash_forward(&q, &k, &v)?
        } else {
            self.eager_forward(&q, &k, &v, layer_idx, hooks, cache)?
        };

        // [batch, heads, seq, head_dim] -> [batch, seq, heads * head_dim]
        let attn_output = attn_output.transpose(1, 2)?.contiguous()?.reshape((
            batch,
            seq_len,
            self.num_attention_heads * self.head_dim,
        ))?;

        Ok(self.o_proj.forward(&attn_output)?)
    }

    /// Scaled dot-product attention with an explicit pattern.
    ///
    /// # Shapes
    /// - `q`: `[batch, heads, seq_q, head_dim]`
    /// - `k`, `v`: `[batch, kv_heads, seq_k, head_dim]`
    /// - returns: `[batch, heads, seq_q, head_dim]`
    fn eager_forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        layer_idx: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let seq_q = q.dim(2)?;
        let seq_k = k.dim(2)?;

        let k = repeat_kv(k.clone(), self.num_attention_heads, self.num_kv_heads)?;
        let v = repeat_kv(v.clone(), self.num_attention_heads, self.num_kv_heads)?;

        // CONTIGUOUS: matmul requires a contiguous right-hand side
        let k_t = k.contiguous()?.transpose(2, 3)?;
        let mut scores = (q.contiguous()?.matmul(&k_t)? * self.scale)?;

        if hooks.is_captured(&HookPoint::AttnScores(layer_idx)) {
            cache.store(HookPoint::AttnScores(layer_idx), scores.clone());
        }

        if masks::needs_mask(seq_q, seq_k, self.sliding_window) {
            let mask =
                masks::causal_mask(seq_q, seq_k, self.sliding_window, q.device(), scores.dtype())?;
            scores = scores.broadcast_add(&mask)?;
        }

        // PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32
        let original_dtype = scores.dtype();
        let mut pattern = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?;
        if original_dtype != DType::F32 {
            pattern = pattern.to_dtype(original_dtype)?;
        }

        if hooks.is_captured(&HookPoint::AttnPattern(layer_idx)) {
            cache.store(HookPoint::AttnPattern(layer_idx), pattern.clone());
        }

        Ok(pattern.matmul(&v.contiguous()?)?)
    }

    /// Whether the fused kernel can serve this call.
    fn flash_applies(&self, q: &Tensor, layer_idx: usize, hooks: &HookSpec) -> bool {
        self.use_flash
            && cfg!(feature = "flash-attn")
            && q.device().is_cuda()
            && matches!(q.dtype(), DType::F16 | DType::BF16)
            && self.sliding_window.is_none()
            && !hooks.needs_eager_attention(layer_idx)
    }

    /// Fused attention kernel.
    ///
    /// # Shapes
    /// - `q`: `[batch, heads, seq_q, head_dim]`
    /// - `k`, `v`: `[batch, kv_heads, seq_k, head_dim]`
    /// - returns: `[batch, heads, seq_q, head_dim]`
    #[cfg(feature = "flash-attn")]
    fn flash_forward(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        // The kernel wants [batch, seq, heads, head_dim] and handles GQA itself.
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;
        let causal = q.dim(1)? > 1;
        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let scale = self.scale as f32;
        let out = candle_flash_attn::flash_attn(&q, &k, &v, scale, causal)?;
        Ok(out.transpose(1, 2)?)
    }

    /// Never reached: `flash_applies` is false without the feature.
    #[cfg(not(feature = "flash-attn"))]
    #[allow(clippy::unused_self)]
    fn flash_forward(&self, _q: &Tensor, _k: &Tensor, _v: &Tensor) -> Result<Tensor> {
        Err(crate::error::ProbeError::Config(
            "built without the `flash-attn` feature".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Expand key/value tensors from `n_kv_heads` to `n_heads` for GQA.
///
/// # Shapes
/// - `x`: `[batch, n_kv_heads, seq, head_dim]`
/// - returns: `[batch, n_heads, seq, head_dim]`
///
/// When `n_heads == n_kv_heads` (MHA), returns the input unchanged.
fn repeat_kv(x: Tensor, n_heads: usize, n_kv_heads: usize) -> Result<Tensor> {
    if n_heads == n_kv_heads {
        return Ok(x);
    }
    let repeats = n_heads / n_kv_heads;
    let (batch, _kv_heads, seq_len, head_dim) = x.dims4()?;

    // [batch, n_kv_heads, 1, seq, head_dim] -> expand -> [batch, n_heads, seq, head_dim]
    let x = x
        .unsqueeze(2)?
        .expand((batch, n_kv_heads, repeats, seq_len, head_dim))?
        .reshape((batch, n_heads, seq_len, head_dim))?;
    Ok(x)
}
