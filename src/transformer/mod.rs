// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generic pre-norm decoder transformer.
//!
//! A single forward pass covers `LLaMA`, `Qwen2` and Mistral, parameterized
//! by [`TransformerConfig`](crate::config::TransformerConfig).

pub(crate) mod attention;
pub(crate) mod mlp;
pub(crate) mod rope;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};

use crate::cache::KvCache;
use crate::config::TransformerConfig;
use crate::error::{ProbeError, Result};
use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::model::CausalLm;

use self::attention::Attention;
use self::mlp::Mlp;
use self::rope::RopeCache;

// ---------------------------------------------------------------------------
// TransformerLayer
// ---------------------------------------------------------------------------

/// A single decoder layer: `x + attn(norm(x))`, then `x + mlp(norm(x))`.
struct TransformerLayer {
    /// Pre-attention norm (`input_layernorm`).
    input_norm: RmsNorm,
    /// Self-attention block.
    attention: Attention,
    /// Pre-MLP norm (`post_attention_layernorm` in checkpoint naming).
    post_attention_norm: RmsNorm,
    /// MLP block.
    mlp: Mlp,
}

impl TransformerLayer {
    /// Load a single decoder layer from weights.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let input_norm =
            candle_nn::rms_norm(config.hidden_size, config.norm_eps, vb.pp("input_layernorm"))?;
        let attention = Attention::load(config, vb.pp("self_attn"))?;
        let post_attention_norm = candle_nn::rms_norm(
            config.hidden_size,
            config.norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        let mlp = Mlp::load(config, vb.pp("mlp"))?;

        Ok(Self {
            input_norm,
            attention,
            post_attention_norm,
            mlp,
        })
    }
}

// ---------------------------------------------------------------------------
// GenericTransformer
// ---------------------------------------------------------------------------

/// Config-driven decoder-only transformer.
///
/// Architecture differences between the supported families live in
/// [`TransformerConfig`] fields (QKV bias, tied embeddings, `RoPE`
/// scaling, sliding window); the forward pass branches on them at runtime.
pub struct GenericTransformer {
    /// Token embedding matrix.
    embed_tokens: Embedding,
    /// Decoder layers.
    layers: Vec<TransformerLayer>,
    /// Final normalization before the LM head.
    norm: RmsNorm,
    /// LM head.  `None` when tied to `embed_tokens`.
    lm_head: Option<Linear>,
    /// Pre-computed `RoPE` cos/sin tables.
    rope_cache: RopeCache,
    /// Model configuration.
    config: TransformerConfig,
}

impl GenericTransformer {
    /// Load a transformer from a [`VarBuilder`].
    ///
    /// The caller constructs the `VarBuilder` (buffered, mmap, or a
    /// `VarMap` in tests) in `dtype` on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Model`] if a weight is missing or has the
    /// wrong shape.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(
        config: TransformerConfig,
        device: &Device,
        dtype: DType,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let vb_model = vb.pp("model");

        let embed_tokens = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(TransformerLayer::load(&config, vb_model.pp(format!("layers.{i}")))?);
        }

        let norm = candle_nn::rms_norm(config.hidden_size, config.norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(candle_nn::linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        let rope_cache = RopeCache::new(&config, device, dtype)?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rope_cache,
            config,
        })
    }

    /// Request the fused attention kernel.
    ///
    /// Returns whether it will actually be used: the crate must be built
    /// with `flash-attn`, the model must live on CUDA in F16/BF16, and the
    /// model must not use sliding-window attention.  Otherwise the eager
    /// path stays in place.
    pub fn enable_flash_attention(&mut self, device: &Device, dtype: DType) -> bool {
        let reason = if !cfg!(feature = "flash-attn") {
            Some("crate built without the `flash-attn` feature")
        } else if !device.is_cuda() {
            Some("device is not CUDA")
        } else if !matches!(dtype, DType::F16 | DType::BF16) {
            Some("dtype is not F16/BF16")
        } else if self.config.sliding_window.is_some() {
            Some("model uses sliding-window attention")
        } else {
            None
        };

        if let Some(reason) = reason {
            tracing::debug!(reason, "flash attention unavailable, using eager attention");
            return false;
        }

        for layer in &mut self.layers {
            layer.attention.set_flash(true);
        }
        true
    }

    /// Run embedding + decoder layers + final norm.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]`
    /// - returns: `[batch, seq, hidden_size]` after the final norm
    fn run(
        &self,
        input_ids: &Tensor,
        start_pos: usize,
        mut kv_cache: Option<&mut KvCache>,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        if start_pos + seq_len > self.config.max_position_embeddings {
            return Err(ProbeError::Config(format!(
                "sequence of {} tokens exceeds max_position_embeddings ({})",
                start_pos + seq_len,
                self.config.max_position_embeddings
            )));
        }

        let mut hidden = self.embed_tokens.forward(input_ids)?;
        if hooks.is_captured(&HookPoint::Embed) {
            cache.store(HookPoint::Embed, hidden.clone());
        }

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            if hooks.is_captured(&HookPoint::LayerInput(layer_idx)) {
                cache.store(HookPoint::LayerInput(layer_idx), hidden.clone());
            }

            let residual = hidden.clone();
            let normed = layer.input_norm.forward(&hidden)?;
            let attn_out = layer.attention.forward(
                &normed,
                &self.rope_cache,
                layer_idx,
                start_pos,
                kv_cache.as_deref_mut(),
                hooks,
                cache,
            )?;
            if hooks.is_captured(&HookPoint::AttnOut(layer_idx)) {
                cache.store(HookPoint::AttnOut(layer_idx), attn_out.clone());
            }

            hidden = (residual + attn_out)?;
            if hooks.is_captured(&HookPoint::PostAttention(layer_idx)) {
                cache.store(HookPoint::PostAttention(layer_idx), hidden.clone());
            }

            let residual = hidden.clone();
            let normed = layer.post_attention_norm.forward(&hidden)?;
            if hooks.is_captured(&HookPoint::MlpIn(layer_idx)) {
                cache.store(HookPoint::MlpIn(layer_idx), normed.clone());
            }
            let mlp_out = layer.mlp.forward(&normed)?;
            if hooks.is_captured(&HookPoint::MlpOut(layer_idx)) {
                cache.store(HookPoint::MlpOut(layer_idx), mlp_out.clone());
            }

            hidden = (residual + mlp_out)?;
            if hooks.is_captured(&HookPoint::LayerOutput(layer_idx)) {
                cache.store(HookPoint::LayerOutput(layer_idx), hidden.clone());
            }
        }

        let hidden = self.norm.forward(&hidden)?;
        if hooks.is_captured(&HookPoint::FinalNorm) {
            cache.store(HookPoint::FinalNorm, hidden.clone());
        }
        Ok(hidden)
    }
}

// ---------------------------------------------------------------------------
// CausalLm implementation
// ---------------------------------------------------------------------------

impl CausalLm for GenericTransformer {
    fn config(&self) -> &TransformerConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        self.embed_tokens.embeddings().device()
    }

    fn dtype(&self) -> DType {
        self.embed_tokens.embeddings().dtype()
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        // Output is set once the logits exist.
        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, input_ids.device())?);
        let hidden = self.run(input_ids, 0, None, hooks, &mut cache)?;
        let logits = self.project_to_vocab(&hidden)?;
        cache.set_output(logits);
        Ok(cache)
    }

    fn forward_cached(&self, input_ids: &Tensor, kv_cache: &mut KvCache) -> Result<Tensor> {
        let (_, new_tokens) = input_ids.dims2()?;
        if new_tokens == 0 {
            return Err(ProbeError::Tokenizer("no input tokens to decode".into()));
        }
        let start_pos = kv_cache.seq_len()?;
        let hooks = HookSpec::new();
        let mut scratch = HookCache::new(Tensor::zeros(1, DType::F32, input_ids.device())?);
        let hidden = self.run(input_ids, start_pos, Some(kv_cache), &hooks, &mut scratch)?;

        // Only the last position feeds the next token.
        let last = hidden.narrow(1, new_tokens - 1, 1)?.squeeze(1)?;
        self.project_to_vocab(&last)
    }

    fn final_norm(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(self.norm.forward(hidden)?)
    }

    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        if let Some(head) = &self.lm_head {
            Ok(head.forward(hidden)?)
        } else {
            // Tied embeddings: logits = hidden @ embed_tokens^T
            let embed_weight = self.embed_tokens.embeddings();
            Ok(hidden.broadcast_matmul(&embed_weight.t()?)?)
        }
    }
}
