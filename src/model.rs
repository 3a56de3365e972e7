// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core model trait and the loaded-model bundle.
//!
//! [`CausalLm`] is the trait every model backend implements.
//! [`LoadedModel`] pairs a backend with its tokenizer, chat template and
//! stopping ids, and knows how to load all of them from a model id.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};

use crate::cache::KvCache;
use crate::chat::{self, ChatTemplate, TokenizerConfig};
use crate::config::TransformerConfig;
use crate::error::{ProbeError, Result};
use crate::generate::Generator;
use crate::hooks::{HookCache, HookSpec};
use crate::hub::{GenerationConfig, ModelFiles};
use crate::settings::ModelSettings;
use crate::tokenizer::ProbeTokenizer;
use crate::transformer::GenericTransformer;

// ---------------------------------------------------------------------------
// CausalLm trait
// ---------------------------------------------------------------------------

/// Decoder-only language model with hook-aware and KV-cached forward passes.
///
/// [`forward`](Self::forward) serves inspection and tracing: the caller
/// lists captures in a [`HookSpec`] and receives a [`HookCache`] with the
/// logits plus the requested activations.
/// [`forward_cached`](Self::forward_cached) serves generation.
pub trait CausalLm: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Parsed `config.json`.
    fn config(&self) -> &TransformerConfig;

    /// Device holding the weights.
    fn device(&self) -> &Device;

    /// Dtype of the weights.
    fn dtype(&self) -> DType;

    /// Number of decoder layers.
    fn num_layers(&self) -> usize {
        self.config().num_layers
    }

    /// Hidden dimension (`d_model`).
    fn hidden_size(&self) -> usize {
        self.config().hidden_size
    }

    /// Vocabulary size.
    fn vocab_size(&self) -> usize {
        self.config().vocab_size
    }

    /// Number of query heads.
    fn num_heads(&self) -> usize {
        self.config().num_attention_heads
    }

    // --- Forward passes ---------------------------------------------------

    /// Full forward pass with optional activation capture.
    ///
    /// With an empty `hooks` nothing is cloned.  Capture never changes the
    /// computed values.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]`
    /// - returns: [`HookCache`] whose output is `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Model`] on tensor operation failures.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    /// Forward pass that continues from `kv_cache` and appends to it.
    ///
    /// The first call (empty cache) is the prefill; later calls usually
    /// feed one token.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, new_tokens]`
    /// - returns: last-position logits `[batch, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Tokenizer`] for an empty `input_ids`,
    /// [`ProbeError::Model`] on tensor operation failures and
    /// [`ProbeError::Config`] past `max_position_embeddings`.
    fn forward_cached(&self, input_ids: &Tensor, kv_cache: &mut KvCache) -> Result<Tensor>;

    // --- Logit lens --------------------------------------------------------

    /// Apply the final norm to a residual-stream tensor.
    ///
    /// # Shapes
    /// - `hidden`: `[..., hidden_size]`
    /// - returns: same shape
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Model`] on shape mismatch.
    fn final_norm(&self, hidden: &Tensor) -> Result<Tensor>;

    /// Project (normed) hidden states to vocabulary logits.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, hidden_size]` or `[batch, seq, hidden_size]`
    /// - returns: `[batch, vocab_size]` or `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Model`] on shape mismatch.
    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor>;
}

// ---------------------------------------------------------------------------
// LoadedModel
// ---------------------------------------------------------------------------

/// A model ready to run: weights, tokenizer, chat template, stopping ids.
pub struct LoadedModel {
    /// The underlying model backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    model: Box<dyn CausalLm>,
    /// Tokenizer from `tokenizer.json`.
    tokenizer: ProbeTokenizer,
    /// Chat template from `tokenizer_config.json`, if any.
    chat_template: Option<ChatTemplate>,
    /// Decoding defaults from `generation_config.json`.
    generation_config: GenerationConfig,
    /// Ids that end generation.
    eos_token_ids: Vec<u32>,
    /// Identifier the model was loaded from.
    model_id: String,
    /// Whether fused attention is in use.
    flash_attention: bool,
}

impl LoadedModel {
    /// Resolve, download if needed, and load everything `settings` names.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Download`] if artifacts cannot be resolved,
    /// [`ProbeError::Config`] for an unsupported or malformed
    /// `config.json`, [`ProbeError::Tokenizer`] / [`ProbeError::Template`]
    /// for tokenizer files, and [`ProbeError::Model`] if weight loading
    /// or device selection fails.
    pub fn load(settings: &ModelSettings) -> Result<Self> {
        let start = Instant::now();
        tracing::info!(model = %settings.model_id, "loading model");

        let device = settings.device.select()?;
        let files = ModelFiles::resolve(&settings.model_id)?;

        let config = TransformerConfig::from_file(&files.config)?;
        let dtype = settings
            .precision
            .resolve(&device, config.torch_dtype.as_deref());

        let tokenizer = ProbeTokenizer::from_file(&files.tokenizer)?;
        let tokenizer_config = files
            .tokenizer_config
            .as_deref()
            .map(TokenizerConfig::from_file)
            .transpose()?
            .unwrap_or_default();
        let chat_template = ChatTemplate::from_tokenizer_config(&tokenizer_config)?;
        let generation_config = files
            .generation_config
            .as_deref()
            .map(GenerationConfig::from_file)
            .transpose()?
            .unwrap_or_default();

        let eos_token_ids = resolve_eos_token_ids(
            &generation_config,
            &config,
            tokenizer_config
                .eos_token
                .as_deref()
                .and_then(|t| tokenizer.token_to_id(t)),
        );

        let vb = create_var_builder(&files.weights, dtype, &device)?;
        let mut transformer = GenericTransformer::load(config, &device, dtype, vb)?;
        let flash_attention = settings.use_flash && transformer.enable_flash_attention(&device, dtype);

        tracing::info!(
            model = %settings.model_id,
            family = %transformer.config().family,
            layers = transformer.config().num_layers,
            dtype = ?dtype,
            device = ?device,
            flash_attention,
            chat_template = chat_template.is_some(),
            elapsed_s = start.elapsed().as_secs_f64(),
            "model loaded"
        );

        Ok(Self {
            model: Box::new(transformer),
            tokenizer,
            chat_template,
            generation_config,
            eos_token_ids,
            model_id: settings.model_id.clone(),
            flash_attention,
        })
    }

    /// Assemble from an already-built backend and tokenizer.
    ///
    /// Stopping ids come from the backend's config; there is no chat
    /// template until [`with_chat_template`](Self::with_chat_template).
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    #[must_use]
    pub fn from_parts(
        model: Box<dyn CausalLm>,
        tokenizer: ProbeTokenizer,
        model_id: impl Into<String>,
    ) -> Self {
        let eos_token_ids = model.config().eos_token_ids.clone();
        Self {
            model,
            tokenizer,
            chat_template: None,
            generation_config: GenerationConfig::default(),
            eos_token_ids,
            model_id: model_id.into(),
            flash_attention: false,
        }
    }

    /// Attach a chat template.
    #[must_use]
    pub fn with_chat_template(mut self, template: ChatTemplate) -> Self {
        self.chat_template = Some(template);
        self
    }

    /// The model backend.
    // TRAIT_OBJECT: caller needs dynamic dispatch for backend-agnostic workflows
    #[must_use]
    pub fn model(&self) -> &dyn CausalLm {
        &*self.model
    }

    /// The tokenizer.
    #[must_use]
    pub const fn tokenizer(&self) -> &ProbeTokenizer {
        &self.tokenizer
    }

    /// The chat template, if the checkpoint ships one.
    #[must_use]
    pub const fn chat_template(&self) -> Option<&ChatTemplate> {
        self.chat_template.as_ref()
    }

    /// Decoding defaults from `generation_config.json`.
    #[must_use]
    pub const fn generation_config(&self) -> &GenerationConfig {
        &self.generation_config
    }

    /// Ids that end generation.
    #[must_use]
    pub fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    /// Identifier the model was loaded from.
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Device holding the weights.
    #[must_use]
    pub fn device(&self) -> &Device {
        self.model.device()
    }

    /// Dtype of the weights.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.model.dtype()
    }

    /// Whether fused attention kernels are in use.
    #[must_use]
    pub const fn flash_attention(&self) -> bool {
        self.flash_attention
    }

    /// Encode a prompt.
    ///
    /// Without a system prompt the text is encoded as-is (with the
    /// tokenizer's special tokens).  With one, `[system, user]` is
    /// rendered through the chat template, or joined by blank lines when
    /// the checkpoint has none.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Template`] if rendering fails and
    /// [`ProbeError::Tokenizer`] if encoding fails.
    pub fn encode_prompt(&self, prompt: &str, system_prompt: Option<&str>) -> Result<Vec<u32>> {
        let Some(system_prompt) = system_prompt else {
            return self.tokenizer.encode(prompt);
        };
        let messages = chat::conversation(Some(system_prompt), prompt);
        match &self.chat_template {
            Some(template) => {
                let rendered = template.render(&messages, true)?;
                tracing::debug!(chars = rendered.len(), "rendered chat prompt");
                // The rendered text already carries BOS and role markers.
                self.tokenizer.encode_raw(&rendered)
            }
            None => {
                tracing::debug!("no chat template, joining turns as plain text");
                self.tokenizer.encode(&chat::render_plain(&messages))
            }
        }
    }

    /// Place token ids on the model device as a `[1, seq]` tensor.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Tokenizer`] for an empty sequence and
    /// [`ProbeError::Model`] if the tensor cannot be created.
    pub fn input_ids(&self, ids: &[u32]) -> Result<Tensor> {
        if ids.is_empty() {
            return Err(ProbeError::Tokenizer("prompt encodes to zero tokens".into()));
        }
        Ok(Tensor::new(ids, self.device())?.unsqueeze(0)?)
    }

    /// A generator wired to this model's stopping ids.
    #[must_use]
    pub fn generator(&self) -> Generator<'_> {
        Generator::new(self.model(), &self.tokenizer).with_eos_token_ids(self.eos_token_ids.clone())
    }

    /// Human-readable module tree, in checkpoint naming.
    #[must_use]
    pub fn summary(&self) -> String {
        summarize(self.model.config())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Stopping ids: `generation_config.json` if it lists any, else
/// `config.json`, plus the tokenizer's EOS token.
fn resolve_eos_token_ids(
    generation_config: &GenerationConfig,
    config: &TransformerConfig,
    tokenizer_eos: Option<u32>,
) -> Vec<u32> {
    let mut ids = generation_config.eos_token_ids();
    if ids.is_empty() {
        ids.clone_from(&config.eos_token_ids);
    }
    if let Some(id) = tokenizer_eos {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Render the module tree for `config`.
fn summarize(config: &TransformerConfig) -> String {
    let hidden = config.hidden_size;
    let q_dim = config.num_attention_heads * config.head_dim;
    let kv_dim = config.num_kv_heads * config.head_dim;
    let inter = config.intermediate_size;
    let bias = if config.qkv_bias { ", bias" } else { "" };

    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(out, "{}(", config.family.architecture());
    let _ = writeln!(out, "  (model.embed_tokens): Embedding({}, {hidden})", config.vocab_size);
    let _ = writeln!(out, "  (model.layers): {} x DecoderLayer(", config.num_layers);
    let _ = writeln!(out, "    (self_attn): Attention(");
    let _ = writeln!(out, "      (q_proj): Linear({hidden} -> {q_dim}{bias})");
    let _ = writeln!(out, "      (k_proj): Linear({hidden} -> {kv_dim}{bias})");
    let _ = writeln!(out, "      (v_proj): Linear({hidden} -> {kv_dim}{bias})");
    let _ = writeln!(out, "      (o_proj): Linear({q_dim} -> {hidden})");
    let _ = writeln!(
        out,
        "      heads={}, kv_heads={}, head_dim={}{}",
        config.num_attention_heads,
        config.num_kv_heads,
        config.head_dim,
        config
            .sliding_window
            .map_or_else(String::new, |w| format!(", sliding_window={w}"))
    );
    let _ = writeln!(out, "    )");
    let _ = writeln!(out, "    (mlp): Mlp(");
    let _ = writeln!(out, "      (gate_proj): Linear({hidden} -> {inter})");
    let _ = writeln!(out, "      (up_proj): Linear({hidden} -> {inter})");
    let _ = writeln!(out, "      (down_proj): Linear({inter} -> {hidden})");
    let _ = writeln!(out, "      (act_fn): SiLU");
    let _ = writeln!(out, "    )");
    let _ = writeln!(out, "    (input_layernorm): RmsNorm({hidden}, eps={})", config.norm_eps);
    let _ = writeln!(
        out,
        "    (post_attention_layernorm): RmsNorm({hidden}, eps={})",
        config.norm_eps
    );
    let _ = writeln!(out, "  )");
    let _ = writeln!(out, "  (model.norm): RmsNorm({hidden}, eps={})", config.norm_eps);
    let _ = writeln!(
        out,
        "  (rotary_emb): RoPE(theta={}, max_position={})",
        config.rope_theta, config.max_position_embeddings
    );
    if config.tie_word_embeddings {
        let _ = writeln!(out, "  (lm_head): tied to model.embed_tokens");
    } else {
        let _ = writeln!(out, "  (lm_head): Linear({hidden} -> {})", config.vocab_size);
    }
    out.push(')');
    out
}

/// Create a `VarBuilder` from safetensors file paths.
///
/// Uses memory-mapped loading with the `mmap` feature (the default),
/// buffered reading otherwise.
fn create_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(paths, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(paths, dtype, device)
    }
}

/// Load weights via buffered reading: all data is read into RAM.
///
/// Only supports single-file checkpoints.
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    let [path] = paths else {
        return Err(ProbeError::Config(format!(
            "{} safetensors shards found; sharded checkpoints require the `mmap` feature",
            paths.len()
        )));
    };
    let data = std::fs::read(path)?;
    Ok(candle_nn::VarBuilder::from_buffered_safetensors(
        data, dtype, device,
    )?)
}

/// Load weights via memory-mapped files.
///
/// # Safety
///
/// The safetensors files must not be modified while the model is loaded.
/// This is the standard invariant for memory-mapped files.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    // SAFETY: safetensors files must not be modified while loaded.
    let vb = unsafe { candle_nn::VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config(json: &str) -> TransformerConfig {
        TransformerConfig::from_json_str(json).unwrap()
    }

    const QWEN: &str = r#"{
        "model_type": "qwen2", "hidden_size": 64, "num_hidden_layers": 2,
        "num_attention_heads": 4, "num_key_value_heads": 2,
        "intermediate_size": 128, "vocab_size": 100,
        "tie_word_embeddings": true, "eos_token_id": 7
    }"#;

    #[test]
    fn eos_prefers_generation_config() {
        let gen_config = GenerationConfig::from_json_str(r#"{"eos_token_id": [5, 6]}"#).unwrap();
        assert_eq!(resolve_eos_token_ids(&gen_config, &config(QWEN), None), vec![5, 6]);
    }

    #[test]
    fn eos_falls_back_to_config_and_tokenizer() {
        let ids = resolve_eos_token_ids(&GenerationConfig::default(), &config(QWEN), Some(9));
        assert_eq!(ids, vec![7, 9]);
        let ids = resolve_eos_token_ids(&GenerationConfig::default(), &config(QWEN), Some(7));
        assert_eq!(ids, vec![7]);
    }

    #[test]
    fn summary_names_checkpoint_modules() {
        let text = summarize(&config(QWEN));
        assert!(text.starts_with("Qwen2ForCausalLM("));
        assert!(text.contains("(model.embed_tokens): Embedding(100, 64)"));
        assert!(text.contains("2 x DecoderLayer"));
        assert!(text.contains("(k_proj): Linear(64 -> 32, bias)"));
        assert!(text.contains("tied to model.embed_tokens"));
        assert!(text.ends_with(')'));
    }
}
