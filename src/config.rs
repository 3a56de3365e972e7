// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transformer configuration and `HuggingFace` `config.json` parsing.
//!
//! [`TransformerConfig`] captures what differs between the supported
//! decoder-only families (`LLaMA`, `Qwen2`, Mistral).  All of them share
//! RMS normalization, rotary embeddings, grouped-query attention and a gated
//! `SiLU` MLP; the differences are QKV bias, tied embeddings, sliding-window
//! attention and `RoPE` frequency scaling.
//!
//! # Usage
//!
//! ```
//! use candle_probe::TransformerConfig;
//!
//! let config_str = r#"{"model_type": "llama", "hidden_size": 2048,
//!     "num_hidden_layers": 16, "num_attention_heads": 32,
//!     "num_key_value_heads": 8, "intermediate_size": 8192,
//!     "vocab_size": 32000, "rms_norm_eps": 1e-5,
//!     "rope_theta": 500000.0, "max_position_embeddings": 131072}"#;
//! let config = TransformerConfig::from_json_str(config_str).unwrap();
//! assert_eq!(config.num_layers, 16);
//! assert_eq!(config.head_dim, 64);
//! ```

use std::fmt;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ProbeError, Result};

// ---------------------------------------------------------------------------
// ModelFamily / RopeScaling
// ---------------------------------------------------------------------------

/// Architecture family, from the `model_type` field.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// `LLaMA` 1/2/3.x.
    Llama,
    /// `Qwen2` / `Qwen2.5`.
    Qwen2,
    /// Mistral.
    Mistral,
}

impl ModelFamily {
    /// `HuggingFace` architecture class name.
    #[must_use]
    pub const fn architecture(self) -> &'static str {
        match self {
            Self::Llama => "LlamaForCausalLM",
            Self::Qwen2 => "Qwen2ForCausalLM",
            Self::Mistral => "MistralForCausalLM",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Llama => write!(f, "llama"),
            Self::Qwen2 => write!(f, "qwen2"),
            Self::Mistral => write!(f, "mistral"),
        }
    }
}

/// Rotary frequency scaling declared by `rope_scaling`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RopeScaling {
    /// Positions divided by `factor`.
    Linear {
        /// Scale factor.
        factor: f64,
    },
    /// `LLaMA` 3.x wavelength-dependent scaling.
    Llama3 {
        /// Scale applied to low-frequency bands.
        factor: f64,
        /// Wavelength threshold (as a divisor of the original context) below
        /// which frequencies are fully scaled.
        low_freq_factor: f64,
        /// Wavelength threshold above which frequencies are left untouched.
        high_freq_factor: f64,
        /// Context length the base model was trained with.
        original_max_position_embeddings: usize,
    },
}

// ---------------------------------------------------------------------------
// TransformerConfig
// ---------------------------------------------------------------------------

/// Configuration for a decoder-only transformer.
///
/// | Family | Differences from the baseline |
/// |--------|-------------------------------|
/// | `LLaMA` 1/2/3 | baseline; `llama3` rope scaling on 3.1+ |
/// | `Qwen` 2/2.5 | QKV bias, tied embeddings on small checkpoints |
/// | Mistral | sliding window attention |
#[derive(Debug, Clone)]
pub struct TransformerConfig {
    /// Architecture family.
    pub family: ModelFamily,

    // --- Dimensions ----------------------------------------------------------
    /// Hidden dimension (`d_model`).
    pub hidden_size: usize,
    /// Number of decoder layers.
    pub num_layers: usize,
    /// Number of query heads.
    pub num_attention_heads: usize,
    /// Number of key/value heads (GQA when < `num_attention_heads`).
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// MLP intermediate dimension.
    pub intermediate_size: usize,
    /// Vocabulary size.
    pub vocab_size: usize,

    // --- Architecture axes ---------------------------------------------------
    /// RMS norm epsilon.
    pub norm_eps: f64,
    /// Whether Q, K, V projections carry a bias.
    pub qkv_bias: bool,
    /// Whether the LM head shares weights with the token embedding.
    pub tie_word_embeddings: bool,

    // --- Positional encoding -------------------------------------------------
    /// `RoPE` base frequency.
    pub rope_theta: f64,
    /// Optional `RoPE` frequency scaling.
    pub rope_scaling: Option<RopeScaling>,
    /// Maximum sequence length.
    pub max_position_embeddings: usize,
    /// Sliding attention window.  `None` for global attention.
    pub sliding_window: Option<usize>,

    // --- Checkpoint metadata -------------------------------------------------
    /// `torch_dtype` the checkpoint was saved in.
    pub torch_dtype: Option<String>,
    /// End-of-sequence token ids (some checkpoints list several).
    pub eos_token_ids: Vec<u32>,
}

/// `eos_token_id` appears either as an integer or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum TokenIds {
    /// Single id.
    One(u32),
    /// Several ids.
    Many(Vec<u32>),
}

impl TokenIds {
    /// Flatten to a vector.
    pub(crate) fn into_vec(self) -> Vec<u32> {
        match self {
            Self::One(id) => vec![id],
            Self::Many(ids) => ids,
        }
    }
}

/// Raw `config.json` fields shared by every supported family.
#[derive(Debug, Deserialize)]
struct RawConfig {
    /// Dispatch key.
    model_type: Option<String>,
    /// See [`TransformerConfig::hidden_size`].
    hidden_size: usize,
    /// See [`TransformerConfig::num_layers`].
    num_hidden_layers: usize,
    /// See [`TransformerConfig::num_attention_heads`].
    num_attention_heads: usize,
    /// See [`TransformerConfig::num_kv_heads`].
    num_key_value_heads: Option<usize>,
    /// See [`TransformerConfig::head_dim`].
    head_dim: Option<usize>,
    /// See [`TransformerConfig::intermediate_size`].
    intermediate_size: usize,
    /// See [`TransformerConfig::vocab_size`].
    vocab_size: usize,
    /// See [`TransformerConfig::norm_eps`].
    rms_norm_eps: Option<f64>,
    /// See [`TransformerConfig::rope_theta`].
    rope_theta: Option<f64>,
    /// Raw `rope_scaling` object.
    rope_scaling: Option<Value>,
    /// See [`TransformerConfig::max_position_embeddings`].
    max_position_embeddings: Option<usize>,
    /// See [`TransformerConfig::tie_word_embeddings`].
    tie_word_embeddings: Option<bool>,
    /// Qwen2 override for QKV bias.
    attention_bias: Option<bool>,
    /// See [`TransformerConfig::sliding_window`].
    sliding_window: Option<usize>,
    /// Qwen2 switch that gates `sliding_window`.
    use_sliding_window: Option<bool>,
    /// See [`TransformerConfig::torch_dtype`].
    torch_dtype: Option<String>,
    /// See [`TransformerConfig::eos_token_ids`].
    eos_token_id: Option<TokenIds>,
}

impl TransformerConfig {
    /// Parse a [`TransformerConfig`] from a `HuggingFace` `config.json` value.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Config`] if `model_type` is missing or
    /// unsupported, or if a required dimension is absent.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProbeError::Config("missing 'model_type' field".into()))?;
        let family = match model_type {
            "llama" => ModelFamily::Llama,
            "qwen2" => ModelFamily::Qwen2,
            "mistral" => ModelFamily::Mistral,
            other => {
                return Err(ProbeError::Config(format!(
                    "unsupported model_type: '{other}'"
                )));
            }
        };

        // BORROW: serde_json::from_value consumes its input
        let raw: RawConfig = serde_json::from_value(config.clone())
            .map_err(|e| ProbeError::Config(format!("{model_type} config: {e}")))?;
        Self::from_raw(family, raw)
    }

    /// Parse from the text of a `config.json`.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Config`] on malformed JSON or unsupported models.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| ProbeError::Config(format!("parse config.json: {e}")))?;
        Self::from_hf_config(&value)
    }

    /// Read and parse a `config.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProbeError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Apply family defaults on top of the raw fields.
    fn from_raw(family: ModelFamily, raw: RawConfig) -> Result<Self> {
        if raw.num_attention_heads == 0 {
            return Err(ProbeError::Config(
                "num_attention_heads is 0, cannot compute head_dim".into(),
            ));
        }
        let num_kv_heads = raw.num_key_value_heads.unwrap_or(raw.num_attention_heads);
        if num_kv_heads == 0 || raw.num_attention_heads % num_kv_heads != 0 {
            return Err(ProbeError::Config(format!(
                "num_attention_heads ({}) is not a multiple of num_key_value_heads ({num_kv_heads})",
                raw.num_attention_heads
            )));
        }

        let (default_eps, default_theta, default_max_pos) = match family {
            ModelFamily::Llama => (1e-5, 10_000.0, 4096),
            ModelFamily::Qwen2 => (1e-6, 1_000_000.0, 32_768),
            ModelFamily::Mistral => (1e-5, 10_000.0, 32_768),
        };

        let qkv_bias = match family {
            ModelFamily::Qwen2 => raw.attention_bias.unwrap_or(true),
            ModelFamily::Llama | ModelFamily::Mistral => raw.attention_bias.unwrap_or(false),
        };

        let sliding_window = match family {
            ModelFamily::Mistral => raw.sliding_window,
            ModelFamily::Qwen2 if raw.use_sliding_window.unwrap_or(false) => raw.sliding_window,
            ModelFamily::Qwen2 | ModelFamily::Llama => None,
        };

        let rope_scaling = match raw.rope_scaling {
            Some(ref value) if !value.is_null() => Some(parse_rope_scaling(value)?),
            _ => None,
        };

        Ok(Self {
            family,
            hidden_size: raw.hidden_size,
            num_layers: raw.num_hidden_layers,
            num_attention_heads: raw.num_attention_heads,
            num_kv_heads,
            head_dim: raw
                .head_dim
                .unwrap_or(raw.hidden_size / raw.num_attention_heads),
            intermediate_size: raw.intermediate_size,
            vocab_size: raw.vocab_size,
            norm_eps: raw.rms_norm_eps.unwrap_or(default_eps),
            qkv_bias,
            tie_word_embeddings: raw.tie_word_embeddings.unwrap_or(false),
            rope_theta: raw.rope_theta.unwrap_or(default_theta),
            rope_scaling,
            max_position_embeddings: raw.max_position_embeddings.unwrap_or(default_max_pos),
            sliding_window,
            torch_dtype: raw.torch_dtype,
            eos_token_ids: raw.eos_token_id.map(TokenIds::into_vec).unwrap_or_default(),
        })
    }
}

/// Parse a non-null `rope_scaling` object.
///
/// Older checkpoints spell the discriminant `type`, newer ones `rope_type`.
fn parse_rope_scaling(value: &Value) -> Result<RopeScaling> {
    let kind = value
        .get("rope_type")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| ProbeError::Config("rope_scaling without a type".into()))?;
    let factor = value
        .get("factor")
        .and_then(Value::as_f64)
        .ok_or_else(|| ProbeError::Config("rope_scaling without a factor".into()))?;

    match kind {
        "linear" => Ok(RopeScaling::Linear { factor }),
        "llama3" => Ok(RopeScaling::Llama3 {
            factor,
            low_freq_factor: value
                .get("low_freq_factor")
                .and_then(Value::as_f64)
                .unwrap_or(1.0),
            high_freq_factor: value
                .get("high_freq_factor")
                .and_then(Value::as_f64)
                .unwrap_or(4.0),
            original_max_position_embeddings: value
                .get("original_max_position_embeddings")
                .and_then(Value::as_u64)
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(8192),
        }),
        // "default" is how some checkpoints say "no scaling".
        "default" => Ok(RopeScaling::Linear { factor: 1.0 }),
        other => Err(ProbeError::Config(format!(
            "unsupported rope_scaling type '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn llama31_config_json() -> Value {
        serde_json::json!({
            "model_type": "llama",
            "hidden_size": 4096,
            "num_hidden_layers": 32,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "intermediate_size": 14336,
            "vocab_size": 128256,
            "rms_norm_eps": 1e-5,
            "rope_theta": 500000.0,
            "max_position_embeddings": 131072,
            "torch_dtype": "bfloat16",
            "bos_token_id": 128000,
            "eos_token_id": [128001, 128008, 128009],
            "rope_scaling": {
                "factor": 8.0,
                "low_freq_factor": 1.0,
                "high_freq_factor": 4.0,
                "original_max_position_embeddings": 8192,
                "rope_type": "llama3"
            }
        })
    }

    #[test]
    fn parse_llama31() {
        let config = TransformerConfig::from_hf_config(&llama31_config_json()).unwrap();
        assert_eq!(config.family, ModelFamily::Llama);
        assert_eq!(config.num_layers, 32);
        assert_eq!(config.num_kv_heads, 8);
        assert_eq!(config.head_dim, 128);
        assert!(!config.qkv_bias);
        assert!(!config.tie_word_embeddings);
        assert!(config.sliding_window.is_none());
        assert_eq!(config.eos_token_ids, vec![128_001, 128_008, 128_009]);
        assert_eq!(config.torch_dtype.as_deref(), Some("bfloat16"));
        assert!(matches!(
            config.rope_scaling,
            Some(RopeScaling::Llama3 { original_max_position_embeddings: 8192, .. })
        ));
    }

    #[test]
    fn parse_qwen2_bias_and_window_switch() {
        let json = serde_json::json!({
            "model_type": "qwen2",
            "hidden_size": 5120,
            "num_hidden_layers": 48,
            "num_attention_heads": 40,
            "num_key_value_heads": 8,
            "intermediate_size": 13824,
            "vocab_size": 152064,
            "sliding_window": 131072,
            "use_sliding_window": false,
            "rope_scaling": null,
            "eos_token_id": 151643
        });
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert_eq!(config.family, ModelFamily::Qwen2);
        assert!(config.qkv_bias);
        assert!(config.sliding_window.is_none());
        assert!(config.rope_scaling.is_none());
        assert_eq!(config.eos_token_ids, vec![151_643]);
        assert!((config.rope_theta - 1_000_000.0).abs() < f64::EPSILON);
        assert!((config.norm_eps - 1e-6).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_mistral_sliding_window() {
        let json = serde_json::json!({
            "model_type": "mistral",
            "hidden_size": 4096,
            "num_hidden_layers": 32,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "intermediate_size": 14336,
            "vocab_size": 32000,
            "sliding_window": 4096
        });
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert_eq!(config.sliding_window, Some(4096));
    }

    #[test]
    fn unsupported_model_type_errors() {
        let json = serde_json::json!({ "model_type": "bert" });
        assert!(matches!(
            TransformerConfig::from_hf_config(&json),
            Err(ProbeError::Config(_))
        ));
    }

    #[test]
    fn missing_model_type_errors() {
        let json = serde_json::json!({ "hidden_size": 768 });
        assert!(TransformerConfig::from_hf_config(&json).is_err());
    }

    #[test]
    fn missing_dimension_errors() {
        let json = serde_json::json!({ "model_type": "llama", "hidden_size": 768 });
        assert!(TransformerConfig::from_hf_config(&json).is_err());
    }

    #[test]
    fn indivisible_kv_heads_error() {
        let mut json = llama31_config_json();
        json["num_key_value_heads"] = serde_json::json!(5);
        assert!(TransformerConfig::from_hf_config(&json).is_err());
    }

    #[test]
    fn unknown_rope_scaling_errors() {
        let mut json = llama31_config_json();
        json["rope_scaling"] = serde_json::json!({ "type": "yarn", "factor": 4.0 });
        assert!(TransformerConfig::from_hf_config(&json).is_err());
    }
}
