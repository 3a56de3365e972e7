// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run configuration resolved from environment variables.
//!
//! Every knob has a hardcoded default; a variable only needs to be set to
//! override it.  Values are parsed but not range-checked: a temperature of
//! `-3` or a `top_p` of `7` reaches the sampler unchanged.
//!
//! ```
//! use candle_probe::settings::{Defaults, Env, RunSettings};
//!
//! let env = Env::from_pairs([("TEMP", "0.7")]);
//! let settings = RunSettings::from_source(&env, &Defaults::GENERATE).unwrap();
//! assert!((settings.generation.temperature - 0.7).abs() < 1e-12);
//! assert_eq!(settings.generation.max_new_tokens, 256);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device};

use crate::error::{ProbeError, Result};
use crate::hub::GenerationConfig;

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f64 = 1.0;
/// Default nucleus threshold.
pub const DEFAULT_TOP_P: f64 = 0.9;
/// Default generation budget.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 256;
/// Default number of candidates kept before the nucleus cut.
pub const DEFAULT_SAMPLE_TOP_K: usize = 50;

// ---------------------------------------------------------------------------
// Env: where variables come from
// ---------------------------------------------------------------------------

/// Source of configuration variables.
///
/// [`Env::process`] reads the real process environment; [`Env::from_pairs`]
/// builds a fixed table, which keeps tests away from global state.
#[derive(Debug, Clone)]
pub struct Env {
    /// Backing store.
    source: EnvSource,
}

/// Backing store for [`Env`].
#[derive(Debug, Clone)]
enum EnvSource {
    /// `std::env`.
    Process,
    /// Fixed key/value table.
    Fixed(HashMap<String, String>),
}

impl Env {
    /// Read from the process environment.
    #[must_use]
    pub const fn process() -> Self {
        Self {
            source: EnvSource::Process,
        }
    }

    /// Read from a fixed set of key/value pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            source: EnvSource::Fixed(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Raw lookup.  `None` when the variable is unset.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Settings`] if the variable is set but is not
    /// valid Unicode.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        match &self.source {
            EnvSource::Process => match std::env::var(key) {
                Ok(v) => Ok(Some(v)),
                Err(std::env::VarError::NotPresent) => Ok(None),
                Err(std::env::VarError::NotUnicode(raw)) => Err(ProbeError::Settings {
                    key: key.to_owned(),
                    value: raw.to_string_lossy().into_owned(),
                    reason: "not valid unicode".into(),
                }),
            },
            EnvSource::Fixed(map) => Ok(map.get(key).cloned()),
        }
    }

    /// String variable with a default.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub fn string_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.get(key)?.unwrap_or_else(|| default.to_owned()))
    }

    /// Parsed variable with a default.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Settings`] if the value does not parse as `T`.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(self.parse_optional(key)?.unwrap_or(default))
    }

    /// Parsed variable, `None` when unset.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Settings`] if the value does not parse as `T`.
    pub fn parse_optional<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key)? {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ProbeError::Settings {
                    key: key.to_owned(),
                    value: raw.clone(),
                    reason: e.to_string(),
                }),
        }
    }

    /// On/off switch: on only when the value is exactly `"1"`.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub fn flag(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self.get(key)?.map_or(default, |v| v == "1"))
    }
}

// ---------------------------------------------------------------------------
// Precision
// ---------------------------------------------------------------------------

/// Numeric precision selector (`DTYPE`).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// Checkpoint dtype on accelerators, `F32` on CPU.
    #[default]
    Auto,
    /// `bfloat16`.
    BF16,
    /// `float16`.
    F16,
    /// `float32`.
    F32,
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "bfloat16" | "bf16" => Ok(Self::BF16),
            "float16" | "f16" | "half" => Ok(Self::F16),
            "float32" | "f32" | "float" => Ok(Self::F32),
            other => Err(format!(
                "unknown precision '{other}' (expected auto|bfloat16|float16|float32)"
            )),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::BF16 => write!(f, "bfloat16"),
            Self::F16 => write!(f, "float16"),
            Self::F32 => write!(f, "float32"),
        }
    }
}

impl Precision {
    /// Resolve to a concrete dtype for `device`.
    ///
    /// `checkpoint_dtype` is the `torch_dtype` string from `config.json`,
    /// consulted only in [`Auto`](Self::Auto) mode on an accelerator.
    #[must_use]
    pub fn resolve(self, device: &Device, checkpoint_dtype: Option<&str>) -> DType {
        match self {
            Self::BF16 => DType::BF16,
            Self::F16 => DType::F16,
            Self::F32 => DType::F32,
            Self::Auto if device.is_cpu() => DType::F32,
            Self::Auto => match checkpoint_dtype {
                Some("float16") => DType::F16,
                Some("float32") => DType::F32,
                _ => DType::BF16,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// DevicePolicy
// ---------------------------------------------------------------------------

/// Device placement policy (`DEVICE`).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePolicy {
    /// First CUDA device, else first Metal device, else CPU.
    #[default]
    Auto,
    /// Host CPU.
    Cpu,
    /// CUDA device by ordinal.
    Cuda(usize),
    /// Metal device by ordinal.
    Metal(usize),
}

impl FromStr for DevicePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let (kind, ordinal) = match lower.split_once(':') {
            Some((kind, idx)) => {
                let idx = idx
                    .parse::<usize>()
                    .map_err(|e| format!("bad device ordinal '{idx}': {e}"))?;
                (kind.to_owned(), idx)
            }
            None => (lower, 0),
        };
        match kind.as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(ordinal)),
            "metal" | "mps" => Ok(Self::Metal(ordinal)),
            other => Err(format!(
                "unknown device '{other}' (expected auto|cpu|cuda[:N]|metal[:N])"
            )),
        }
    }
}

impl DevicePolicy {
    /// Materialise the policy into a candle [`Device`].
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Model`] if an explicitly requested device
    /// cannot be opened (e.g. the crate was built without `cuda`).
    pub fn select(self) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(ordinal) => Ok(Device::new_cuda(ordinal)?),
            Self::Metal(ordinal) => Ok(Device::new_metal(ordinal)?),
            Self::Auto => {
                if candle_core::utils::cuda_is_available() {
                    Ok(Device::new_cuda(0)?)
                } else if candle_core::utils::metal_is_available() {
                    Ok(Device::new_metal(0)?)
                } else {
                    Ok(Device::Cpu)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Settings records
// ---------------------------------------------------------------------------

/// Everything needed to load a model.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// Hub repository id or local snapshot directory.
    pub model_id: String,
    /// Requested precision.
    pub precision: Precision,
    /// Requested device placement.
    pub device: DevicePolicy,
    /// Try fused attention kernels.
    pub use_flash: bool,
}

impl ModelSettings {
    /// Settings for `model_id` with every other knob at its default.
    #[must_use]
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            precision: Precision::Auto,
            device: DevicePolicy::Auto,
            use_flash: true,
        }
    }
}

/// Decoding parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    /// Softmax temperature.  `<= 0` means greedy.
    pub temperature: f64,
    /// Nucleus threshold.  `>= 1` disables nucleus filtering.
    pub top_p: f64,
    /// Only the `top_k` most likely tokens survive to the nucleus cut.
    /// `0` disables the filter.
    pub top_k: usize,
    /// Maximum number of tokens to generate.
    pub max_new_tokens: usize,
    /// Sampler seed.  `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Sample from the distribution; `false` forces greedy decoding.
    pub do_sample: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            top_k: DEFAULT_SAMPLE_TOP_K,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            seed: None,
            do_sample: true,
        }
    }
}

impl GenerationParams {
    /// Greedy decoding with the given budget.
    #[must_use]
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            do_sample: false,
            ..Self::default()
        }
    }
}

/// Per-program defaults for the model id and prompt.
#[derive(Debug, Clone, Copy)]
pub struct Defaults {
    /// Default `MODEL`.
    pub model_id: &'static str,
    /// Default `PROMPT`.
    pub prompt: &'static str,
    /// Whether decoding samples by default.
    pub do_sample: bool,
}

impl Defaults {
    /// Streaming chat-style generation.
    pub const GENERATE: Self = Self {
        model_id: "meta-llama/Llama-3.1-8B-Instruct",
        prompt: "Say hello in one sentence.",
        do_sample: true,
    };

    /// Batch completion with a base model.
    pub const COMPLETE: Self = Self {
        model_id: "Qwen/Qwen2.5-14B",
        prompt: "I really like nuclear power because",
        do_sample: false,
    };

    /// Next-token inspection.
    pub const INSPECT: Self = Self {
        model_id: "Qwen/Qwen2.5-7B-Instruct",
        prompt: "I really like nuclear power because",
        do_sample: false,
    };

    /// Activation tracing.
    pub const TRACE: Self = Self {
        model_id: "Qwen/Qwen2.5-14B",
        prompt: "Love",
        do_sample: false,
    };
}

/// Fully resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Model loading settings.
    pub model: ModelSettings,
    /// Prompt text.
    pub prompt: String,
    /// Optional system prompt; when set the prompt is rendered as a chat.
    pub system_prompt: Option<String>,
    /// Decoding parameters.
    pub generation: GenerationParams,
}

impl RunSettings {
    /// Resolve from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Settings`] if a variable is set to a value
    /// that does not parse.
    pub fn from_env(defaults: &Defaults) -> Result<Self> {
        Self::from_source(&Env::process(), defaults)
    }

    /// Resolve from an explicit [`Env`].
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Settings`] if a variable is set to a value
    /// that does not parse.
    pub fn from_source(env: &Env, defaults: &Defaults) -> Result<Self> {
        let model = ModelSettings {
            model_id: env.string_or("MODEL", defaults.model_id)?,
            precision: env.parse_or("DTYPE", Precision::Auto)?,
            device: env.parse_or("DEVICE", DevicePolicy::Auto)?,
            use_flash: env.flag("USE_FLASH", true)?,
        };

        let generation = GenerationParams {
            temperature: env.parse_or("TEMP", DEFAULT_TEMPERATURE)?,
            top_p: env.parse_or("TOP_P", DEFAULT_TOP_P)?,
            top_k: env.parse_or("SAMPLE_TOP_K", DEFAULT_SAMPLE_TOP_K)?,
            max_new_tokens: env.parse_or("MAX_NEW_TOKENS", DEFAULT_MAX_NEW_TOKENS)?,
            seed: env.parse_optional("SEED")?,
            do_sample: env.flag("DO_SAMPLE", defaults.do_sample)?,
        };

        Ok(Self {
            model,
            prompt: env.string_or("PROMPT", defaults.prompt)?,
            system_prompt: env.get("SYSTEM_PROMPT")?,
            generation,
        })
    }

    /// Take sampling knobs the environment leaves unset from the
    /// checkpoint's `generation_config.json`.
    ///
    /// `DO_SAMPLE`, `TEMP`, `TOP_P` and `SAMPLE_TOP_K` still win when set.
    ///
    /// # Errors
    ///
    /// See [`Env::get`].
    pub fn apply_generation_config(&mut self, env: &Env, config: &GenerationConfig) -> Result<()> {
        let generation = &mut self.generation;
        if let (None, Some(do_sample)) = (env.get("DO_SAMPLE")?, config.do_sample) {
            generation.do_sample = do_sample;
        }
        if let (None, Some(temperature)) = (env.get("TEMP")?, config.temperature) {
            generation.temperature = temperature;
        }
        if let (None, Some(top_p)) = (env.get("TOP_P")?, config.top_p) {
            generation.top_p = top_p;
        }
        if let (None, Some(top_k)) = (env.get("SAMPLE_TOP_K")?, config.top_k) {
            generation.top_k = top_k;
        }
        tracing::debug!(
            do_sample = generation.do_sample,
            temperature = generation.temperature,
            top_p = generation.top_p,
            top_k = generation.top_k,
            "applied checkpoint generation defaults"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
