// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-probe
//!
//! Load pretrained decoder-only language models with
//! [candle](https://github.com/huggingface/candle) and probe them:
//! streamed generation with temperature and nucleus sampling, next-token
//! inspection, and activation capture at named layers.
//!
//! ## Workflows
//!
//! - **Generation**: [`Generator`] runs a KV-cached decode loop driven by
//!   a [`Sampler`]; [`TokenStream`] turns the ids into text as they arrive.
//! - **Inspection**: [`inspect_next_token`] ranks the final-position
//!   logits; [`logit_lens`] does the same for every layer.
//! - **Tracing**: [`trace()`] captures activations at [`HookPoint`]s named
//!   after the checkpoint's module paths (`model.layers.1.input`).
//!
//! ## Supported models
//!
//! One config-driven [`GenericTransformer`] covers `LLaMA` (including
//! Llama 3.x `RoPE` scaling), `Qwen2`/`Qwen2.5` and Mistral.
//!
//! ```no_run
//! use candle_probe::{Defaults, LoadedModel, RunSettings};
//!
//! # fn main() -> candle_probe::Result<()> {
//! let settings = RunSettings::from_env(&Defaults::INSPECT)?;
//! let model = LoadedModel::load(&settings.model)?;
//! let ids = model.encode_prompt(&settings.prompt, None)?;
//! let report = candle_probe::inspect_next_token(
//!     model.model(),
//!     model.tokenizer(),
//!     &model.input_ids(&ids)?,
//!     5,
//! )?;
//! println!("{}", report.argmax.token);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod chat;
pub mod config;
pub mod error;
pub mod generate;
pub mod hooks;
pub mod hub;
pub mod inspect;
pub mod lens;
pub mod logging;
pub mod model;
pub mod sampling;
pub mod settings;
pub mod stream;
pub mod tokenizer;
pub mod trace;
pub mod transformer;
pub(crate) mod util;

pub use cache::KvCache;
pub use chat::{ChatMessage, ChatTemplate, Role, TokenizerConfig};
pub use config::{ModelFamily, RopeScaling, TransformerConfig};
pub use error::{ProbeError, Result};
pub use generate::{GenerationResult, Generator, StopReason};
pub use hooks::{HookCache, HookPoint, HookSpec};
pub use hub::{GenerationConfig, ModelFiles};
pub use inspect::{NextTokenReport, TokenPrediction, inspect_next_token};
pub use lens::{LogitLensAnalysis, LogitLensResult, logit_lens};
pub use model::{CausalLm, LoadedModel};
pub use sampling::Sampler;
pub use settings::{
    DEFAULT_MAX_NEW_TOKENS, DEFAULT_SAMPLE_TOP_K, DEFAULT_TEMPERATURE, DEFAULT_TOP_P, Defaults,
    DevicePolicy, Env, GenerationParams, ModelSettings, Precision, RunSettings,
};
pub use stream::TokenStream;
pub use tokenizer::ProbeTokenizer;
pub use trace::{Capture, TraceReport, trace};
pub use transformer::GenericTransformer;
