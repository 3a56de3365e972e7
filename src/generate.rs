// SPDX-License-Identifier: MIT OR Apache-2.0

//! Autoregressive generation with a KV cache.
//!
//! The prompt is processed once (prefill), after which each step feeds
//! only the newly sampled token and reads earlier keys/values from the
//! [`KvCache`].  Generation stops at `max_new_tokens` or at any
//! end-of-sequence id.

use std::time::Instant;

use candle_core::Tensor;

use crate::cache::KvCache;
use crate::error::{ProbeError, Result};
use crate::model::CausalLm;
use crate::sampling::Sampler;
use crate::settings::GenerationParams;
use crate::stream::TokenStream;
use crate::tokenizer::ProbeTokenizer;

// ---------------------------------------------------------------------------
// GenerationResult
// ---------------------------------------------------------------------------

/// Why generation ended.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// An end-of-sequence id was sampled.
    Eos,
    /// The `max_new_tokens` budget ran out.
    MaxTokens,
}

/// Output of a text generation run with token-level details.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Token ids of the prompt.
    pub prompt_tokens: Vec<u32>,
    /// Token ids that were generated (the stopping EOS excluded).
    pub generated_tokens: Vec<u32>,
    /// Only the generated portion, special tokens skipped.
    pub generated_text: String,
    /// Prompt followed by the generated text, special tokens skipped.
    pub full_text: String,
    /// Total token count (prompt + generated).
    pub total_tokens: usize,
    /// Why generation ended.
    pub stop_reason: StopReason,
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Drives the decode loop for one model/tokenizer pair.
pub struct Generator<'a> {
    /// The model.
    // TRAIT_OBJECT: any CausalLm backend can drive generation
    model: &'a dyn CausalLm,
    /// Tokenizer for decoding the result.
    tokenizer: &'a ProbeTokenizer,
    /// Ids that end generation.
    eos_token_ids: Vec<u32>,
}

impl<'a> Generator<'a> {
    /// A generator that stops on the EOS ids from the model's
    /// `config.json`.
    // TRAIT_OBJECT: any CausalLm backend can drive generation
    #[must_use]
    pub fn new(model: &'a dyn CausalLm, tokenizer: &'a ProbeTokenizer) -> Self {
        Self {
            model,
            tokenizer,
            eos_token_ids: model.config().eos_token_ids.clone(),
        }
    }

    /// Replace the end-of-sequence ids.
    #[must_use]
    pub fn with_eos_token_ids(mut self, ids: Vec<u32>) -> Self {
        self.eos_token_ids = ids;
        self
    }

    /// Ids that end generation.
    #[must_use]
    pub fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    /// Generate from `prompt_ids`, calling `on_token` with each new id as
    /// soon as it is sampled.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Tokenizer`] for an empty prompt, propagates
    /// forward pass and sampling errors, and stops with the first error
    /// returned by `on_token`.
    pub fn generate<F>(
        &self,
        prompt_ids: &[u32],
        params: &GenerationParams,
        mut on_token: F,
    ) -> Result<GenerationResult>
    where
        F: FnMut(u32) -> Result<()>,
    {
        if prompt_ids.is_empty() {
            return Err(ProbeError::Tokenizer(
                "prompt encodes to zero tokens".into(),
            ));
        }

        let device = self.model.device();
        let mut kv_cache = KvCache::new(self.model.num_layers());
        let mut sampler = Sampler::new(params);
        let mut generated: Vec<u32> = Vec::with_capacity(params.max_new_tokens);
        let mut stop_reason = StopReason::MaxTokens;

        let start = Instant::now();
        let mut input = Tensor::new(prompt_ids, device)?.unsqueeze(0)?;
        for step in 0..params.max_new_tokens {
            let logits = self.model.forward_cached(&input, &mut kv_cache)?;
            let next = sampler.sample(&logits)?;

            if self.eos_token_ids.contains(&next) {
                tracing::debug!(step, token = next, "end of sequence");
                stop_reason = StopReason::Eos;
                break;
            }

            generated.push(next);
            on_token(next)?;
            input = Tensor::new(&[next], device)?.unsqueeze(0)?;
        }

        let elapsed = start.elapsed().as_secs_f64();
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let tokens_per_sec = if elapsed > 0.0 {
            generated.len() as f64 / elapsed
        } else {
            0.0
        };
        tracing::info!(
            new_tokens = generated.len(),
            elapsed_s = elapsed,
            tokens_per_sec,
            greedy = sampler.is_greedy(),
            kv_cache_bytes = kv_cache.memory_usage(),
            "generation finished"
        );

        let generated_text = self.tokenizer.decode(&generated, true)?;
        let all_tokens: Vec<u32> = prompt_ids.iter().chain(&generated).copied().collect();
        let full_text = self.tokenizer.decode(&all_tokens, true)?;

        Ok(GenerationResult {
            prompt_tokens: prompt_ids.to_vec(),
            total_tokens: all_tokens.len(),
            generated_tokens: generated,
            generated_text,
            full_text,
            stop_reason,
        })
    }

    /// Generate and stream decoded text chunks to `on_text`.
    ///
    /// With `skip_prompt`, the prompt is never passed to `on_text`;
    /// otherwise it is emitted first.  Special tokens are skipped.
    ///
    /// # Errors
    ///
    /// Same as [`generate`](Self::generate), plus decoding errors and the
    /// first error returned by `on_text`.
    pub fn generate_streaming<F>(
        &self,
        prompt_ids: &[u32],
        params: &GenerationParams,
        skip_prompt: bool,
        mut on_text: F,
    ) -> Result<GenerationResult>
    where
        F: FnMut(&str) -> Result<()>,
    {
        let mut stream = TokenStream::new(self.tokenizer).skip_prompt(skip_prompt);
        if let Some(text) = stream.push_prompt(prompt_ids)? {
            on_text(&text)?;
        }

        let result = self.generate(prompt_ids, params, |id| {
            if let Some(text) = stream.push(id)? {
                on_text(&text)?;
            }
            Ok(())
        })?;

        if let Some(text) = stream.finish()? {
            on_text(&text)?;
        }
        Ok(result)
    }
}
