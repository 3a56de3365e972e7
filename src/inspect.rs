// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-step next-token inspection.
//!
//! One forward pass, no sampling: the final-position logits are ranked
//! and the top entries decoded.

use candle_core::{D, Tensor};

use crate::error::{ProbeError, Result};
use crate::hooks::HookSpec;
use crate::model::CausalLm;
use crate::sampling;
use crate::tokenizer::ProbeTokenizer;

/// One ranked vocabulary entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPrediction {
    /// Token id in the vocabulary.
    pub token_id: u32,
    /// Decoded token text (special tokens skipped).
    pub token: String,
    /// Raw logit.
    pub logit: f32,
    /// Softmax probability over the whole vocabulary.
    pub probability: f32,
}

/// Next-token distribution at the end of a prompt.
#[derive(Debug, Clone)]
pub struct NextTokenReport {
    /// Shape of the full output logits, `[batch, seq, vocab]`.
    pub logits_shape: Vec<usize>,
    /// The single most likely next token.
    pub argmax: TokenPrediction,
    /// The `k` most likely next tokens, descending; ties by lower id.
    pub top_k: Vec<TokenPrediction>,
    /// Final-position logits as `f32`.
    pub last_logits: Vec<f32>,
}

/// Run one forward pass and rank the next-token logits.
///
/// # Shapes
/// - `input_ids`: `[1, seq]`
///
/// # Errors
///
/// Returns [`ProbeError::Model`] on forward pass failure or empty logits
/// and [`ProbeError::Tokenizer`] if a token cannot be decoded.
// TRAIT_OBJECT: inspection works for any CausalLm backend
pub fn inspect_next_token(
    model: &dyn CausalLm,
    tokenizer: &ProbeTokenizer,
    input_ids: &Tensor,
    k: usize,
) -> Result<NextTokenReport> {
    let cache = model.forward(input_ids, &HookSpec::new())?;
    let logits = cache.output();
    let logits_shape = logits.dims().to_vec();

    let last_logits = sampling::logits_to_vec(&last_position(logits)?)?;
    let probs = sampling::softmax(&last_logits);

    let argmax_id = sampling::argmax(&last_logits)
        .ok_or_else(|| ProbeError::Model(candle_core::Error::Msg("empty logits".into())))?;
    let argmax = predict(tokenizer, &last_logits, &probs, argmax_id)?;

    let top_k = sampling::top_k(&last_logits, k)
        .into_iter()
        .map(|(id, _)| predict(tokenizer, &last_logits, &probs, id))
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!(
        argmax = argmax.token_id,
        probability = argmax.probability,
        "next-token inspection"
    );

    Ok(NextTokenReport {
        logits_shape,
        argmax,
        top_k,
        last_logits,
    })
}

/// Final-position slice of `[batch, seq, vocab]` logits for batch 0.
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab]`
/// - returns: `[vocab]`
///
/// # Errors
///
/// Returns [`ProbeError::Model`] if `logits` is not 3D or `seq` is 0.
pub fn last_position(logits: &Tensor) -> Result<Tensor> {
    let (_, seq_len, _) = logits.dims3()?;
    if seq_len == 0 {
        return Err(ProbeError::Model(candle_core::Error::Msg(
            "logits have no positions".into(),
        )));
    }
    Ok(logits.get(0)?.narrow(D::Minus2, seq_len - 1, 1)?.squeeze(0)?)
}

/// Decode one id into a prediction.
fn predict(
    tokenizer: &ProbeTokenizer,
    logits: &[f32],
    probs: &[f32],
    token_id: u32,
) -> Result<TokenPrediction> {
    let idx = usize::try_from(token_id)
        .map_err(|e| ProbeError::Model(candle_core::Error::Msg(e.to_string())))?;
    Ok(TokenPrediction {
        token_id,
        token: tokenizer.decode(&[token_id], true)?,
        logit: logits.get(idx).copied().unwrap_or(f32::NAN),
        probability: probs.get(idx).copied().unwrap_or(0.0),
    })
}

/// Format a token for display, escaping whitespace characters.
#[must_use]
pub fn format_token(token: &str) -> String {
    token
        .replace('\n', "\\n")
        .replace('\t', "\\t")
        .replace('\r', "\\r")
}
