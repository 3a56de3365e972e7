// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation capture over a prompt.
//!
//! Runs one hooked forward pass, keeps the requested activations, and
//! decodes the model's greedy next token so the capture can be read next
//! to what the model went on to predict.

use candle_core::Tensor;

use crate::error::{ProbeError, Result};
use crate::hooks::{HookPoint, HookSpec};
use crate::inspect::last_position;
use crate::model::CausalLm;
use crate::sampling;
use crate::tokenizer::ProbeTokenizer;

/// One captured activation.
#[derive(Debug, Clone)]
pub struct Capture {
    /// Where it was captured.
    pub hook: HookPoint,
    /// The tensor, exactly as it flowed through the model.
    pub tensor: Tensor,
}

/// Everything captured for one prompt.
#[derive(Debug, Clone)]
pub struct TraceReport {
    /// Prompt text.
    pub prompt: String,
    /// Number of prompt tokens.
    pub token_count: usize,
    /// Captured activations, in request order.
    pub captures: Vec<Capture>,
    /// Shape of the output logits, `[batch, seq, vocab]`.
    pub logits_shape: Vec<usize>,
    /// Argmax id at the last position.
    pub final_token_id: u32,
    /// That id decoded (special tokens skipped).
    pub final_token: String,
}

impl TraceReport {
    /// Shape of the activation captured at `hook`.
    #[must_use]
    pub fn shape_of(&self, hook: &HookPoint) -> Option<&[usize]> {
        self.captures
            .iter()
            .find(|c| &c.hook == hook)
            .map(|c| c.tensor.dims())
    }
}

/// Check that every hook names a location the model produces.
///
/// # Errors
///
/// Returns [`ProbeError::Hook`] for [`HookPoint::Custom`] names and for
/// layer indices past the last layer.
// TRAIT_OBJECT: validation works for any CausalLm backend
pub fn validate_hooks(model: &dyn CausalLm, hooks: &[HookPoint]) -> Result<()> {
    let n_layers = model.num_layers();
    for hook in hooks {
        if let HookPoint::Custom(name) = hook {
            return Err(ProbeError::Hook(format!("unknown hook point `{name}`")));
        }
        if let Some(layer) = hook.layer() {
            if layer >= n_layers {
                return Err(ProbeError::Hook(format!(
                    "hook point `{hook}` is past the last layer (model has {n_layers} layers)"
                )));
            }
        }
    }
    Ok(())
}

/// Capture `hooks` while running `input_ids` through the model.
///
/// # Shapes
/// - `input_ids`: `[1, seq]`
///
/// # Errors
///
/// Returns [`ProbeError::Hook`] for invalid hooks (see
/// [`validate_hooks`]), [`ProbeError::Model`] on forward failures and
/// [`ProbeError::Tokenizer`] if the final token cannot be decoded.
// TRAIT_OBJECT: tracing works for any CausalLm backend
pub fn trace(
    model: &dyn CausalLm,
    tokenizer: &ProbeTokenizer,
    prompt: &str,
    input_ids: &Tensor,
    hooks: &[HookPoint],
) -> Result<TraceReport> {
    validate_hooks(model, hooks)?;

    let mut spec = HookSpec::new();
    for hook in hooks {
        spec.capture(hook.clone());
    }
    let cache = model.forward(input_ids, &spec)?;

    let captures = hooks
        .iter()
        .map(|hook| {
            Ok(Capture {
                hook: hook.clone(),
                tensor: cache.require(hook)?.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let logits = cache.output();
    let last = sampling::logits_to_vec(&last_position(logits)?)?;
    let final_token_id = sampling::argmax(&last)
        .ok_or_else(|| ProbeError::Model(candle_core::Error::Msg("empty logits".into())))?;
    let final_token = tokenizer.decode(&[final_token_id], true)?;

    tracing::debug!(
        prompt,
        captures = captures.len(),
        final_token_id,
        "trace complete"
    );

    Ok(TraceReport {
        prompt: prompt.to_owned(),
        token_count: input_ids.dim(1)?,
        captures,
        logits_shape: logits.dims().to_vec(),
        final_token_id,
        final_token,
    })
}
