// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logit lens: what each layer would predict if decoding stopped there.
//!
//! The residual stream leaving every layer is taken at the final position,
//! passed through the model's final norm and LM head, and ranked.  The
//! last layer's row reproduces the model's real next-token prediction.

use std::fmt;

use candle_core::Tensor;

use crate::error::Result;
use crate::hooks::{HookPoint, HookSpec};
use crate::inspect::{TokenPrediction, format_token};
use crate::model::CausalLm;
use crate::sampling;
use crate::tokenizer::ProbeTokenizer;

/// Predictions read off a single layer.
#[derive(Debug, Clone)]
pub struct LogitLensResult {
    /// Layer index (0-indexed).
    pub layer: usize,
    /// Top-k predictions, descending.
    pub predictions: Vec<TokenPrediction>,
}

/// Logit lens across all layers.
///
/// # Example
///
/// ```
/// use candle_probe::{LogitLensAnalysis, LogitLensResult, TokenPrediction};
///
/// let mut analysis = LogitLensAnalysis::new("Love".into(), 2);
/// for layer in 0..2 {
///     analysis.push(LogitLensResult {
///         layer,
///         predictions: vec![TokenPrediction {
///             token_id: 42,
///             token: " you".into(),
///             logit: 3.0,
///             probability: 0.8,
///         }],
///     });
/// }
/// assert_eq!(analysis.first_appearance("you", 1), Some(0));
/// ```
#[derive(Debug, Clone)]
pub struct LogitLensAnalysis {
    /// Input text that was analyzed.
    pub input_text: String,
    /// Results for each layer.
    pub layer_results: Vec<LogitLensResult>,
}

impl LogitLensAnalysis {
    /// Create an empty analysis with room for `n_layers` layers.
    #[must_use]
    pub fn new(input_text: String, n_layers: usize) -> Self {
        Self {
            input_text,
            layer_results: Vec::with_capacity(n_layers),
        }
    }

    /// Add a layer's result.
    pub fn push(&mut self, result: LogitLensResult) {
        self.layer_results.push(result);
    }

    /// `(token, probability)` of the top prediction at each layer.
    #[must_use]
    pub fn top_predictions(&self) -> Vec<(&str, f32)> {
        self.layer_results
            .iter()
            .filter_map(|r| r.predictions.first())
            .map(|p| (p.token.as_str(), p.probability))
            .collect()
    }

    /// First layer whose top `k` contains a token containing `token`.
    #[must_use]
    pub fn first_appearance(&self, token: &str, k: usize) -> Option<usize> {
        self.layer_results
            .iter()
            .find(|r| r.predictions.iter().take(k).any(|p| p.token.contains(token)))
            .map(|r| r.layer)
    }
}

impl fmt::Display for LogitLensAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Logit Lens ===")?;
        writeln!(f, "Input: {}", self.input_text)?;
        for result in &self.layer_results {
            let ranked: Vec<String> = result
                .predictions
                .iter()
                .map(|p| {
                    format!(
                        "{:?} ({:.1}%)",
                        format_token(&p.token),
                        p.probability * 100.0
                    )
                })
                .collect();
            writeln!(f, "  layer {:2}: {}", result.layer, ranked.join(", "))?;
        }
        Ok(())
    }
}

/// Run the logit lens over every layer at the final position.
///
/// # Shapes
/// - `input_ids`: `[1, seq]`
///
/// # Errors
///
/// Returns [`ProbeError::Model`](crate::ProbeError::Model) on tensor
/// failures and [`ProbeError::Tokenizer`](crate::ProbeError::Tokenizer)
/// if decoding fails.
// TRAIT_OBJECT: the lens works for any CausalLm backend
pub fn logit_lens(
    model: &dyn CausalLm,
    tokenizer: &ProbeTokenizer,
    input_text: &str,
    input_ids: &Tensor,
    k: usize,
) -> Result<LogitLensAnalysis> {
    let n_layers = model.num_layers();
    let mut hooks = HookSpec::new();
    for layer in 0..n_layers {
        hooks.capture(HookPoint::LayerOutput(layer));
    }
    let cache = model.forward(input_ids, &hooks)?;

    let mut analysis = LogitLensAnalysis::new(input_text.to_owned(), n_layers);
    for layer in 0..n_layers {
        let resid = cache.require(&HookPoint::LayerOutput(layer))?;
        // [1, seq, hidden] -> [1, hidden] at the final position
        let seq_len = resid.dim(1)?;
        let last = resid.narrow(1, seq_len.saturating_sub(1), 1)?.squeeze(1)?;
        let logits = model.project_to_vocab(&model.final_norm(&last)?)?;
        let logits = sampling::logits_to_vec(&logits.squeeze(0)?)?;
        let probs = sampling::softmax(&logits);

        let predictions = sampling::top_k(&logits, k)
            .into_iter()
            .map(|(token_id, logit)| {
                let idx = usize::try_from(token_id).unwrap_or(usize::MAX);
                Ok(TokenPrediction {
                    token_id,
                    token: tokenizer.decode(&[token_id], true)?,
                    logit,
                    probability: probs.get(idx).copied().unwrap_or(0.0),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        analysis.push(LogitLensResult { layer, predictions });
    }

    tracing::debug!(layers = n_layers, k, "logit lens complete");
    Ok(analysis)
}
