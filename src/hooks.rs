// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for activation capture.
//!
//! Provides [`HookPoint`] (named locations in a forward pass),
//! [`HookSpec`] (which locations to capture) and [`HookCache`] (the
//! forward pass output plus the captured tensors).
//!
//! Capture never alters the forward computation: the backend clones the
//! tensor flowing past a requested point into the cache and carries on.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{ProbeError, Result};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where an activation can be captured.
///
/// Names follow the `HuggingFace` module paths of the checkpoint, so the
/// input to decoder layer 1 is `model.layers.1.input`.
///
/// # String conversion
///
/// ```
/// use candle_probe::HookPoint;
///
/// let hook = HookPoint::LayerInput(1);
/// assert_eq!(hook.to_string(), "model.layers.1.input");
///
/// let parsed: HookPoint = "model.layers.1.input".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
///
/// Unknown strings parse as [`HookPoint::Custom`], which no backend
/// produces; asking for one is reported when the capture is looked up.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Token embeddings (`model.embed_tokens.output`).
    Embed,
    /// Residual stream entering layer `i` (`model.layers.{i}.input`).
    LayerInput(usize),
    /// Query vectors, `[batch, heads, seq, head_dim]`, before `RoPE`.
    AttnQ(usize),
    /// Key vectors, `[batch, kv_heads, seq, head_dim]`, before `RoPE`.
    AttnK(usize),
    /// Value vectors, `[batch, kv_heads, seq, head_dim]`.
    AttnV(usize),
    /// Scaled pre-softmax scores, `[batch, heads, seq_q, seq_k]`, before masking.
    AttnScores(usize),
    /// Post-softmax attention pattern, `[batch, heads, seq_q, seq_k]`.
    AttnPattern(usize),
    /// Attention block output (`model.layers.{i}.self_attn.output`).
    AttnOut(usize),
    /// Residual stream after the attention block (`model.layers.{i}.post_attention`).
    PostAttention(usize),
    /// Normalised MLP input (`model.layers.{i}.mlp.input`).
    MlpIn(usize),
    /// MLP output (`model.layers.{i}.mlp.output`).
    MlpOut(usize),
    /// Residual stream leaving layer `i` (`model.layers.{i}.output`).
    LayerOutput(usize),
    /// After the final norm (`model.norm.output`).
    FinalNorm,
    /// Anything else.
    Custom(String),
}

impl HookPoint {
    /// Layer index this point belongs to, if any.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        match self {
            Self::LayerInput(i)
            | Self::AttnQ(i)
            | Self::AttnK(i)
            | Self::AttnV(i)
            | Self::AttnScores(i)
            | Self::AttnPattern(i)
            | Self::AttnOut(i)
            | Self::PostAttention(i)
            | Self::MlpIn(i)
            | Self::MlpOut(i)
            | Self::LayerOutput(i) => Some(*i),
            Self::Embed | Self::FinalNorm | Self::Custom(_) => None,
        }
    }

    /// Whether capturing this point needs the materialised attention
    /// pattern (and therefore the eager attention path).
    #[must_use]
    pub const fn needs_eager_attention(&self) -> bool {
        matches!(self, Self::AttnScores(_) | Self::AttnPattern(_))
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "model.embed_tokens.output"),
            Self::LayerInput(i) => write!(f, "model.layers.{i}.input"),
            Self::AttnQ(i) => write!(f, "model.layers.{i}.self_attn.q"),
            Self::AttnK(i) => write!(f, "model.layers.{i}.self_attn.k"),
            Self::AttnV(i) => write!(f, "model.layers.{i}.self_attn.v"),
            Self::AttnScores(i) => write!(f, "model.layers.{i}.self_attn.scores"),
            Self::AttnPattern(i) => write!(f, "model.layers.{i}.self_attn.pattern"),
            Self::AttnOut(i) => write!(f, "model.layers.{i}.self_attn.output"),
            Self::PostAttention(i) => write!(f, "model.layers.{i}.post_attention"),
            Self::MlpIn(i) => write!(f, "model.layers.{i}.mlp.input"),
            Self::MlpOut(i) => write!(f, "model.layers.{i}.mlp.output"),
            Self::LayerOutput(i) => write!(f, "model.layers.{i}.output"),
            Self::FinalNorm => write!(f, "model.norm.output"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Parse a module path into a [`HookPoint`].
///
/// Unknown strings produce [`HookPoint::Custom`] rather than an error.
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_path(s))
    }
}

/// Allow `hooks.capture("model.layers.1.input")` via `Into<HookPoint>`.
impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_path(s)
    }
}

/// Parse a module path, falling back to [`HookPoint::Custom`].
///
/// Bracket indexing (`model.layers[1].input`) is accepted as well as the
/// dotted form.
fn parse_hook_path(s: &str) -> HookPoint {
    let normalized = s.trim().replace('[', ".").replace(']', "");
    match normalized.as_str() {
        "model.embed_tokens.output" | "model.embed_tokens" => return HookPoint::Embed,
        "model.norm.output" | "model.norm" => return HookPoint::FinalNorm,
        _ => {}
    }

    if let Some(rest) = normalized.strip_prefix("model.layers.") {
        if let Some((layer_str, suffix)) = rest.split_once('.') {
            if let Ok(layer) = layer_str.parse::<usize>() {
                return match suffix {
                    "input" => HookPoint::LayerInput(layer),
                    "self_attn.q" => HookPoint::AttnQ(layer),
                    "self_attn.k" => HookPoint::AttnK(layer),
                    "self_attn.v" => HookPoint::AttnV(layer),
                    "self_attn.scores" => HookPoint::AttnScores(layer),
                    "self_attn.pattern" => HookPoint::AttnPattern(layer),
                    "self_attn.output" => HookPoint::AttnOut(layer),
                    "post_attention" => HookPoint::PostAttention(layer),
                    "mlp.input" => HookPoint::MlpIn(layer),
                    "mlp.output" => HookPoint::MlpOut(layer),
                    "output" => HookPoint::LayerOutput(layer),
                    _ => HookPoint::Custom(s.to_string()),
                };
            }
        }
    }

    HookPoint::Custom(s.to_string())
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations to capture.
///
/// Passed to [`CausalLm::forward`](crate::CausalLm::forward).  When empty,
/// the forward pass makes no extra clones.
///
/// # Example
///
/// ```
/// use candle_probe::{HookPoint, HookSpec};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::AttnPattern(5))
///      .capture("model.layers.5.output");
/// assert_eq!(hooks.num_captures(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture during the forward pass.
    captures: HashSet<HookPoint>,
}

impl HookSpec {
    /// Create an empty hook specification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Check whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Whether nothing is requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Iterate over the requested hook points (unordered).
    pub fn iter(&self) -> impl Iterator<Item = &HookPoint> {
        self.captures.iter()
    }

    /// Whether any request at `layer` needs the eager attention path.
    #[must_use]
    pub fn needs_eager_attention(&self, layer: usize) -> bool {
        self.captures
            .iter()
            .any(|h| h.needs_eager_attention() && h.layer() == Some(layer))
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors captured during a forward pass, plus the output logits.
///
/// # Example
///
/// ```
/// use candle_probe::{HookCache, HookPoint};
/// use candle_core::{Device, Tensor};
///
/// let logits = Tensor::zeros((1, 10, 32000), candle_core::DType::F32, &Device::Cpu).unwrap();
/// let mut cache = HookCache::new(logits);
///
/// let resid = Tensor::zeros((1, 10, 64), candle_core::DType::F32, &Device::Cpu).unwrap();
/// cache.store(HookPoint::LayerInput(1), resid);
///
/// assert_eq!(cache.output().dims(), &[1, 10, 32000]);
/// assert!(cache.get(&HookPoint::LayerInput(1)).is_some());
/// ```
#[derive(Debug)]
pub struct HookCache {
    /// Output tensor from the forward pass (logits).
    output: Tensor,
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a new cache with the given output tensor and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Consume the cache and return the output tensor.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| ProbeError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Store a captured activation.  Called by backend implementations.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Replace the output tensor once the final logits are known.
    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }

    /// Number of captured tensors (excludes the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn hook_point_display_roundtrip() {
        let cases: Vec<(HookPoint, &str)> = vec![
            (HookPoint::Embed, "model.embed_tokens.output"),
            (HookPoint::FinalNorm, "model.norm.output"),
            (HookPoint::LayerInput(1), "model.layers.1.input"),
            (HookPoint::AttnQ(3), "model.layers.3.self_attn.q"),
            (HookPoint::AttnK(3), "model.layers.3.self_attn.k"),
            (HookPoint::AttnV(3), "model.layers.3.self_attn.v"),
            (HookPoint::AttnScores(7), "model.layers.7.self_attn.scores"),
            (HookPoint::AttnPattern(5), "model.layers.5.self_attn.pattern"),
            (HookPoint::AttnOut(2), "model.layers.2.self_attn.output"),
            (HookPoint::PostAttention(11), "model.layers.11.post_attention"),
            (HookPoint::MlpIn(1), "model.layers.1.mlp.input"),
            (HookPoint::MlpOut(4), "model.layers.4.mlp.output"),
            (HookPoint::LayerOutput(9), "model.layers.9.output"),
        ];

        for (hook, expected) in cases {
            assert_eq!(hook.to_string(), expected, "Display failed for {hook:?}");
            let parsed: HookPoint = expected.parse().unwrap();
            assert_eq!(parsed, hook, "FromStr failed for {expected:?}");
        }
    }

    #[test]
    fn bracket_indexing_is_accepted() {
        let hook: HookPoint = "model.layers[1].input".parse().unwrap();
        assert_eq!(hook, HookPoint::LayerInput(1));
        assert_eq!(HookPoint::from("model.norm"), HookPoint::FinalNorm);
    }

    #[test]
    fn unknown_string_becomes_custom() {
        let hook: HookPoint = "lm_head.weight".parse().unwrap();
        assert_eq!(hook, HookPoint::Custom("lm_head.weight".to_string()));
        let hook: HookPoint = "model.layers.x.input".parse().unwrap();
        assert!(matches!(hook, HookPoint::Custom(_)));
    }

    #[test]
    fn hook_spec_capture_and_query() {
        let mut spec = HookSpec::new();
        assert!(spec.is_empty());

        spec.capture(HookPoint::AttnPattern(5));
        spec.capture("model.layers.3.output");

        assert!(!spec.is_empty());
        assert_eq!(spec.num_captures(), 2);
        assert!(spec.is_captured(&HookPoint::AttnPattern(5)));
        assert!(spec.is_captured(&HookPoint::LayerOutput(3)));
        assert!(!spec.is_captured(&HookPoint::Embed));
        assert!(spec.needs_eager_attention(5));
        assert!(!spec.needs_eager_attention(3));
    }

    #[test]
    fn require_reports_missing_hook() {
        let t = Tensor::zeros(1, candle_core::DType::F32, &candle_core::Device::Cpu).unwrap();
        let cache = HookCache::new(t);
        let err = cache.require(&HookPoint::Embed).unwrap_err();
        assert!(err.to_string().contains("model.embed_tokens.output"));
    }
}
