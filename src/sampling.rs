// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token selection from logits.
//!
//! [`Sampler`] implements greedy decoding and temperature + top-k +
//! nucleus (top-p) sampling over a seedable [`StdRng`].  The free functions
//! ([`argmax`], [`top_k`], [`softmax`]) work on plain `f32` slices and are
//! shared with next-token inspection.

use candle_core::{DType, Tensor};
use rand::SeedableRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

use crate::error::{ProbeError, Result};
use crate::settings::GenerationParams;

// ---------------------------------------------------------------------------
// Slice helpers
// ---------------------------------------------------------------------------

/// Copy a logits tensor of any shape and dtype into a flat `f32` vector.
///
/// # Errors
///
/// Returns [`ProbeError::Model`] if the dtype conversion fails.
pub fn logits_to_vec(logits: &Tensor) -> Result<Vec<f32>> {
    // PROMOTE: BF16/F16 logits are compared and exponentiated in F32
    Ok(logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?)
}

/// Index of the largest logit.  Ties go to the lower id; NaNs never win.
///
/// Returns `None` for an empty slice.
#[must_use]
pub fn argmax(logits: &[f32]) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in logits.iter().enumerate() {
        match best {
            Some((_, best_value)) if value <= best_value || value.is_nan() => {}
            _ if value.is_nan() => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| to_token_id(idx))
}

/// The `k` largest logits as `(id, logit)`, in descending order.  Ties go
/// to the lower id.  `k` larger than the vocabulary returns everything.
#[must_use]
pub fn top_k(logits: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
    // Stable sort keeps ascending ids among equal logits.
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed
        .into_iter()
        .take(k)
        .map(|(idx, logit)| (to_token_id(idx), logit))
        .collect()
}

/// Numerically stable softmax.
#[must_use]
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Vocabulary index to token id.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
const fn to_token_id(idx: usize) -> u32 {
    // Vocabularies are far below u32::MAX.
    idx as u32
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// Stateful token picker for one generation run.
///
/// # Example
///
/// ```
/// use candle_probe::{GenerationParams, Sampler};
/// use candle_core::{Device, Tensor};
///
/// let mut sampler = Sampler::new(&GenerationParams::greedy(16));
/// let logits = Tensor::new(&[0.1_f32, 2.0, -1.0], &Device::Cpu).unwrap();
/// assert_eq!(sampler.sample(&logits).unwrap(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Softmax temperature.
    temperature: f64,
    /// Nucleus threshold.
    top_p: f64,
    /// Candidates kept before the nucleus cut (`0` keeps all).
    top_k: usize,
    /// Always take the argmax.
    greedy: bool,
    /// Random source for sampling.
    rng: StdRng,
}

impl Sampler {
    /// Build a sampler from decoding parameters.
    ///
    /// Greedy when sampling is disabled or `temperature <= 0`.  Seeded
    /// from `params.seed` when set, otherwise from OS entropy.
    #[must_use]
    pub fn new(params: &GenerationParams) -> Self {
        let rng = params
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self {
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            greedy: !params.do_sample || params.temperature <= 0.0,
            rng,
        }
    }

    /// Whether this sampler always picks the argmax.
    #[must_use]
    pub const fn is_greedy(&self) -> bool {
        self.greedy
    }

    /// Pick the next token.
    ///
    /// # Shapes
    /// - `logits`: `[vocab]` or `[1, vocab]`
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Model`] if the logits are empty, cannot be
    /// read as `f32`, or leave no finite probability mass.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits = logits_to_vec(logits)?;
        if self.greedy {
            return argmax(&logits).ok_or_else(empty_logits_error);
        }
        self.sample_from(&logits)
    }

    /// Temperature, top-k and nucleus sampling over a logit slice.
    fn sample_from(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(empty_logits_error());
        }

        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let temperature = self.temperature as f32;
        let scaled: Vec<f32> = logits.iter().map(|x| x / temperature).collect();
        let candidates = nucleus(&softmax(&scaled), self.top_k, self.top_p);

        let weights: Vec<f32> = candidates.iter().map(|&(_, p)| p).collect();
        let dist = WeightedIndex::new(&weights).map_err(|e| {
            ProbeError::Model(candle_core::Error::Msg(format!(
                "cannot sample from logits: {e}"
            )))
        })?;
        let pick = dist.sample(&mut self.rng);

        candidates
            .get(pick)
            .map(|&(id, _)| id)
            .ok_or_else(empty_logits_error)
    }
}

/// Candidate set for sampling.
///
/// Keeps the `top_k` most probable tokens (all when `top_k` is 0), then the
/// smallest prefix of those whose renormalised mass reaches `top_p`;
/// always at least one token.  `WeightedIndex` renormalises the kept mass.
fn nucleus(probs: &[f32], top_k: usize, top_p: f64) -> Vec<(u32, f32)> {
    let mut sorted: Vec<(u32, f32)> = probs
        .iter()
        .enumerate()
        .map(|(idx, &p)| (to_token_id(idx), p))
        .collect();
    // Stable sort keeps ascending ids among equal probabilities.
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
    if top_k > 0 {
        sorted.truncate(top_k);
    }

    if top_p >= 1.0 {
        return sorted;
    }

    let kept_mass: f64 = sorted.iter().map(|&(_, p)| f64::from(p)).sum();
    let mut cumulative = 0.0_f64;
    let mut keep = 0;
    for &(_, p) in &sorted {
        keep += 1;
        cumulative += f64::from(p) / kept_mass;
        if cumulative >= top_p {
            break;
        }
    }
    sorted.truncate(keep.max(1));
    sorted
}

/// Error for logits with nothing to pick.
fn empty_logits_error() -> ProbeError {
    ProbeError::Model(candle_core::Error::Msg("empty logits".into()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::settings::DEFAULT_SAMPLE_TOP_K;
    use candle_core::Device;

    fn params(temperature: f64, top_p: f64, seed: u64) -> GenerationParams {
        GenerationParams {
            temperature,
            top_p,
            top_k: 0,
            max_new_tokens: 8,
            seed: Some(seed),
            do_sample: true,
        }
    }

    #[test]
    fn argmax_prefers_lower_id_on_ties() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, 2.0]), Some(1));
        assert_eq!(argmax(&[]), None);
        assert_eq!(argmax(&[f32::NAN, -1.0]), Some(1));
    }

    #[test]
    fn top_k_is_descending_with_stable_ties() {
        let top = top_k(&[0.5, 2.0, 0.5, 3.0], 3);
        assert_eq!(top, vec![(3, 3.0), (1, 2.0), (0, 0.5)]);
        assert_eq!(top_k(&[1.0], 5).len(), 1);
    }

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn nucleus_keeps_smallest_prefix() {
        let kept = nucleus(&[0.1, 0.6, 0.3], 0, 0.8);
        let ids: Vec<u32> = kept.iter().map(|&(id, _)| id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn nucleus_always_keeps_one() {
        let kept = nucleus(&[0.2, 0.7, 0.1], 0, 0.0);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0, 1);
    }

    #[test]
    fn nucleus_disabled_at_one() {
        assert_eq!(nucleus(&[0.2, 0.7, 0.1], 0, 1.0).len(), 3);
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let mut sampler = Sampler::new(&params(0.0, 0.9, 1));
        assert!(sampler.is_greedy());
        let logits = Tensor::new(&[0.0_f32, 1.0, 5.0, 1.0], &Device::Cpu).unwrap();
        assert_eq!(sampler.sample(&logits).unwrap(), 2);
    }

    #[test]
    fn do_sample_false_is_greedy() {
        let sampler = Sampler::new(&GenerationParams::greedy(4));
        assert!(sampler.is_greedy());
    }

    #[test]
    fn tiny_top_p_reduces_to_argmax() {
        let mut sampler = Sampler::new(&params(1.0, 1e-6, 7));
        let logits = Tensor::new(&[[0.0_f32, 1.0, 4.0, 1.0]], &Device::Cpu).unwrap();
        for _ in 0..20 {
            assert_eq!(sampler.sample(&logits).unwrap(), 2);
        }
    }

    #[test]
    fn same_seed_same_tokens() {
        let logits = Tensor::new(&[1.0_f32, 1.1, 0.9, 1.05, 0.95], &Device::Cpu).unwrap();
        let mut a = Sampler::new(&params(1.0, 1.0, 42));
        let mut b = Sampler::new(&params(1.0, 1.0, 42));
        let seq_a: Vec<u32> = (0..32).map(|_| a.sample(&logits).unwrap()).collect();
        let seq_b: Vec<u32> = (0..32).map(|_| b.sample(&logits).unwrap()).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn sampling_stays_inside_nucleus() {
        // Token 3 carries ~0.2% of the mass and falls outside top_p = 0.9.
        let logits = Tensor::new(&[2.0_f32, 2.0, 2.0, -4.0], &Device::Cpu).unwrap();
        let mut sampler = Sampler::new(&params(1.0, 0.9, 3));
        for _ in 0..200 {
            assert_ne!(sampler.sample(&logits).unwrap(), 3);
        }
    }

    #[test]
    fn top_k_applies_before_nucleus() {
        // Token 2 falls to top_k; token 0 alone holds 0.625 of the kept
        // mass, below top_p, so token 1 stays.
        let kept = nucleus(&[0.5, 0.3, 0.2], 2, 0.9);
        let ids: Vec<u32> = kept.iter().map(|&(id, _)| id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn default_sampling_stays_inside_top_fifty() {
        // A flat distribution: top_p alone would keep 180 of 200 tokens.
        let logits = Tensor::from_vec(vec![0.0_f32; 200], 200, &Device::Cpu).unwrap();
        let params = GenerationParams {
            seed: Some(1),
            ..GenerationParams::default()
        };
        assert_eq!(params.top_k, DEFAULT_SAMPLE_TOP_K);

        let mut sampler = Sampler::new(&params);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..2000 {
            let id = sampler.sample(&logits).unwrap();
            assert!(id < 50, "sampled id {id} outside the top 50");
            seen.insert(id);
        }
        assert!(seen.len() > 1);
    }
}
