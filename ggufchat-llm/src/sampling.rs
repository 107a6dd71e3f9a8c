//! Sampler chain configuration and a reference CPU sampler.
//!
//! Every generation call samples through the same fixed chain: top-k
//! filtering, then nucleus (top-p) filtering, then temperature scaling, then
//! a draw from the resulting distribution. Engine adapters build their native
//! chain from [`SamplingParams::stages`]. [`LogitsSampler`] implements the
//! chain directly over a logits slice for contexts that expose raw logits.

use rand::SeedableRng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::backend::TokenSampler;
use crate::types::TokenId;

/// Seed the engine uses when none is configured.
pub const DEFAULT_SEED: u64 = 0xFFFF_FFFF;

/// Parameters of one sampler chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Logit divisor. Zero or below selects greedy decoding.
    pub temperature: f32,
    /// Cumulative probability mass kept by the nucleus filter.
    pub top_p: f32,
    /// Number of most likely tokens kept by the top-k filter. Zero disables it.
    pub top_k: usize,
    /// Seed for the final distribution draw.
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            seed: DEFAULT_SEED,
        }
    }
}

/// One stage of the sampler chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerStage {
    TopK(usize),
    TopP(f32),
    Temperature(f32),
    Distribution(u64),
}

impl SamplingParams {
    /// The chain stages in the order they must be applied.
    #[must_use]
    pub fn stages(&self) -> [SamplerStage; 4] {
        [
            SamplerStage::TopK(self.top_k),
            SamplerStage::TopP(self.top_p),
            SamplerStage::Temperature(self.temperature),
            SamplerStage::Distribution(self.seed),
        ]
    }

    /// Whether the chain reduces to picking the most likely token.
    #[must_use]
    pub fn is_greedy(&self) -> bool {
        self.temperature < 1e-7 || self.top_k == 1
    }
}

/// CPU implementation of the sampler chain.
pub struct LogitsSampler {
    rng: StdRng,
    params: SamplingParams,
    accepted: usize,
}

impl LogitsSampler {
    pub fn new(params: SamplingParams) -> Self {
        Self {
            rng: StdRng::seed_from_u64(params.seed),
            params,
            accepted: 0,
        }
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Number of tokens accepted into the sequence so far.
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Pick the next token from `logits`, indexed by token id, running the
    /// stages of [`SamplingParams::stages`] in order.
    ///
    /// Returns `None` only when `logits` is empty.
    pub fn sample(&mut self, logits: &[f32]) -> Option<TokenId> {
        let mut candidates: Vec<(TokenId, f32)> = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| (id as TokenId, logit))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        for stage in self.params.stages() {
            match stage {
                SamplerStage::TopK(k) => {
                    apply_top_k(&mut candidates, k);
                    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
                }
                SamplerStage::TopP(p) => apply_top_p(&mut candidates, p),
                SamplerStage::Temperature(_) if self.params.is_greedy() => break,
                SamplerStage::Temperature(temperature) => {
                    for (_, logit) in &mut candidates {
                        *logit /= temperature;
                    }
                }
                SamplerStage::Distribution(_) => {
                    let logits: Vec<f32> = candidates.iter().map(|(_, l)| *l).collect();
                    if let Some(token) = self.draw(&candidates, &softmax(&logits)) {
                        return Some(token);
                    }
                }
            }
        }

        // Greedy, or every weight collapsed to zero.
        Some(candidates[0].0)
    }

    fn draw(&mut self, candidates: &[(TokenId, f32)], weights: &[f32]) -> Option<TokenId> {
        let weights = normalize_weights(weights)?;
        let distr = WeightedIndex::new(&weights).ok()?;
        candidates.get(distr.sample(&mut self.rng)).map(|(id, _)| *id)
    }
}

fn apply_top_k(candidates: &mut Vec<(TokenId, f32)>, k: usize) {
    if k == 0 || k >= candidates.len() {
        return;
    }
    candidates.select_nth_unstable_by(k - 1, |a, b| b.1.total_cmp(&a.1));
    candidates.truncate(k);
}

// Expects candidates sorted by descending logit. Always keeps at least one.
fn apply_top_p(candidates: &mut Vec<(TokenId, f32)>, p: f32) {
    if p >= 1.0 {
        return;
    }
    let logits: Vec<f32> = candidates.iter().map(|(_, l)| *l).collect();
    let probs = softmax(&logits);
    let mut cumsum = 0.0;
    let mut keep = candidates.len();
    for (i, pr) in probs.iter().enumerate() {
        cumsum += pr;
        if cumsum >= p {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));
}

impl TokenSampler for LogitsSampler {
    fn accept(&mut self, _token: TokenId) {
        self.accepted += 1;
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits
        .iter()
        .copied()
        .filter(|l| l.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

fn normalize_weights(prs: &[f32]) -> Option<Vec<f32>> {
    let mut sanitized = Vec::with_capacity(prs.len());
    let mut sum = 0f64;
    for &w in prs {
        if w.is_finite() && w > 0.0 {
            sanitized.push(w);
            sum += w as f64;
        } else {
            sanitized.push(0.0);
        }
    }
    if !sum.is_finite() || sum <= f64::EPSILON {
        return None;
    }
    let inv = 1.0f32 / sum as f32;
    for w in &mut sanitized {
        *w *= inv;
    }
    Some(sanitized)
}
