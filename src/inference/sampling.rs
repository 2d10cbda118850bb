//! Token sampling: repetition penalty, temperature, top-k, top-p.
//!
//! Filters run in that order on a copy of the step's logits, then one token is
//! drawn from what survives.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::inference::error::GenerationError;
use crate::inference::request::GenerationParams;

/// Per-request sampler. Owns its RNG so concurrent requests never share state.
pub struct Sampler {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    repetition_penalty: f32,
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: &GenerationParams) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            temperature: params.temperature,
            top_k: params.top_k as usize,
            top_p: params.top_p,
            repetition_penalty: params.repetition_penalty,
            rng,
        }
    }

    /// Draws the next token from `logits`, given every token seen so far
    pub fn sample(&mut self, logits: &[f32], history: &[u32]) -> Result<u32, GenerationError> {
        let mut logits = logits.to_vec();
        apply_repetition_penalty(&mut logits, history, self.repetition_penalty);
        apply_temperature(&mut logits, self.temperature);

        let candidates = top_k(&logits, self.top_k);
        if candidates.is_empty() {
            return Err(GenerationError::Decode(
                "no finite logits to sample from".to_string(),
            ));
        }

        let probs = top_p(softmax(candidates), self.top_p);
        Ok(draw(&probs, self.rng.gen::<f32>()))
    }
}

/// Divides positive logits of seen tokens by `penalty` and multiplies negative ones
pub fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let mut seen = vec![false; logits.len()];
    for &tok in history {
        let idx = tok as usize;
        if idx < logits.len() && !seen[idx] {
            seen[idx] = true;
            let score = logits[idx];
            logits[idx] = if score > 0.0 {
                score / penalty
            } else {
                score * penalty
            };
        }
    }
}

/// Rescales logits relative to the largest one, so tiny temperatures cannot overflow
///
/// A `+inf` logit is a certain pick: it becomes 0 and every other logit is masked.
pub fn apply_temperature(logits: &mut [f32], temperature: f32) {
    if logits.contains(&f32::INFINITY) {
        for v in logits.iter_mut() {
            *v = if *v == f32::INFINITY { 0.0 } else { f32::NEG_INFINITY };
        }
        return;
    }

    let max = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return;
    }
    for v in logits.iter_mut() {
        *v = (*v - max) / temperature;
    }
}

/// Finite `(token, logit)` pairs sorted by descending logit, truncated to `k` (0 keeps all)
pub fn top_k(logits: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = logits
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, l)| l.is_finite())
        .map(|(i, l)| (i as u32, l))
        .collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

    if k > 0 && k < indexed.len() {
        indexed.truncate(k);
    }
    indexed
}

/// Normalizes sorted candidates into probabilities
pub fn softmax(candidates: Vec<(u32, f32)>) -> Vec<(u32, f32)> {
    let Some(&(_, max_logit)) = candidates.first() else {
        return candidates;
    };
    let mut probs: Vec<(u32, f32)> = candidates
        .into_iter()
        .map(|(i, l)| (i, (l - max_logit).exp()))
        .collect();
    let sum: f32 = probs.iter().map(|(_, p)| p).sum();
    for (_, p) in probs.iter_mut() {
        *p /= sum;
    }
    probs
}

/// Keeps the smallest prefix whose cumulative probability reaches `p`, never fewer than one
pub fn top_p(mut probs: Vec<(u32, f32)>, p: f32) -> Vec<(u32, f32)> {
    if p >= 1.0 {
        return probs;
    }
    let mut cumsum = 0.0f32;
    let mut cutoff = probs.len();
    for (i, &(_, prob)) in probs.iter().enumerate() {
        cumsum += prob;
        if cumsum >= p {
            cutoff = i + 1;
            break;
        }
    }
    probs.truncate(cutoff.max(1));
    probs
}

/// Picks a token given a uniform draw `r` in [0, 1)
fn draw(probs: &[(u32, f32)], r: f32) -> u32 {
    let total: f32 = probs.iter().map(|(_, p)| p).sum();
    let target = r * total;

    let mut acc = 0.0f32;
    for &(idx, p) in probs {
        acc += p;
        if acc > target {
            return idx;
        }
    }
    probs.last().map(|(idx, _)| *idx).unwrap_or(0)
}
