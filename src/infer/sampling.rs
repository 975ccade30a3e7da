//! Next-token sampling
//!
//! Temperature sampling with optional nucleus (top-p) filtering. A temperature
//! of zero or below selects the argmax, which makes decoding deterministic.

use crate::error::{Error, Result};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::trace;

pub struct Sampler {
    rng: StdRng,
    temperature: f64,
    top_p: Option<f64>,
}

impl Sampler {
    /// Create a sampler; a seed makes sampling reproducible
    pub fn new(temperature: f64, top_p: Option<f64>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            rng,
            temperature,
            top_p: top_p.filter(|p| *p < 1.0),
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Pick the next token id from last-position logits
    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(Error::generation("empty logits"));
        }
        if self.is_greedy() {
            return Ok(argmax(logits));
        }

        let scaled: Vec<f32> = logits
            .iter()
            .map(|&logit| (logit as f64 / self.temperature) as f32)
            .collect();
        let probs = softmax(&scaled)?;

        let token = match self.top_p {
            Some(top_p) => self.sample_top_p(&probs, top_p)?,
            None => self.sample_weighted(&probs)?,
        };
        trace!("Sampled token {}", token);
        Ok(token)
    }

    fn sample_weighted(&mut self, probs: &[f32]) -> Result<u32> {
        let dist = WeightedIndex::new(probs)
            .map_err(|e| Error::generation(format!("Failed to create weighted distribution: {}", e)))?;
        Ok(dist.sample(&mut self.rng) as u32)
    }

    fn sample_top_p(&mut self, probs: &[f32], top_p: f64) -> Result<u32> {
        let nucleus = nucleus(probs, top_p);
        let weights: Vec<f32> = nucleus.iter().map(|&idx| probs[idx]).collect();

        let dist = WeightedIndex::new(&weights)
            .map_err(|e| Error::generation(format!("Failed to create top-p distribution: {}", e)))?;
        Ok(nucleus[dist.sample(&mut self.rng)] as u32)
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(idx, _)| idx as u32)
        .unwrap_or(0)
}

/// Smallest set of most likely token indices whose mass reaches `top_p`
fn nucleus(probs: &[f32], top_p: f64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..probs.len()).collect();
    indices.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut cumsum = 0.0f64;
    let mut cutoff = indices.len();
    for (i, &idx) in indices.iter().enumerate() {
        cumsum += probs[idx] as f64;
        if cumsum >= top_p {
            cutoff = i + 1;
            break;
        }
    }
    indices.truncate(cutoff.max(1));
    indices
}

fn softmax(logits: &[f32]) -> Result<Vec<f32>> {
    let max_logit = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut exp_logits: Vec<f32> = logits.iter().map(|&logit| (logit - max_logit).exp()).collect();

    let sum: f32 = exp_logits.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        return Err(Error::generation("softmax produced no probability mass"));
    }
    for p in exp_logits.iter_mut() {
        *p /= sum;
    }
    Ok(exp_logits)
}
