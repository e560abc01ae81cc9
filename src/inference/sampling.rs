//! Next-token distribution for the model-backed source.
//!
//! Temperature scaling, optional top-k and top-p (nucleus) filtering, then a multinomial draw.
//! The defaults reduce to plain multinomial sampling over the softmax.

use std::cmp::Ordering;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Sampling settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sampler {
    /// `<= 0` means greedy.
    pub temperature: f32,
    /// `0` disables top-k.
    pub top_k: usize,
    /// Values outside `[0, 1)` disable nucleus filtering.
    pub top_p: f32,
}

impl Default for Sampler {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
        }
    }
}

impl Sampler {
    #[must_use]
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    /// Draw a token id from raw logits.
    #[must_use]
    pub fn sample(&self, logits: &[f32], rng: &mut impl Rng) -> u32 {
        if self.temperature <= 0.0 {
            return argmax(logits);
        }

        let mut scaled: Vec<f32> = if (self.temperature - 1.0).abs() > 1e-6 {
            logits.iter().map(|v| v / self.temperature).collect()
        } else {
            logits.to_vec()
        };

        if self.top_k > 0 && self.top_k < scaled.len() {
            keep_top_k(&mut scaled, self.top_k);
        }
        if (0.0..1.0).contains(&self.top_p) {
            keep_nucleus(&mut scaled, self.top_p);
        }

        match softmax(&scaled) {
            Some(probs) => draw(&probs, rng),
            None => argmax(logits),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold(None::<(usize, f32)>, |best, (idx, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((idx, v)),
        })
        .map_or(0, |(idx, _)| idx as u32)
}

fn descending(a: &f32, b: &f32) -> Ordering {
    b.partial_cmp(a).unwrap_or(Ordering::Equal)
}

fn keep_top_k(logits: &mut [f32], k: usize) {
    let mut finite: Vec<f32> = logits.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() <= k {
        return;
    }
    finite.select_nth_unstable_by(k - 1, descending);
    let threshold = finite[k - 1];
    for v in logits.iter_mut().filter(|v| **v < threshold) {
        *v = f32::NEG_INFINITY;
    }
}

fn keep_nucleus(logits: &mut [f32], top_p: f32) {
    let Some(probs) = softmax(logits) else {
        return;
    };
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| descending(&probs[a], &probs[b]));

    let mut keep = vec![false; logits.len()];
    let mut mass = 0.0_f32;
    for idx in order {
        keep[idx] = true;
        mass += probs[idx];
        if mass > top_p {
            break;
        }
    }
    for (v, kept) in logits.iter_mut().zip(keep) {
        if !kept {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// `None` when no finite logit is left.
fn softmax(logits: &[f32]) -> Option<Vec<f32>> {
    let max = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return None;
    }
    let exps: Vec<f32> = logits
        .iter()
        .map(|&v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 {
        return None;
    }
    Some(exps.into_iter().map(|e| e / sum).collect())
}

#[allow(clippy::cast_possible_truncation)]
fn draw(probs: &[f32], rng: &mut impl Rng) -> u32 {
    let r: f32 = rng.r#gen();
    let mut cum = 0.0_f32;
    for (idx, &p) in probs.iter().enumerate() {
        cum += p;
        if r < cum {
            return idx as u32;
        }
    }
    // rounding left r above the final cumulative sum
    probs.iter().rposition(|p| *p > 0.0).unwrap_or(0) as u32
}
