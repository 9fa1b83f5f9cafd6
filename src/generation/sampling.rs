// SPDX-License-Identifier: MIT OR Apache-2.0

//! Next-token selection.
//!
//! [`Greedy`] takes the argmax of every row (ties go to the lowest id);
//! [`TemperatureSampler`] draws from a temperature-scaled softmax with a
//! seeded RNG, so a fixed seed reproduces a run exactly.

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{DecodeError, Result};

/// Chooses one token per batch row from processed logits.
pub trait TokenSelector {
    /// # Shapes
    /// - `logits`: `[batch, vocab]`
    /// - returns: `batch` token ids
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::ShapeMismatch`] if `logits` is not rank 2 or
    /// has an empty vocabulary, and [`DecodeError::Model`] on tensor
    /// operation failures.
    fn select(&mut self, logits: &Tensor) -> Result<Vec<u32>>;
}

/// Argmax selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct Greedy;

impl TokenSelector for Greedy {
    fn select(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        host_rows(logits)?.iter().map(|row| argmax(row)).collect()
    }
}

/// Temperature-scaled softmax sampling with a seeded RNG.
#[derive(Debug, Clone)]
pub struct TemperatureSampler {
    /// Softmax temperature, `> 0`.
    temperature: f32,
    /// Per-request random source.
    rng: StdRng,
}

impl TemperatureSampler {
    /// Create a sampler.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] unless `temperature` is finite and
    /// positive.
    pub fn new(temperature: f32, seed: u64) -> Result<Self> {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(DecodeError::Config(format!(
                "temperature must be finite and > 0, got {temperature}"
            )));
        }
        Ok(Self {
            temperature,
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

impl TokenSelector for TemperatureSampler {
    fn select(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        let rows = host_rows(logits)?;
        let mut tokens = Vec::with_capacity(rows.len());
        for row in &rows {
            let scaled: Vec<f32> = row.iter().map(|x| x / self.temperature).collect();

            // Numerically stable softmax.
            let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
            let sum: f32 = exp_vals.iter().sum();

            // Sample from the categorical distribution.
            let r: f32 = self.rng.r#gen::<f32>() * sum;
            let mut cumsum = 0.0;
            let mut chosen = None;
            for (idx, &p) in exp_vals.iter().enumerate() {
                cumsum += p;
                if p > 0.0 && r < cumsum {
                    chosen = Some(idx);
                    break;
                }
            }

            // Fallback to the most likely token (floating-point rounding edge case).
            let token = match chosen {
                Some(idx) => token_id(idx)?,
                None => argmax(row)?,
            };
            tokens.push(token);
        }
        Ok(tokens)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Copy `[batch, vocab]` logits to host `f32` rows.
fn host_rows(logits: &Tensor) -> Result<Vec<Vec<f32>>> {
    match logits.dims() {
        &[_, vocab] if vocab > 0 => Ok(logits.to_dtype(DType::F32)?.to_vec2::<f32>()?),
        dims => Err(DecodeError::ShapeMismatch(format!(
            "logits: expected [batch, vocab > 0], got {dims:?}"
        ))),
    }
}

/// Index of the largest value; the first one wins ties.
fn argmax(row: &[f32]) -> Result<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &x) in row.iter().enumerate() {
        if best.is_none_or(|(_, b)| x > b) {
            best = Some((idx, x));
        }
    }
    let (idx, _) = best.ok_or_else(|| DecodeError::ShapeMismatch("empty logits row".into()))?;
    token_id(idx)
}

/// Convert a vocabulary index to a token id.
fn token_id(idx: usize) -> Result<u32> {
    u32::try_from(idx)
        .map_err(|_| DecodeError::ShapeMismatch(format!("vocabulary index {idx} overflows u32")))
}
