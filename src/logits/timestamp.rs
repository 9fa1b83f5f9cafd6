// SPDX-License-Identifier: MIT OR Apache-2.0

//! Whisper timestamp grammar as a logit processor.
//!
//! Token ids at or above `timestamp_begin` are timestamps.  From
//! `begin_index` on, the processor enforces:
//!
//! - `<|notimestamps|>` is never produced;
//! - timestamps come in pairs: after a lone timestamp only another
//!   timestamp or EOS may follow, after a pair only text or EOS;
//! - timestamps never decrease, and a closing timestamp may repeat the
//!   opening one while a new segment must start strictly later;
//! - the first timestamp is at most `max_initial_timestamp_index` steps
//!   past `timestamp_begin`;
//! - when the timestamps together outweigh the most likely text token,
//!   text is suppressed.

use candle_core::Tensor;

use crate::config::GenerationConfig;
use crate::error::{DecodeError, Result};
use crate::util::masks::dtype_min;

use super::{LogitProcessor, check_token, logits_to_rows, rows_to_logits};

// ---------------------------------------------------------------------------
// TimestampConfig
// ---------------------------------------------------------------------------

/// Token ids and positions the timestamp grammar needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampConfig {
    /// End-of-sequence token; ids below it are text.
    pub eos_token_id: u32,
    /// `<|notimestamps|>`.
    pub no_timestamps_token_id: u32,
    /// First timestamp token (`<|0.00|>`).
    pub timestamp_begin: u32,
    /// First step at which the model chooses freely.
    pub begin_index: usize,
    /// Cap on the first timestamp, in timestamp steps.
    pub max_initial_timestamp_index: Option<usize>,
}

impl TimestampConfig {
    /// Derive the token ids from a [`GenerationConfig`].
    ///
    /// `begin_index` is the first unforced step, i.e. the prompt length or
    /// the forced-token table size, whichever is larger.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] if the checkpoint has no
    /// `<|notimestamps|>` token.
    pub fn from_generation_config(config: &GenerationConfig, begin_index: usize) -> Result<Self> {
        let no_timestamps_token_id = config.no_timestamps_token_id.ok_or_else(|| {
            DecodeError::Config("timestamps require no_timestamps_token_id".into())
        })?;
        Ok(Self {
            eos_token_id: config.eos_token_id,
            no_timestamps_token_id,
            timestamp_begin: no_timestamps_token_id + 1,
            begin_index,
            max_initial_timestamp_index: config.max_initial_timestamp_index,
        })
    }
}

// ---------------------------------------------------------------------------
// TimestampProcessor
// ---------------------------------------------------------------------------

/// Enforces the timestamp grammar described in the module docs.
#[derive(Debug, Clone)]
pub struct TimestampProcessor {
    /// Token ids and positions.
    config: TimestampConfig,
}

impl TimestampProcessor {
    /// Wrap a configuration.
    #[must_use]
    pub const fn new(config: TimestampConfig) -> Self {
        Self { config }
    }

    /// Apply the grammar to one row.
    fn process_row(&self, tokens: &[u32], row: &mut [f64], step: usize, floor: f64) {
        let ts_begin = usize::try_from(self.config.timestamp_begin).unwrap_or(usize::MAX);
        let eos = usize::try_from(self.config.eos_token_id).unwrap_or(usize::MAX);
        let vocab = row.len();

        if let Some(slot) = usize::try_from(self.config.no_timestamps_token_id)
            .ok()
            .and_then(|i| row.get_mut(i))
        {
            *slot = floor;
        }
        if step < self.config.begin_index {
            return;
        }

        let sampled = tokens.get(self.config.begin_index..).unwrap_or(&[]);
        let is_timestamp = |t: &u32| *t >= self.config.timestamp_begin;
        let last_was_timestamp = sampled.last().is_some_and(is_timestamp);
        let penultimate_was_timestamp = sampled.len() < 2
            || sampled
                .get(sampled.len() - 2)
                .is_some_and(is_timestamp);

        if last_was_timestamp {
            if penultimate_was_timestamp {
                fill(row, ts_begin, vocab, floor);
            } else {
                fill(row, 0, eos, floor);
            }
        }

        if let Some(&last_ts) = sampled.iter().rev().find(|&&t| t >= self.config.timestamp_begin) {
            let last_ts = usize::try_from(last_ts).unwrap_or(usize::MAX);
            let upto = if last_was_timestamp && !penultimate_was_timestamp {
                last_ts
            } else {
                last_ts.saturating_add(1)
            };
            fill(row, ts_begin, upto, floor);
        }

        if step == self.config.begin_index {
            if let Some(max_initial) = self.config.max_initial_timestamp_index {
                let last_allowed = ts_begin.saturating_add(max_initial);
                fill(row, last_allowed.saturating_add(1), vocab, floor);
            }
        }

        // Sum of timestamp probability against the best text token.
        let log_norm = log_sum_exp(row);
        let timestamp_logprob = row.get(ts_begin..).map_or(f64::NEG_INFINITY, log_sum_exp) - log_norm;
        let max_text_logprob = row
            .get(..ts_begin.min(vocab))
            .unwrap_or(&[])
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
            - log_norm;
        if timestamp_logprob > max_text_logprob {
            fill(row, 0, ts_begin, floor);
        }
    }
}

impl LogitProcessor for TimestampProcessor {
    fn process(&self, tokens: &[Vec<u32>], logits: &Tensor, step: usize) -> Result<Tensor> {
        let mut rows = logits_to_rows(logits)?;
        if rows.len() != tokens.len() {
            return Err(DecodeError::ShapeMismatch(format!(
                "timestamp processor: {} token rows for {} logit rows",
                tokens.len(),
                rows.len()
            )));
        }
        let vocab = rows.first().map_or(0, Vec::len);
        check_token(self.config.no_timestamps_token_id, vocab)?;

        let floor = dtype_min(logits.dtype());
        for (row_tokens, row) in tokens.iter().zip(rows.iter_mut()) {
            self.process_row(row_tokens, row, step, floor);
        }
        rows_to_logits(rows, logits)
    }
}

/// Set `row[start..end]` to `value`, clamped to the row.
fn fill(row: &mut [f64], start: usize, end: usize, value: f64) {
    let end = end.min(row.len());
    if let Some(slice) = row.get_mut(start.min(end)..end) {
        slice.fill(value);
    }
}

/// Numerically stable `log(sum(exp(x)))`; `-inf` for an empty slice.
fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
