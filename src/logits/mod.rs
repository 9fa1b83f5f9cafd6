// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logit processors: pure adjustments of next-token scores.
//!
//! A [`LogitProcessor`] maps `(tokens so far, logits, step)` to adjusted
//! logits.  The generation loop applies a caller-ordered
//! [`LogitProcessorList`] before every token choice.
//!
//! - [`ForcedTokensProcessor`]: one-hot override at fixed steps.
//! - [`TimestampProcessor`]: Whisper timestamp grammar.
//!
//! Suppressed scores are set to the minimum finite value of the logits'
//! dtype, never to `-inf`, so a fully suppressed row still softmaxes to a
//! finite distribution.

pub mod forced;
pub mod timestamp;

use candle_core::{DType, Tensor};

use crate::error::{DecodeError, Result};

pub use forced::{
    ForcedTokenTable, ForcedTokensProcessor, ForcingPlan, MAX_FORCED_STEP, PromptMerge,
};
pub use timestamp::{TimestampConfig, TimestampProcessor};

// ---------------------------------------------------------------------------
// LogitProcessor trait
// ---------------------------------------------------------------------------

/// A pure function adjusting next-token scores.
///
/// Implementations must not keep state across calls; anything that varies
/// per call (the step index, the tokens so far) arrives as an argument.
pub trait LogitProcessor: Send + Sync {
    /// Adjust the logits for the token produced at `step`.
    ///
    /// `step` is the index of the token about to be produced, i.e. the
    /// current length of every row of `tokens`.
    ///
    /// # Shapes
    /// - `tokens`: `batch` rows of length `step`
    /// - `logits`: `[batch, vocab]`
    /// - returns: `[batch, vocab]`, same dtype
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::ShapeMismatch`] if `logits` is not
    /// `[batch, vocab]` or a configured token is outside the vocabulary,
    /// and [`DecodeError::Model`] on tensor operation failures.
    fn process(&self, tokens: &[Vec<u32>], logits: &Tensor, step: usize) -> Result<Tensor>;
}

// ---------------------------------------------------------------------------
// LogitProcessorList
// ---------------------------------------------------------------------------

/// Ordered list of processors, applied first to last.
#[derive(Default)]
pub struct LogitProcessorList {
    /// Processors in application order.
    // TRAIT_OBJECT: heterogeneous processors composed at request time
    processors: Vec<Box<dyn LogitProcessor>>,
}

impl LogitProcessorList {
    /// Empty list (logits pass through unchanged).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a processor.
    pub fn push(&mut self, processor: impl LogitProcessor + 'static) {
        self.processors.push(Box::new(processor));
    }

    /// Builder-style [`push`](Self::push).
    #[must_use]
    pub fn with(mut self, processor: impl LogitProcessor + 'static) -> Self {
        self.push(processor);
        self
    }

    /// Number of processors.
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Apply every processor in order.
    ///
    /// # Errors
    ///
    /// Propagates the first processor error.
    pub fn apply(&self, tokens: &[Vec<u32>], logits: &Tensor, step: usize) -> Result<Tensor> {
        // BORROW: cheap Arc clone of the storage handle
        let mut logits = logits.clone();
        for processor in &self.processors {
            logits = processor.process(tokens, &logits, step)?;
        }
        Ok(logits)
    }
}

// ---------------------------------------------------------------------------
// Host-side helpers
// ---------------------------------------------------------------------------

/// Copy `[batch, vocab]` logits to host rows in `f64`.
///
/// # Errors
///
/// Returns [`DecodeError::ShapeMismatch`] if `logits` is not rank 2.
pub(crate) fn logits_to_rows(logits: &Tensor) -> Result<Vec<Vec<f64>>> {
    if logits.rank() != 2 {
        return Err(DecodeError::ShapeMismatch(format!(
            "logits: expected [batch, vocab], got {:?}",
            logits.dims()
        )));
    }
    Ok(logits.to_dtype(DType::F64)?.to_vec2::<f64>()?)
}

/// Rebuild a `[batch, vocab]` tensor with the dtype and device of `like`.
///
/// # Errors
///
/// Returns [`DecodeError::Model`] on tensor operation failures.
pub(crate) fn rows_to_logits(rows: Vec<Vec<f64>>, like: &Tensor) -> Result<Tensor> {
    let batch = rows.len();
    let vocab = rows.first().map_or(0, Vec::len);
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Ok(Tensor::from_vec(flat, (batch, vocab), like.device())?.to_dtype(like.dtype())?)
}

/// Check that `token` indexes into a vocabulary of `vocab` entries.
///
/// # Errors
///
/// Returns [`DecodeError::ShapeMismatch`] otherwise.
pub(crate) fn check_token(token: u32, vocab: usize) -> Result<usize> {
    usize::try_from(token)
        .ok()
        .filter(|&t| t < vocab)
        .ok_or_else(|| {
            DecodeError::ShapeMismatch(format!(
                "token {token} outside vocabulary of {vocab} entries"
            ))
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::Device;

    use super::*;

    /// Adds a constant to every score.
    struct Shift(f64);

    impl LogitProcessor for Shift {
        fn process(&self, _tokens: &[Vec<u32>], logits: &Tensor, _step: usize) -> Result<Tensor> {
            Ok((logits + self.0)?)
        }
    }

    /// Doubles every score.
    struct Double;

    impl LogitProcessor for Double {
        fn process(&self, _tokens: &[Vec<u32>], logits: &Tensor, _step: usize) -> Result<Tensor> {
            Ok((logits * 2.0)?)
        }
    }

    #[test]
    fn empty_list_passes_through() {
        let logits = Tensor::new(&[[1f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        let out = LogitProcessorList::new().apply(&[vec![]], &logits, 0).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0, 3.0]]);
    }

    #[test]
    fn processors_apply_in_order() {
        let logits = Tensor::new(&[[1f32, 2.0]], &Device::Cpu).unwrap();
        let shift_then_double = LogitProcessorList::new().with(Shift(1.0)).with(Double);
        let double_then_shift = LogitProcessorList::new().with(Double).with(Shift(1.0));
        assert_eq!(shift_then_double.len(), 2);

        let a = shift_then_double.apply(&[vec![]], &logits, 0).unwrap();
        let b = double_then_shift.apply(&[vec![]], &logits, 0).unwrap();
        assert_eq!(a.to_vec2::<f32>().unwrap(), vec![vec![4.0, 6.0]]);
        assert_eq!(b.to_vec2::<f32>().unwrap(), vec![vec![3.0, 5.0]]);
    }

    #[test]
    fn rows_round_trip_keeps_dtype() {
        let logits = Tensor::new(&[[1f32, -2.0], [0.5, 4.0]], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let rows = logits_to_rows(&logits).unwrap();
        let back = rows_to_logits(rows, &logits).unwrap();
        assert_eq!(back.dtype(), DType::F16);
        assert_eq!(back.dims(), &[2, 2]);
    }

    #[test]
    fn rank_three_logits_are_rejected() {
        let logits = Tensor::zeros((1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let err = logits_to_rows(&logits).unwrap_err();
        assert!(matches!(err, DecodeError::ShapeMismatch(_)));
    }
}
