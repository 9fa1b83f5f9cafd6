// SPDX-License-Identifier: MIT OR Apache-2.0

//! Caller-supplied stopping criteria.

/// Decides, after each generated token, whether decoding should stop.
///
/// Closures `Fn(&[Vec<u32>]) -> bool` implement this trait directly.
pub trait StoppingCriterion: Send + Sync {
    /// `sequences` holds every row including the token just appended.
    fn should_stop(&self, sequences: &[Vec<u32>]) -> bool;
}

impl<F> StoppingCriterion for F
where
    F: Fn(&[Vec<u32>]) -> bool + Send + Sync,
{
    fn should_stop(&self, sequences: &[Vec<u32>]) -> bool {
        self(sequences)
    }
}

/// Stops once every row contains one of the given tokens at or after
/// position `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOnTokens {
    /// Tokens that end a row.
    tokens: Vec<u32>,
    /// First position inspected (usually the prompt length).
    from: usize,
}

impl StopOnTokens {
    /// Stop on any of `tokens` appearing at or after position `from`.
    #[must_use]
    pub const fn new(tokens: Vec<u32>, from: usize) -> Self {
        Self { tokens, from }
    }
}

impl StoppingCriterion for StopOnTokens {
    fn should_stop(&self, sequences: &[Vec<u32>]) -> bool {
        sequences.iter().all(|row| {
            row.get(self.from..)
                .is_some_and(|tail| tail.iter().any(|t| self.tokens.contains(t)))
        })
    }
}
