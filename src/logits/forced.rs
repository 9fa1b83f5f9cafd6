// SPDX-License-Identifier: MIT OR Apache-2.0

//! Forced-token injection.
//!
//! A [`ForcedTokenTable`] maps generation steps to token ids; the
//! [`ForcedTokensProcessor`] turns the logits at a forced step into a
//! one-hot distribution (0 on the forced token, dtype minimum elsewhere)
//! and leaves every other step untouched.
//!
//! Tag tokens (language, task, `<|notimestamps|>`) and prompt tokens are
//! built independently; a [`ForcingPlan`] combines them and requires an
//! explicit [`PromptMerge`] when both are present.

use std::fmt;

use candle_core::Tensor;

use crate::error::{DecodeError, Result};
use crate::util::masks::dtype_min;

use super::{LogitProcessor, check_token};

// ---------------------------------------------------------------------------
// ForcedTokenTable
// ---------------------------------------------------------------------------

/// Largest step a [`ForcedTokenTable`] accepts.
///
/// Forced steps address decoder positions, and no Whisper checkpoint has
/// more than a few hundred of those.
pub const MAX_FORCED_STEP: usize = 4096;

/// Fixed-size map from generation step to forced token id.
///
/// The table is sized to the largest forced step plus one; unset slots
/// and every step beyond the table are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForcedTokenTable {
    /// `slots[step]` is the forced token at `step`, if any.
    slots: Vec<Option<u32>>,
}

impl ForcedTokenTable {
    /// Build a table from `(step, token)` pairs.
    ///
    /// Duplicate steps resolve to the last pair.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] if a step exceeds [`MAX_FORCED_STEP`].
    pub fn from_pairs(pairs: &[(usize, u32)]) -> Result<Self> {
        let mut len = 0;
        for &(step, _) in pairs {
            if step > MAX_FORCED_STEP {
                return Err(DecodeError::Config(format!(
                    "forced step {step} exceeds the limit of {MAX_FORCED_STEP}"
                )));
            }
            len = len.max(step + 1);
        }
        let mut slots = vec![None; len];
        for &(step, token) in pairs {
            if let Some(slot) = slots.get_mut(step) {
                *slot = Some(token);
            }
        }
        Ok(Self { slots })
    }

    /// Force `prompt` at consecutive steps starting at `start_index`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] if the last prompt step overflows or
    /// exceeds [`MAX_FORCED_STEP`].
    pub fn from_prompt(prompt: &[u32], start_index: usize) -> Result<Self> {
        let pairs = prompt
            .iter()
            .enumerate()
            .map(|(offset, &token)| {
                start_index
                    .checked_add(offset)
                    .map(|step| (step, token))
                    .ok_or_else(|| {
                        DecodeError::Config(format!(
                            "prompt step {start_index} + {offset} overflows"
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_pairs(&pairs)
    }

    /// Forced token at `step`, or `None` when unconstrained.
    ///
    /// Total over all steps: anything beyond the table is `None`.
    pub fn get(&self, step: usize) -> Option<u32> {
        self.slots.get(step).copied().flatten()
    }

    /// Table size: one past the largest forced step.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing is forced.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Forced `(step, token)` pairs in step order.
    pub fn pairs(&self) -> Vec<(usize, u32)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(step, token)| token.map(|t| (step, t)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ForcedTokensProcessor
// ---------------------------------------------------------------------------

/// Replaces the logits at forced steps with a one-hot distribution.
#[derive(Debug, Clone)]
pub struct ForcedTokensProcessor {
    /// Step → token table.
    table: ForcedTokenTable,
}

impl ForcedTokensProcessor {
    /// Wrap a table.
    #[must_use]
    pub const fn new(table: ForcedTokenTable) -> Self {
        Self { table }
    }

    /// Shortcut for [`ForcedTokenTable::from_pairs`].
    ///
    /// # Errors
    ///
    /// Same as [`ForcedTokenTable::from_pairs`].
    pub fn from_pairs(pairs: &[(usize, u32)]) -> Result<Self> {
        ForcedTokenTable::from_pairs(pairs).map(Self::new)
    }

    /// The underlying table.
    pub const fn table(&self) -> &ForcedTokenTable {
        &self.table
    }
}

impl LogitProcessor for ForcedTokensProcessor {
    fn process(&self, _tokens: &[Vec<u32>], logits: &Tensor, step: usize) -> Result<Tensor> {
        let Some(token) = self.table.get(step) else {
            // BORROW: cheap Arc clone of the storage handle
            return Ok(logits.clone());
        };
        let (batch, vocab) = logits.dims2().map_err(|_| {
            DecodeError::ShapeMismatch(format!(
                "logits: expected [batch, vocab], got {:?}",
                logits.dims()
            ))
        })?;
        let index = check_token(token, vocab)?;

        let mut row = vec![dtype_min(logits.dtype()); vocab];
        if let Some(slot) = row.get_mut(index) {
            *slot = 0.0;
        }
        let forced = Tensor::from_vec(row, (1, vocab), logits.device())?
            .to_dtype(logits.dtype())?
            .broadcast_as((batch, vocab))?
            .contiguous()?;
        Ok(forced)
    }
}

// ---------------------------------------------------------------------------
// ForcingPlan
// ---------------------------------------------------------------------------

/// How prompt tokens and tag tokens share the forced steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMerge {
    /// `[prompt..., start_token, tags...]`, renumbered from step 1.
    ///
    /// The decoder is then started with `<|startofprev|>` and
    /// `start_token` is `<|startoftranscript|>`.
    PromptThenTags {
        /// Token placed between the prompt and the tags.
        start_token: u32,
    },
    /// Tags keep their own steps; the prompt follows the last tag.
    TagsThenPrompt,
}

impl fmt::Display for PromptMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PromptThenTags { start_token } => {
                write!(f, "prompt, {start_token}, tags")
            }
            Self::TagsThenPrompt => write!(f, "tags, prompt"),
        }
    }
}

/// Forced tags plus an optional text prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForcingPlan {
    /// Tag tokens at fixed steps (language, task, `<|notimestamps|>`).
    pub tags: Vec<(usize, u32)>,
    /// Previous-context text tokens.
    pub prompt: Vec<u32>,
    /// Required when both `tags` and `prompt` are non-empty.
    pub merge: Option<PromptMerge>,
}

impl ForcingPlan {
    /// Tags only.
    #[must_use]
    pub const fn tags(tags: Vec<(usize, u32)>) -> Self {
        Self {
            tags,
            prompt: Vec::new(),
            merge: None,
        }
    }

    /// Prompt only; tokens are forced from step 1.
    #[must_use]
    pub const fn prompt(prompt: Vec<u32>) -> Self {
        Self {
            tags: Vec::new(),
            prompt,
            merge: None,
        }
    }

    /// Tags and prompt combined with an explicit merge order.
    #[must_use]
    pub const fn merged(tags: Vec<(usize, u32)>, prompt: Vec<u32>, merge: PromptMerge) -> Self {
        Self {
            tags,
            prompt,
            merge: Some(merge),
        }
    }

    /// Keep only the last `max_length / 2 - 1` prompt tokens, leaving
    /// context space for the prefix and the generated text.
    #[must_use]
    pub fn truncate_prompt(mut self, max_length: usize) -> Self {
        let keep = (max_length / 2).saturating_sub(1);
        let drop = self.prompt.len().saturating_sub(keep);
        self.prompt.drain(..drop);
        self
    }

    /// Extend a new-token budget by the prompt length, so forced prompt
    /// tokens do not eat into the generated text.
    #[must_use]
    pub fn extend_budget(&self, max_new_tokens: usize) -> usize {
        max_new_tokens + self.prompt.len()
    }

    /// Resolve the plan into a single table.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] if both tags and prompt are present
    /// without a [`PromptMerge`].
    pub fn table(&self) -> Result<ForcedTokenTable> {
        match (self.tags.is_empty(), self.prompt.is_empty(), self.merge) {
            (_, true, _) => ForcedTokenTable::from_pairs(&self.tags),
            (true, false, _) => ForcedTokenTable::from_prompt(&self.prompt, 1),
            (false, false, None) => Err(DecodeError::Config(
                "forcing both tags and a prompt requires an explicit PromptMerge".into(),
            )),
            (false, false, Some(PromptMerge::PromptThenTags { start_token })) => {
                let tags = ForcedTokenTable::from_pairs(&self.tags)?;
                let sequence: Vec<u32> = self
                    .prompt
                    .iter()
                    .copied()
                    .chain(std::iter::once(start_token))
                    .chain(tags.pairs().into_iter().map(|(_, token)| token))
                    .collect();
                ForcedTokenTable::from_prompt(&sequence, 1)
            }
            (false, false, Some(PromptMerge::TagsThenPrompt)) => {
                let tags = ForcedTokenTable::from_pairs(&self.tags)?;
                let start = tags.len().max(1);
                let mut pairs = tags.pairs();
                pairs.extend(
                    self.prompt
                        .iter()
                        .enumerate()
                        .map(|(offset, &token)| (start + offset, token)),
                );
                ForcedTokenTable::from_pairs(&pairs)
            }
        }
    }

    /// Processor for [`table`](Self::table).
    ///
    /// # Errors
    ///
    /// Same as [`table`](Self::table).
    pub fn processor(&self) -> Result<ForcedTokensProcessor> {
        self.table().map(ForcedTokensProcessor::new)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
