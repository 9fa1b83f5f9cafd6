// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incremental generation loop.
//!
//! A [`DecodeSession`] owns everything one request needs: the encoder
//! states, a fresh [`DecoderKvCache`], and the growing token rows.  It moves
//! through three states:
//!
//! 1. [`Prefill`](GenerationState::Prefill): the decoder prompt runs once
//!    as a whole, filling the cache; its last logits seed the first choice.
//! 2. [`Decode`](GenerationState::Decode): process logits, select a token
//!    per row, append it, then run the decoder on that single token.
//! 3. [`Done`](GenerationState::Done): EOS on every row, the length limit,
//!    or a [`StoppingCriterion`].
//!
//! [`step`](DecodeSession::step) performs exactly one transition, so a
//! caller can stop at any point and simply drop the session.

pub mod sampling;
pub mod stopping;

use std::fmt;

use candle_core::Tensor;
use tracing::{debug, trace};

use crate::backend::{DecoderMasks, Seq2SeqBackend};
use crate::cache::DecoderKvCache;
use crate::config::GenerationConfig;
use crate::error::{DecodeError, Result};
use crate::logits::LogitProcessorList;

pub use sampling::{Greedy, TemperatureSampler, TokenSelector};
pub use stopping::{StopOnTokens, StoppingCriterion};

// ---------------------------------------------------------------------------
// States and outputs
// ---------------------------------------------------------------------------

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every row produced the end-of-sequence token.
    Eos,
    /// Rows reached the maximum sequence length.
    MaxLength,
    /// A caller-supplied stopping criterion fired.
    Criterion,
    /// The session was finished before reaching `Done`.
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eos => write!(f, "eos"),
            Self::MaxLength => write!(f, "max length"),
            Self::Criterion => write!(f, "stopping criterion"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Generation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    /// Prompt not yet run through the decoder.
    Prefill,
    /// Producing one token per step.
    Decode,
    /// Terminal.
    Done(StopReason),
}

/// Result of a generation call.
#[derive(Debug)]
pub struct GenerationOutput {
    /// Full rows: prompt followed by generated tokens.  Rows that finished
    /// early are padded with the pad token.
    pub sequences: Vec<Vec<u32>>,
    /// Why generation ended.
    pub stop_reason: StopReason,
    /// Final cache, when the request asked to keep it.
    pub cache: Option<DecoderKvCache>,
}

// ---------------------------------------------------------------------------
// GenerationRequest
// ---------------------------------------------------------------------------

/// Per-request decoding parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Decoder prompt per batch row (e.g. `[<|startoftranscript|>]`).
    /// All rows must have the same non-zero length.
    pub prompt: Vec<Vec<u32>>,
    /// Maximum total row length, prompt included; also the cache capacity.
    pub max_length: usize,
    /// When set, overrides `max_length` with `prompt length + max_new_tokens`.
    pub max_new_tokens: Option<usize>,
    /// End-of-sequence token; `None` never stops on EOS.
    pub eos_token_id: Option<u32>,
    /// Emitted by rows that already produced EOS.
    pub pad_token_id: u32,
    /// Return the final cache in [`GenerationOutput::cache`].
    pub keep_cache: bool,
}

impl GenerationRequest {
    /// Request with the given prompt rows and length limit, no EOS.
    #[must_use]
    pub const fn new(prompt: Vec<Vec<u32>>, max_length: usize) -> Self {
        Self {
            prompt,
            max_length,
            max_new_tokens: None,
            eos_token_id: None,
            pad_token_id: 0,
            keep_cache: false,
        }
    }

    /// `batch` rows of `[decoder_start_token_id]` with the configured
    /// length limit and special tokens.
    #[must_use]
    pub fn from_generation_config(config: &GenerationConfig, batch: usize) -> Self {
        Self {
            prompt: vec![vec![config.decoder_start_token_id]; batch],
            max_length: config.max_length,
            max_new_tokens: None,
            eos_token_id: Some(config.eos_token_id),
            pad_token_id: config.pad_token_id,
            keep_cache: false,
        }
    }

    /// Set the end-of-sequence and pad tokens.
    #[must_use]
    pub fn with_eos(mut self, eos_token_id: u32, pad_token_id: u32) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self.pad_token_id = pad_token_id;
        self
    }

    /// Limit generated tokens instead of total length.
    #[must_use]
    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = Some(max_new_tokens);
        self
    }

    /// Keep the final cache for inspection.
    #[must_use]
    pub fn keep_cache(mut self, keep: bool) -> Self {
        self.keep_cache = keep;
        self
    }

    /// Validate the prompt; returns `(batch, prompt_len)`.
    fn prompt_shape(&self) -> Result<(usize, usize)> {
        let batch = self.prompt.len();
        let prompt_len = self.prompt.first().map_or(0, Vec::len);
        if batch == 0 || prompt_len == 0 {
            return Err(DecodeError::ShapeMismatch(
                "decoder prompt needs at least one row of at least one token".into(),
            ));
        }
        if let Some(row) = self.prompt.iter().find(|row| row.len() != prompt_len) {
            return Err(DecodeError::ShapeMismatch(format!(
                "decoder prompt rows must share one length: expected {prompt_len}, got {}",
                row.len()
            )));
        }
        Ok((batch, prompt_len))
    }

    /// Effective maximum row length for a prompt of `prompt_len` tokens.
    const fn effective_max_length(&self, prompt_len: usize) -> usize {
        match self.max_new_tokens {
            Some(n) => prompt_len + n,
            None => self.max_length,
        }
    }
}

// ---------------------------------------------------------------------------
// DecodeSession
// ---------------------------------------------------------------------------

/// One in-flight generation request.
pub struct DecodeSession<'a> {
    /// Model driving the decoder.
    backend: &'a dyn Seq2SeqBackend,
    /// Encoder output, computed once.
    encoder_hidden_states: Tensor,
    /// Self-attention cache owned by this request.
    cache: DecoderKvCache,
    /// Rows so far (prompt + generated).
    sequences: Vec<Vec<u32>>,
    /// Rows that already produced EOS.
    finished: Vec<bool>,
    /// Logits for the next token, `[batch, vocab]`.
    next_logits: Option<Tensor>,
    /// Processors applied before every choice.
    processors: &'a LogitProcessorList,
    /// Token choice policy.
    selector: &'a mut dyn TokenSelector,
    /// Extra stopping rules.
    // TRAIT_OBJECT: caller-defined criteria of arbitrary types
    criteria: Vec<Box<dyn StoppingCriterion + 'a>>,
    /// Maximum row length.
    max_length: usize,
    /// End-of-sequence token.
    eos_token_id: Option<u32>,
    /// Token for finished rows.
    pad_token_id: u32,
    /// Whether `finish` returns the cache.
    keep_cache: bool,
    /// Current state.
    state: GenerationState,
}

impl<'a> DecodeSession<'a> {
    /// Prepare a session over precomputed encoder states.
    ///
    /// Allocates a cache sized to the effective maximum length.
    ///
    /// # Errors
    ///
    /// - [`DecodeError::ShapeMismatch`] for an empty or ragged prompt, or
    ///   encoder states whose batch differs from the prompt's.
    /// - [`DecodeError::Config`] if the maximum length is smaller than the
    ///   prompt or exceeds the model's positional capacity.
    pub fn new(
        backend: &'a dyn Seq2SeqBackend,
        encoder_hidden_states: Tensor,
        request: &GenerationRequest,
        processors: &'a LogitProcessorList,
        selector: &'a mut dyn TokenSelector,
    ) -> Result<Self> {
        let (batch, prompt_len) = request.prompt_shape()?;
        let max_length = request.effective_max_length(prompt_len);
        if max_length < prompt_len {
            return Err(DecodeError::Config(format!(
                "max_length {max_length} is smaller than the prompt length {prompt_len}"
            )));
        }
        let enc_batch = encoder_hidden_states.dim(0)?;
        if enc_batch != batch {
            return Err(DecodeError::ShapeMismatch(format!(
                "encoder states have batch {enc_batch}, prompt has {batch} rows"
            )));
        }
        let cache = backend.new_cache(batch, max_length)?;

        debug!(batch, prompt_len, max_length, "decode session created");

        Ok(Self {
            backend,
            encoder_hidden_states,
            cache,
            sequences: request.prompt.clone(),
            finished: vec![false; batch],
            next_logits: None,
            processors,
            selector,
            criteria: Vec::new(),
            max_length,
            eos_token_id: request.eos_token_id,
            pad_token_id: request.pad_token_id,
            keep_cache: request.keep_cache,
            state: GenerationState::Prefill,
        })
    }

    /// Add a stopping criterion, checked after every generated token.
    #[must_use]
    pub fn with_stopping(mut self, criterion: impl StoppingCriterion + 'a) -> Self {
        self.criteria.push(Box::new(criterion));
        self
    }

    /// Current state.
    pub const fn state(&self) -> GenerationState {
        self.state
    }

    /// Rows so far.
    pub fn sequences(&self) -> &[Vec<u32>] {
        &self.sequences
    }

    /// The request's cache.
    pub const fn cache(&self) -> &DecoderKvCache {
        &self.cache
    }

    /// Perform one state transition and return the new state.
    ///
    /// `Done` is absorbing: stepping a finished session is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates backend, processor and selector errors.  After an error
    /// the cache may be partially written and the session should be
    /// dropped.
    pub fn step(&mut self) -> Result<GenerationState> {
        self.state = match self.state {
            GenerationState::Prefill => self.prefill()?,
            GenerationState::Decode => self.decode_step()?,
            done @ GenerationState::Done(_) => done,
        };
        Ok(self.state)
    }

    /// Step until `Done`; returns the stop reason.
    ///
    /// # Errors
    ///
    /// Same as [`step`](Self::step).
    pub fn run(&mut self) -> Result<StopReason> {
        loop {
            if let GenerationState::Done(reason) = self.step()? {
                return Ok(reason);
            }
        }
    }

    /// Consume the session.  A session that never reached `Done` reports
    /// [`StopReason::Cancelled`].
    pub fn finish(self) -> GenerationOutput {
        let stop_reason = match self.state {
            GenerationState::Done(reason) => reason,
            GenerationState::Prefill | GenerationState::Decode => StopReason::Cancelled,
        };
        GenerationOutput {
            sequences: self.sequences,
            stop_reason,
            cache: self.keep_cache.then_some(self.cache),
        }
    }

    /// Run the whole prompt through the decoder, filling the cache.
    fn prefill(&mut self) -> Result<GenerationState> {
        let prompt_len = self.current_len();
        if prompt_len >= self.max_length {
            debug!(prompt_len, "prompt already fills max_length");
            return Ok(GenerationState::Done(StopReason::MaxLength));
        }
        let logits = self.run_decoder(0)?;
        debug!(prompt_len, cursor = self.cache.cursor(), "prefill complete");
        self.next_logits = Some(logits);
        Ok(GenerationState::Decode)
    }

    /// Choose and append one token per row, then feed it to the decoder.
    fn decode_step(&mut self) -> Result<GenerationState> {
        let step = self.current_len();
        let logits = self.next_logits.take().ok_or_else(|| {
            DecodeError::CacheMisuse(format!("decode step {step} without pending logits"))
        })?;

        let processed = self.processors.apply(&self.sequences, &logits, step)?;
        let chosen = self.selector.select(&processed)?;
        if chosen.len() != self.sequences.len() {
            return Err(DecodeError::ShapeMismatch(format!(
                "selector returned {} tokens for {} rows",
                chosen.len(),
                self.sequences.len()
            )));
        }

        for ((row, done), token) in self
            .sequences
            .iter_mut()
            .zip(self.finished.iter_mut())
            .zip(chosen)
        {
            if *done {
                row.push(self.pad_token_id);
            } else {
                row.push(token);
                *done = self.eos_token_id == Some(token);
            }
        }
        trace!(step, tokens = ?self.last_tokens(), "tokens selected");

        if self.finished.iter().all(|&done| done) {
            debug!(length = step + 1, "all rows reached eos");
            return Ok(GenerationState::Done(StopReason::Eos));
        }
        if step + 1 >= self.max_length {
            debug!(length = step + 1, "max_length reached");
            return Ok(GenerationState::Done(StopReason::MaxLength));
        }
        if self.criteria.iter().any(|c| c.should_stop(&self.sequences)) {
            debug!(length = step + 1, "stopping criterion fired");
            return Ok(GenerationState::Done(StopReason::Criterion));
        }

        // Position of the token just appended.
        self.next_logits = Some(self.run_decoder(step)?);
        Ok(GenerationState::Decode)
    }

    /// Run the decoder over rows from position `start` to the end and
    /// return the logits of the last position.
    ///
    /// # Shapes
    /// - returns: `[batch, vocab]`
    fn run_decoder(&mut self, start: usize) -> Result<Tensor> {
        let batch = self.sequences.len();
        let len = self.current_len() - start;
        let device = self.backend.device();

        let ids: Vec<u32> = self
            .sequences
            .iter()
            .flat_map(|row| row.iter().skip(start).copied())
            .collect();
        let first = u32::try_from(start)
            .map_err(|_| DecodeError::Config(format!("position {start} overflows u32")))?;
        let end = u32::try_from(start + len)
            .map_err(|_| DecodeError::Config(format!("position {} overflows u32", start + len)))?;
        let positions: Vec<u32> = (0..batch).flat_map(|_| first..end).collect();

        let input_ids = Tensor::from_vec(ids, (batch, len), device)?;
        let position_ids = Tensor::from_vec(positions, (batch, len), device)?;
        let logits = self.backend.decode(
            &input_ids,
            &position_ids,
            &self.encoder_hidden_states,
            DecoderMasks::none(),
            Some(&mut self.cache),
        )?;
        Ok(logits.narrow(1, len - 1, 1)?.squeeze(1)?)
    }

    /// Current row length (all rows share it).
    fn current_len(&self) -> usize {
        self.sequences.first().map_or(0, Vec::len)
    }

    /// Last token of every row.
    fn last_tokens(&self) -> Vec<u32> {
        self.sequences
            .iter()
            .filter_map(|row| row.last().copied())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// One-shot entry point
// ---------------------------------------------------------------------------

/// Encode `features` once and decode to completion.
///
/// # Shapes
/// - `features`: `[batch, channels, time]`, `batch` equal to the number
///   of prompt rows
///
/// # Errors
///
/// Propagates encoder, session and decoding errors.
pub fn generate(
    backend: &dyn Seq2SeqBackend,
    features: &Tensor,
    request: &GenerationRequest,
    processors: &LogitProcessorList,
    selector: &mut dyn TokenSelector,
) -> Result<GenerationOutput> {
    let encoder_hidden_states = backend.encode(features)?;
    let mut session = DecodeSession::new(
        backend,
        encoder_hidden_states,
        request,
        processors,
        selector,
    )?;
    let reason = session.run()?;
    debug!(%reason, "generation finished");
    Ok(session.finish())
}
