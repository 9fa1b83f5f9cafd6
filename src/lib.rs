// SPDX-License-Identifier: MIT OR Apache-2.0

//! # whisper-decode
//!
//! Incremental encoder-decoder decoding for Whisper-style speech models,
//! built on [candle](https://github.com/huggingface/candle).
//!
//! The crate covers the decoding core only: attention masks, a
//! preallocated per-layer KV cache, the encoder/decoder stacks, logit
//! processors (forced tokens, timestamp grammar) and a step-wise
//! generation loop.  Feature extraction and tokenization stay outside.
//!
//! ## Example
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use whisper_decode::{
//!     GenerationConfig, GenerationRequest, Greedy, LogitProcessorList, WhisperModel, generate,
//! };
//!
//! # fn main() -> whisper_decode::Result<()> {
//! let model = WhisperModel::from_dir("whisper-tiny", &Device::Cpu, DType::F32)?;
//! let generation = GenerationConfig::default();
//! let features = Tensor::zeros((1, 80, 3000), DType::F32, &Device::Cpu)?;
//! let request = GenerationRequest::from_generation_config(&generation, 1);
//! let output = generate(&model, &features, &request, &LogitProcessorList::new(), &mut Greedy)?;
//! println!("{:?}", output.sequences);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `mmap`: memory-mapped safetensors loading, required for sharded
//!   checkpoints.
//! - `cuda`, `metal`: enable the matching candle backends; pass the
//!   resulting `Device` to [`WhisperModel::from_dir`] or
//!   [`WhisperModel::load`].

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod generation;
pub mod logits;
pub mod util;
pub mod whisper;

pub use backend::{DecoderMasks, Seq2SeqBackend, create_var_builder, resolve_safetensors_paths};
pub use cache::{CacheState, DecoderKvCache, KvCacheEntry};
pub use config::{Activation, GenerationConfig, WhisperConfig};
pub use error::{DecodeError, Result};
pub use generation::{
    DecodeSession, GenerationOutput, GenerationRequest, GenerationState, Greedy, StopOnTokens,
    StopReason, StoppingCriterion, TemperatureSampler, TokenSelector, generate,
};
pub use logits::{
    ForcedTokenTable, ForcedTokensProcessor, ForcingPlan, LogitProcessor, LogitProcessorList,
    MAX_FORCED_STEP, PromptMerge, TimestampConfig, TimestampProcessor,
};
pub use util::masks::{Causality, build_attention_mask};
pub use whisper::WhisperModel;
