// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model seam and weight-loading helpers.
//!
//! [`Seq2SeqBackend`] is the interface the generation loop drives: one
//! encoder call per request, then cached decoder calls.  Any
//! encoder-decoder model that exposes these operations can be decoded
//! with the forced-token and timestamp machinery in this crate;
//! [`WhisperModel`](crate::WhisperModel) is the bundled implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use crate::cache::DecoderKvCache;
use crate::error::{DecodeError, Result};

// ---------------------------------------------------------------------------
// Seq2SeqBackend trait
// ---------------------------------------------------------------------------

/// Encoder-decoder model with an incrementally cached decoder.
pub trait Seq2SeqBackend: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Vocabulary size (width of the logits).
    fn vocab_size(&self) -> usize;

    /// Number of decoder layers (one cache entry each).
    fn num_decoder_layers(&self) -> usize;

    /// Largest number of decoder positions the model can embed.
    fn max_target_positions(&self) -> usize;

    /// Device holding the weights.
    fn device(&self) -> &Device;

    // --- Forward passes --------------------------------------------------

    /// Run the encoder once over input features.
    ///
    /// # Shapes
    /// - `features`: `[batch, channels, time]`
    /// - returns: `[batch, time', d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::ShapeMismatch`] for a wrongly shaped input
    /// and [`DecodeError::Model`] on tensor operation failures.
    fn encode(&self, features: &Tensor) -> Result<Tensor>;

    /// Allocate an empty decoder cache for one generation call.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] if `max_len` exceeds
    /// [`max_target_positions`](Self::max_target_positions), or
    /// [`DecodeError::Model`] if allocation fails.
    fn new_cache(&self, batch: usize, max_len: usize) -> Result<DecoderKvCache>;

    /// Run the decoder over `seq` new positions.
    ///
    /// With a cache, keys/values for the new positions are written into it
    /// (one position appends, several prefill) and attention covers every
    /// cached position.  `position_ids` must then be
    /// `cursor..cursor + seq` on every row.  Without a cache, the call is a
    /// plain full-sequence pass.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` (u32)
    /// - `position_ids`: `[batch, seq]` (u32), absolute positions
    /// - `encoder_hidden_states`: `[batch, time', d_model]`
    /// - returns: logits `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::CacheMisuse`] for an invalid cache write,
    /// [`DecodeError::ShapeMismatch`] for inconsistent inputs or positions
    /// that do not continue the cache, and [`DecodeError::Model`] on tensor
    /// operation failures.
    fn decode(
        &self,
        input_ids: &Tensor,
        position_ids: &Tensor,
        encoder_hidden_states: &Tensor,
        masks: DecoderMasks<'_>,
        cache: Option<&mut DecoderKvCache>,
    ) -> Result<Tensor>;
}

/// Optional key-padding masks for one decoder call.
///
/// Nonzero entries mark valid keys.  Padding is ANDed with the causal mask
/// in self-attention and is the only constraint in cross-attention.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderMasks<'t> {
    /// Decoder key padding, `[batch, key_len]`.  `key_len` is `seq` for an
    /// uncached call and the cache's `max_len` for a cached one, indexed by
    /// absolute position.
    pub decoder_padding: Option<&'t Tensor>,
    /// Encoder frame padding, `[batch, time']`.
    pub encoder_padding: Option<&'t Tensor>,
}

impl<'t> DecoderMasks<'t> {
    /// No padding on either side.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            decoder_padding: None,
            encoder_padding: None,
        }
    }

    /// Set the decoder key padding.
    #[must_use]
    pub const fn with_decoder_padding(mut self, padding: &'t Tensor) -> Self {
        self.decoder_padding = Some(padding);
        self
    }

    /// Set the encoder frame padding.
    #[must_use]
    pub const fn with_encoder_padding(mut self, padding: &'t Tensor) -> Self {
        self.encoder_padding = Some(padding);
        self
    }
}

// ---------------------------------------------------------------------------
// Weight loading helpers
// ---------------------------------------------------------------------------

/// Index structure for sharded safetensors checkpoints.
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name → shard filename.
    weight_map: HashMap<String, String>,
}

/// Resolve the safetensors files of a checkpoint directory.
///
/// Tries `model.safetensors.index.json` first (sharded), falls back to a
/// single `model.safetensors`.
///
/// # Errors
///
/// Returns [`DecodeError::Io`] if the index cannot be read,
/// [`DecodeError::Config`] if it cannot be parsed or a referenced file is
/// missing.
pub fn resolve_safetensors_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let index_path = dir.join("model.safetensors.index.json");
    if index_path.is_file() {
        let index_str = std::fs::read_to_string(&index_path)?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)
            .map_err(|e| DecodeError::Config(format!("parse {}: {e}", index_path.display())))?;

        // Collect unique shard filenames
        let mut shard_names: Vec<&String> = index.weight_map.values().collect();
        shard_names.sort();
        shard_names.dedup();

        return shard_names
            .into_iter()
            .map(|name| existing_file(dir.join(name)))
            .collect();
    }

    Ok(vec![existing_file(dir.join("model.safetensors"))?])
}

/// Return `path` if it names a file.
fn existing_file(path: PathBuf) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(DecodeError::Config(format!(
            "{} not found",
            path.display()
        )))
    }
}

/// Create a `VarBuilder` from safetensors file paths.
///
/// Uses buffered (safe) loading by default. With the `mmap` feature,
/// uses memory-mapped loading for reduced memory overhead on large models.
///
/// # Errors
///
/// Returns [`DecodeError::Io`] / [`DecodeError::Model`] if the files
/// cannot be read, or [`DecodeError::Config`] for sharded checkpoints
/// without the `mmap` feature.
pub fn create_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(paths, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(paths, dtype, device)
    }
}

/// Load weights via buffered (safe) reading: all data is read into RAM.
///
/// Only supports single-file checkpoints; sharded ones need the `mmap`
/// feature.
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    let path = match paths {
        [path] => path,
        [] => return Err(DecodeError::Config("no safetensors files".into())),
        _ => {
            return Err(DecodeError::Config(
                "sharded checkpoints require the `mmap` feature: \
                 whisper-decode = { features = [\"mmap\"] }"
                    .into(),
            ));
        }
    };
    let data = std::fs::read(path)?;
    Ok(candle_nn::VarBuilder::from_buffered_safetensors(
        data, dtype, device,
    )?)
}

/// Load weights via memory-mapped files.
///
/// # Safety
///
/// The safetensors files must not be modified while the model is loaded.
/// This is the standard invariant for memory-mapped files.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    // SAFETY: safetensors files must not be modified while loaded.
    let vb = unsafe { candle_nn::VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
