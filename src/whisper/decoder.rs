// SPDX-License-Identifier: MIT OR Apache-2.0

//! Whisper text decoder.
//!
//! Token and learned positional embeddings feed a stack of pre-norm layers,
//! each with causal self-attention (threaded through the
//! [`DecoderKvCache`]), cross-attention over the encoder states, and a
//! feed-forward sublayer.

use candle_core::{DType, Module, Tensor};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder};
use tracing::trace;

use crate::backend::DecoderMasks;
use crate::cache::{DecoderKvCache, KvCacheEntry};
use crate::config::WhisperConfig;
use crate::error::{DecodeError, Result};

use super::attention::Attention;
use super::encoder::layer_norm;
use super::mlp::Mlp;

// ---------------------------------------------------------------------------
// DecoderLayer
// ---------------------------------------------------------------------------

/// One pre-norm decoder layer.
struct DecoderLayer {
    /// Causal self-attention, cached during generation.
    self_attn: Attention,
    /// Norm before self-attention.
    self_attn_layer_norm: LayerNorm,
    /// Cross-attention over encoder hidden states (never cached).
    encoder_attn: Attention,
    /// Norm before cross-attention.
    encoder_attn_layer_norm: LayerNorm,
    /// Feed-forward sublayer.
    mlp: Mlp,
    /// Norm before the feed-forward sublayer.
    final_layer_norm: LayerNorm,
}

impl DecoderLayer {
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &WhisperConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let d = config.d_model;
        let heads = config.decoder_attention_heads;
        Ok(Self {
            self_attn: Attention::load(d, heads, true, vb.pp("self_attn"))?,
            self_attn_layer_norm: layer_norm(config, vb.pp("self_attn_layer_norm"))?,
            encoder_attn: Attention::load(d, heads, false, vb.pp("encoder_attn"))?,
            encoder_attn_layer_norm: layer_norm(config, vb.pp("encoder_attn_layer_norm"))?,
            mlp: Mlp::load(d, config.decoder_ffn_dim, config.activation, vb.clone())?,
            final_layer_norm: layer_norm(config, vb.pp("final_layer_norm"))?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        encoder_hidden_states: &Tensor,
        masks: DecoderMasks<'_>,
        cache: Option<&mut KvCacheEntry>,
    ) -> Result<Tensor> {
        let h = self.self_attn_layer_norm.forward(x)?;
        let x = (x + self
            .self_attn
            .forward(&h, None, masks.decoder_padding, cache)?)?;

        let h = self.encoder_attn_layer_norm.forward(&x)?;
        let x = (&x
            + self.encoder_attn.forward(
                &h,
                Some(encoder_hidden_states),
                masks.encoder_padding,
                None,
            )?)?;

        let h = self.final_layer_norm.forward(&x)?;
        Ok((&x + self.mlp.forward(&h)?)?)
    }
}

// ---------------------------------------------------------------------------
// WhisperDecoder
// ---------------------------------------------------------------------------

/// Decoder stack plus the vocabulary projection.
pub struct WhisperDecoder {
    /// Token embedding matrix: `[vocab_size, d_model]`.
    embed_tokens: Embedding,
    /// Learned positions: `[max_target_positions, d_model]`.
    embed_positions: Embedding,
    /// Decoder layers.
    layers: Vec<DecoderLayer>,
    /// Final norm.
    layer_norm: LayerNorm,
    /// Separate vocabulary projection.  `None` when tied to `embed_tokens`.
    proj_out: Option<Linear>,
    /// `sqrt(d_model)` when `scale_embedding` is set.
    embed_scale: Option<f64>,
    /// Positional table size.
    max_target_positions: usize,
}

impl WhisperDecoder {
    /// Load the decoder.
    ///
    /// `vb` points at `model.decoder`; `vb_root` at the checkpoint root,
    /// where an untied `proj_out` lives.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Model`] if weight loading fails, or
    /// [`DecodeError::Config`] from the attention blocks.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &WhisperConfig, vb: VarBuilder<'_>, vb_root: VarBuilder<'_>) -> Result<Self> {
        let embed_tokens =
            candle_nn::embedding(config.vocab_size, config.d_model, vb.pp("embed_tokens"))?;
        let embed_positions = candle_nn::embedding(
            config.max_target_positions,
            config.d_model,
            vb.pp("embed_positions"),
        )?;

        let layers = (0..config.decoder_layers)
            .map(|i| DecoderLayer::load(config, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        let proj_out = if config.tie_word_embeddings {
            None
        } else {
            Some(candle_nn::linear_no_bias(
                config.d_model,
                config.vocab_size,
                vb_root.pp("proj_out"),
            )?)
        };

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let embed_scale = config
            .scale_embedding
            .then(|| (config.d_model as f64).sqrt());

        Ok(Self {
            embed_tokens,
            embed_positions,
            layers,
            layer_norm: layer_norm(config, vb.pp("layer_norm"))?,
            proj_out,
            embed_scale,
            max_target_positions: config.max_target_positions,
        })
    }

    /// Number of decoder layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Run the decoder stack and project to vocabulary logits.
    ///
    /// With a cache, every self-attention sublayer writes its keys/values
    /// for the new positions into its own layer entry.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` (u32)
    /// - `position_ids`: `[batch, seq]` (u32), absolute positions
    /// - `encoder_hidden_states`: `[batch, frames, d_model]`
    /// - `masks`: see [`DecoderMasks`]
    /// - returns: `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// - [`DecodeError::ShapeMismatch`] if `input_ids` and `position_ids`
    ///   disagree, or if with a cache any row of `position_ids` is not
    ///   `cursor..cursor + seq`.
    /// - [`DecodeError::CacheMisuse`] if the cache has a different number
    ///   of layers or is full.
    /// - [`DecodeError::Model`] on tensor operation failures.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        position_ids: &Tensor,
        encoder_hidden_states: &Tensor,
        masks: DecoderMasks<'_>,
        mut cache: Option<&mut DecoderKvCache>,
    ) -> Result<Tensor> {
        if input_ids.dims() != position_ids.dims() || input_ids.rank() != 2 {
            return Err(DecodeError::ShapeMismatch(format!(
                "input_ids {:?} and position_ids {:?} must both be [batch, seq]",
                input_ids.dims(),
                position_ids.dims()
            )));
        }
        let seq_len = input_ids.dim(1)?;
        if let Some(cache) = cache.as_deref() {
            if cache.n_layers() != self.layers.len() {
                return Err(DecodeError::CacheMisuse(format!(
                    "cache has {} layers, decoder has {}",
                    cache.n_layers(),
                    self.layers.len()
                )));
            }
            check_positions(position_ids, cache.cursor())?;
        }

        let mut x = self.embed_tokens.forward(input_ids)?;
        if let Some(scale) = self.embed_scale {
            x = (x * scale)?;
        }
        x = (x + self.embed_positions.forward(position_ids)?)?;

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            let entry = match cache.as_deref_mut() {
                Some(cache) => Some(cache.layer_mut(layer_idx)?),
                None => None,
            };
            x = layer.forward(&x, encoder_hidden_states, masks, entry)?;
        }
        trace!(
            seq = seq_len,
            cursor = cache.as_deref().map(DecoderKvCache::cursor),
            "decoder pass complete"
        );

        let x = self.layer_norm.forward(&x)?;
        self.project_logits(&x)
    }

    /// Positional table size; absolute positions must stay below it.
    pub const fn max_target_positions(&self) -> usize {
        self.max_target_positions
    }

    /// Project hidden states to vocabulary logits.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, seq, d_model]`
    /// - returns: `[batch, seq, vocab_size]`
    fn project_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        if let Some(head) = &self.proj_out {
            Ok(head.forward(hidden)?)
        } else {
            // Tied embeddings: logits = hidden @ embed_tokens^T
            let embed_weight = self.embed_tokens.embeddings();
            Ok(hidden.broadcast_matmul(&embed_weight.t()?)?)
        }
    }
}

/// Check that every row of `position_ids` is `cursor..cursor + seq`, the
/// slots the cache write is about to fill.
fn check_positions(position_ids: &Tensor, cursor: usize) -> Result<()> {
    let seq = position_ids.dim(1)?;
    let expected: Vec<u32> = (cursor..cursor + seq)
        .map(u32::try_from)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| DecodeError::Config(format!("position {cursor} + {seq} overflows u32")))?;
    let rows = position_ids.to_dtype(DType::U32)?.to_vec2::<u32>()?;
    if let Some(row) = rows.iter().find(|row| **row != expected) {
        return Err(DecodeError::ShapeMismatch(format!(
            "position_ids {row:?} do not continue the cache: expected {expected:?}"
        )));
    }
    Ok(())
}
