// SPDX-License-Identifier: MIT OR Apache-2.0

//! Whisper audio encoder.
//!
//! Two 1-D convolutions (the second with stride 2) turn
//! `[batch, num_mel_bins, 2 * max_source_positions]` features into
//! `max_source_positions` frames, a learned positional table is added, and
//! a stack of pre-norm self-attention layers runs without any cache.

use candle_core::{Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Embedding, LayerNorm, LayerNormConfig, VarBuilder};
use tracing::debug;

use crate::config::{Activation, WhisperConfig};
use crate::error::{DecodeError, Result};

use super::attention::Attention;
use super::mlp::{Mlp, apply_activation};

// ---------------------------------------------------------------------------
// EncoderLayer
// ---------------------------------------------------------------------------

/// One pre-norm encoder layer: self-attention then feed-forward.
struct EncoderLayer {
    /// Bidirectional self-attention.
    self_attn: Attention,
    /// Norm before self-attention.
    self_attn_layer_norm: LayerNorm,
    /// Feed-forward sublayer.
    mlp: Mlp,
    /// Norm before the feed-forward sublayer.
    final_layer_norm: LayerNorm,
}

impl EncoderLayer {
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &WhisperConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let d = config.d_model;
        Ok(Self {
            self_attn: Attention::load(d, config.encoder_attention_heads, false, vb.pp("self_attn"))?,
            self_attn_layer_norm: layer_norm(config, vb.pp("self_attn_layer_norm"))?,
            mlp: Mlp::load(d, config.encoder_ffn_dim, config.activation, vb.clone())?,
            final_layer_norm: layer_norm(config, vb.pp("final_layer_norm"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.self_attn_layer_norm.forward(x)?;
        let x = (x + self.self_attn.forward(&h, None, None, None)?)?;
        let h = self.final_layer_norm.forward(&x)?;
        Ok((&x + self.mlp.forward(&h)?)?)
    }
}

// ---------------------------------------------------------------------------
// WhisperEncoder
// ---------------------------------------------------------------------------

/// Convolutional front end plus transformer encoder stack.
pub struct WhisperEncoder {
    /// `num_mel_bins → d_model`, kernel 3, padding 1.
    conv1: Conv1d,
    /// `d_model → d_model`, kernel 3, stride 2, padding 1.
    conv2: Conv1d,
    /// Learned positions: `[max_source_positions, d_model]`.
    embed_positions: Embedding,
    /// Encoder layers.
    layers: Vec<EncoderLayer>,
    /// Final norm.
    layer_norm: LayerNorm,
    /// Expected input shape: `(num_mel_bins, frames)`.
    input_shape: (usize, usize),
    /// Convolution activation.
    activation: Activation,
}

impl WhisperEncoder {
    /// Load the encoder from the `model.encoder` [`VarBuilder`] prefix.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Model`] if weight loading fails, or
    /// [`DecodeError::Config`] from the attention blocks.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &WhisperConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let conv1 = candle_nn::conv1d(
            config.num_mel_bins,
            config.d_model,
            3,
            Conv1dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        let conv2 = candle_nn::conv1d(
            config.d_model,
            config.d_model,
            3,
            Conv1dConfig {
                padding: 1,
                stride: 2,
                ..Default::default()
            },
            vb.pp("conv2"),
        )?;
        let embed_positions = candle_nn::embedding(
            config.max_source_positions,
            config.d_model,
            vb.pp("embed_positions"),
        )?;

        let layers = (0..config.encoder_layers)
            .map(|i| EncoderLayer::load(config, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            conv1,
            conv2,
            embed_positions,
            layers,
            layer_norm: layer_norm(config, vb.pp("layer_norm"))?,
            input_shape: (config.num_mel_bins, config.input_frames()),
            activation: config.activation,
        })
    }

    /// Encode log-mel features into hidden states.
    ///
    /// # Shapes
    /// - `features`: `[batch, num_mel_bins, 2 * max_source_positions]`
    /// - returns: `[batch, max_source_positions, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::ShapeMismatch`] if `features` does not have
    /// the expected shape, or [`DecodeError::Model`] on tensor failures.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let (mels, frames) = self.input_shape;
        match features.dims() {
            &[_, m, f] if (m, f) == (mels, frames) => {}
            dims => {
                return Err(DecodeError::ShapeMismatch(format!(
                    "input features: expected [batch, {mels}, {frames}], got {dims:?}"
                )));
            }
        }

        let x = apply_activation(&self.conv1.forward(features)?, self.activation)?;
        let x = apply_activation(&self.conv2.forward(&x)?, self.activation)?;
        // [batch, d_model, frames / 2] → [batch, frames / 2, d_model]
        let x = x.transpose(1, 2)?;
        let (_, positions, _) = x.dims3()?;
        let mut x = x.broadcast_add(&self.embed_positions.embeddings().narrow(0, 0, positions)?)?;

        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        debug!(positions, layers = self.layers.len(), "encoder pass complete");
        Ok(self.layer_norm.forward(&x)?)
    }
}

/// Load a `LayerNorm` with the configured epsilon.
///
/// # Errors
///
/// Returns [`DecodeError::Model`] if weight loading fails.
#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
pub(super) fn layer_norm(config: &WhisperConfig, vb: VarBuilder<'_>) -> Result<LayerNorm> {
    let cfg = LayerNormConfig {
        eps: config.layer_norm_eps,
        ..Default::default()
    };
    Ok(candle_nn::layer_norm(config.d_model, cfg, vb)?)
}
