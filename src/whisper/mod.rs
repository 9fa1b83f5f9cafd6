// SPDX-License-Identifier: MIT OR Apache-2.0

//! Whisper encoder-decoder model.
//!
//! [`WhisperModel`] loads a `HuggingFace` Whisper checkpoint (or random
//! weights through a `VarMap`) and implements [`Seq2SeqBackend`].
//!
//! Weight layout follows the `transformers` naming:
//! `model.encoder.*`, `model.decoder.*` and, for untied checkpoints,
//! `proj_out.weight`.

pub mod attention;
mod decoder;
mod encoder;
mod mlp;

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tracing::info;

use crate::backend::{
    DecoderMasks, Seq2SeqBackend, create_var_builder, resolve_safetensors_paths,
};
use crate::cache::DecoderKvCache;
use crate::config::WhisperConfig;
use crate::error::{DecodeError, Result};

pub use attention::Attention;
pub use decoder::WhisperDecoder;
pub use encoder::WhisperEncoder;

// ---------------------------------------------------------------------------
// WhisperModel
// ---------------------------------------------------------------------------

/// Whisper encoder-decoder with an incrementally cached decoder.
pub struct WhisperModel {
    /// Audio encoder.
    encoder: WhisperEncoder,
    /// Text decoder and vocabulary projection.
    decoder: WhisperDecoder,
    /// Model configuration.
    config: WhisperConfig,
    /// Device holding the weights.
    device: Device,
    /// Compute dtype; caches are allocated in it.
    dtype: DType,
}

impl WhisperModel {
    /// Load a model from a [`VarBuilder`] rooted at the checkpoint top level.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] if the configuration is invalid, or
    /// [`DecodeError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(
        config: WhisperConfig,
        device: &Device,
        dtype: DType,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        config.validate()?;
        let vb_model = vb.pp("model");
        let encoder = WhisperEncoder::load(&config, vb_model.pp("encoder"))?;
        let decoder = WhisperDecoder::load(&config, vb_model.pp("decoder"), vb.clone())?;

        info!(
            d_model = config.d_model,
            encoder_layers = config.encoder_layers,
            decoder_layers = config.decoder_layers,
            vocab_size = config.vocab_size,
            ?dtype,
            "loaded whisper model"
        );

        Ok(Self {
            encoder,
            decoder,
            config,
            device: device.clone(),
            dtype,
        })
    }

    /// Load `config.json` and safetensors weights from a local directory.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Io`] if files cannot be read,
    /// [`DecodeError::Config`] if the configuration is invalid or weights
    /// are missing, and [`DecodeError::Model`] if weight loading fails.
    pub fn from_dir(dir: impl AsRef<Path>, device: &Device, dtype: DType) -> Result<Self> {
        let dir = dir.as_ref();
        let config_path = dir.join("config.json");
        let config_str = std::fs::read_to_string(&config_path)?;
        let json: serde_json::Value = serde_json::from_str(&config_str)
            .map_err(|e| DecodeError::Config(format!("parse {}: {e}", config_path.display())))?;
        let config = WhisperConfig::from_hf_config(&json)?;

        let weights_paths = resolve_safetensors_paths(dir)?;
        info!(
            dir = %dir.display(),
            shards = weights_paths.len(),
            "loading whisper weights"
        );
        let vb = create_var_builder(&weights_paths, dtype, device)?;
        Self::load(config, device, dtype, vb)
    }

    /// Access the model configuration.
    #[must_use]
    pub const fn config(&self) -> &WhisperConfig {
        &self.config
    }

    /// Compute dtype.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }
}

// ---------------------------------------------------------------------------
// Seq2SeqBackend implementation
// ---------------------------------------------------------------------------

impl Seq2SeqBackend for WhisperModel {
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn num_decoder_layers(&self) -> usize {
        self.decoder.num_layers()
    }

    fn max_target_positions(&self) -> usize {
        self.decoder.max_target_positions()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn encode(&self, features: &Tensor) -> Result<Tensor> {
        let features = features.to_dtype(self.dtype)?;
        self.encoder.forward(&features)
    }

    fn new_cache(&self, batch: usize, max_len: usize) -> Result<DecoderKvCache> {
        if max_len > self.max_target_positions() {
            return Err(DecodeError::Config(format!(
                "max_len {max_len} exceeds max_target_positions {}",
                self.max_target_positions()
            )));
        }
        DecoderKvCache::new(
            self.decoder.num_layers(),
            batch,
            self.config.decoder_attention_heads,
            self.config.decoder_head_dim(),
            max_len,
            self.dtype,
            &self.device,
        )
    }

    fn decode(
        &self,
        input_ids: &Tensor,
        position_ids: &Tensor,
        encoder_hidden_states: &Tensor,
        masks: DecoderMasks<'_>,
        cache: Option<&mut DecoderKvCache>,
    ) -> Result<Tensor> {
        self.decoder
            .forward(input_ids, position_ids, encoder_hidden_states, masks, cache)
    }
}
