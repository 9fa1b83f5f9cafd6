// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model hyper-parameters and generation configuration.
//!
//! [`WhisperConfig`] is parsed from a `HuggingFace` `config.json`;
//! [`GenerationConfig`] from the companion `generation_config.json`.
//! Both go through `serde_json::Value` with small typed extraction helpers
//! so that missing optional fields fall back to the Whisper defaults.
//!
//! # Usage
//!
//! ```
//! use whisper_decode::WhisperConfig;
//!
//! let config_str = r#"{"model_type": "whisper", "d_model": 384,
//!     "encoder_layers": 4, "decoder_layers": 4,
//!     "encoder_attention_heads": 6, "decoder_attention_heads": 6,
//!     "encoder_ffn_dim": 1536, "decoder_ffn_dim": 1536,
//!     "num_mel_bins": 80, "max_source_positions": 1500,
//!     "max_target_positions": 448, "vocab_size": 51865}"#;
//! let json: serde_json::Value = serde_json::from_str(config_str).unwrap();
//! let config = WhisperConfig::from_hf_config(&json).unwrap();
//! assert_eq!(config.decoder_head_dim(), 64);
//! ```

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::error::{DecodeError, Result};

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

/// Activation function used in the feed-forward sublayers.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Gaussian Error Linear Unit, exact (erf) variant.  Whisper's default.
    Gelu,
    /// Gaussian Error Linear Unit, tanh approximation (`gelu_new`).
    GeluApprox,
    /// Rectified linear unit.
    Relu,
}

impl Activation {
    /// Map a `HuggingFace` `activation_function` string.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] for unknown activation names.
    pub fn from_hf_name(name: &str) -> Result<Self> {
        match name {
            "gelu" => Ok(Self::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" => Ok(Self::GeluApprox),
            "relu" => Ok(Self::Relu),
            other => Err(DecodeError::Config(format!(
                "unsupported activation_function '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gelu => write!(f, "GELU"),
            Self::GeluApprox => write!(f, "GELU (tanh approx)"),
            Self::Relu => write!(f, "ReLU"),
        }
    }
}

// ---------------------------------------------------------------------------
// WhisperConfig
// ---------------------------------------------------------------------------

/// Hyper-parameters of a Whisper encoder-decoder checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct WhisperConfig {
    // --- Dimensions ----------------------------------------------------------
    /// Model width shared by encoder and decoder.
    pub d_model: usize,
    /// Number of encoder layers.
    pub encoder_layers: usize,
    /// Number of decoder layers.
    pub decoder_layers: usize,
    /// Attention heads per encoder layer.
    pub encoder_attention_heads: usize,
    /// Attention heads per decoder layer.
    pub decoder_attention_heads: usize,
    /// Encoder feed-forward width.
    pub encoder_ffn_dim: usize,
    /// Decoder feed-forward width.
    pub decoder_ffn_dim: usize,
    /// Mel channels of the input features.
    pub num_mel_bins: usize,
    /// Encoder positions after the stride-2 convolution (1500 for 30 s).
    pub max_source_positions: usize,
    /// Decoder positional-embedding table size (448).
    pub max_target_positions: usize,
    /// Vocabulary size.
    pub vocab_size: usize,

    // --- Architecture axes ---------------------------------------------------
    /// Feed-forward and convolution activation.
    pub activation: Activation,
    /// Whether token embeddings are multiplied by `sqrt(d_model)`.
    pub scale_embedding: bool,
    /// Whether logits reuse the token embedding matrix.
    pub tie_word_embeddings: bool,
    /// Epsilon of every `LayerNorm`.
    pub layer_norm_eps: f64,

    // --- Special tokens ------------------------------------------------------
    /// First token fed to the decoder (`<|startoftranscript|>`).
    pub decoder_start_token_id: u32,
    /// End-of-sequence token.
    pub eos_token_id: u32,
    /// Padding token, emitted by rows that already finished.
    pub pad_token_id: u32,
}

impl WhisperConfig {
    /// Parse a [`WhisperConfig`] from a `HuggingFace` `config.json` value.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] if `model_type` is present and not
    /// `whisper`, if a required dimension is missing, or if
    /// [`validate`](Self::validate) fails.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        match config.get("model_type").and_then(Value::as_str) {
            None | Some("whisper") => {}
            Some(other) => {
                return Err(DecodeError::Config(format!(
                    "unsupported model_type '{other}', expected 'whisper'"
                )));
            }
        }

        let activation = config
            .get("activation_function")
            .and_then(Value::as_str)
            .map_or(Ok(Activation::Gelu), Activation::from_hf_name)?;

        let parsed = Self {
            d_model: get_usize(config, "d_model")?,
            encoder_layers: get_usize(config, "encoder_layers")?,
            decoder_layers: get_usize(config, "decoder_layers")?,
            encoder_attention_heads: get_usize(config, "encoder_attention_heads")?,
            decoder_attention_heads: get_usize(config, "decoder_attention_heads")?,
            encoder_ffn_dim: get_usize(config, "encoder_ffn_dim")?,
            decoder_ffn_dim: get_usize(config, "decoder_ffn_dim")?,
            num_mel_bins: get_usize_or(config, "num_mel_bins", 80),
            max_source_positions: get_usize_or(config, "max_source_positions", 1500),
            max_target_positions: get_usize_or(config, "max_target_positions", 448),
            vocab_size: get_usize(config, "vocab_size")?,

            activation,
            scale_embedding: get_bool_or(config, "scale_embedding", false),
            tie_word_embeddings: get_bool_or(config, "tie_word_embeddings", true),
            layer_norm_eps: get_f64_or(config, "layer_norm_eps", 1e-5),

            decoder_start_token_id: get_token_or(config, "decoder_start_token_id", 50258)?,
            eos_token_id: get_token_or(config, "eos_token_id", 50257)?,
            pad_token_id: get_token_or(config, "pad_token_id", 50257)?,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check the structural constraints the attention blocks rely on.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] if a head count is zero, if
    /// `d_model` is not divisible by a head count, or if a layer count or
    /// the vocabulary is empty.
    pub fn validate(&self) -> Result<()> {
        for (name, heads) in [
            ("encoder_attention_heads", self.encoder_attention_heads),
            ("decoder_attention_heads", self.decoder_attention_heads),
        ] {
            if heads == 0 || self.d_model % heads != 0 {
                return Err(DecodeError::Config(format!(
                    "d_model ({}) must be divisible by {name} ({heads})",
                    self.d_model
                )));
            }
        }
        if self.decoder_layers == 0 {
            return Err(DecodeError::Config("decoder_layers must be > 0".into()));
        }
        if self.vocab_size == 0 {
            return Err(DecodeError::Config("vocab_size must be > 0".into()));
        }
        Ok(())
    }

    /// Per-head width of decoder attention.
    pub const fn decoder_head_dim(&self) -> usize {
        if self.decoder_attention_heads == 0 {
            0
        } else {
            self.d_model / self.decoder_attention_heads
        }
    }

    /// Number of time frames the encoder expects (`2 * max_source_positions`).
    pub const fn input_frames(&self) -> usize {
        2 * self.max_source_positions
    }
}

// ---------------------------------------------------------------------------
// GenerationConfig
// ---------------------------------------------------------------------------

/// Decoding defaults from a `generation_config.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Maximum total sequence length, prompt included.
    pub max_length: usize,
    /// First token fed to the decoder.
    pub decoder_start_token_id: u32,
    /// End-of-sequence token.
    pub eos_token_id: u32,
    /// Padding token for finished rows.
    pub pad_token_id: u32,
    /// `<|notimestamps|>`; `None` for checkpoints without timestamp tokens.
    pub no_timestamps_token_id: Option<u32>,
    /// Whether the checkpoint emits language and task tags.
    pub is_multilingual: bool,
    /// Language tag (`<|en|>`, ...) to token id.
    pub lang_to_id: HashMap<String, u32>,
    /// Task tag (`transcribe`, `translate`) to token id.
    pub task_to_id: HashMap<String, u32>,
    /// Largest timestamp offset allowed as the first timestamp.
    pub max_initial_timestamp_index: Option<usize>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 448,
            decoder_start_token_id: 50258,
            eos_token_id: 50257,
            pad_token_id: 50257,
            no_timestamps_token_id: None,
            is_multilingual: false,
            lang_to_id: HashMap::new(),
            task_to_id: HashMap::new(),
            max_initial_timestamp_index: None,
        }
    }
}

impl GenerationConfig {
    /// Parse a `HuggingFace` `generation_config.json` value.
    ///
    /// Absent fields take the Whisper defaults.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] if a token id or a `lang_to_id` /
    /// `task_to_id` entry is not a valid `u32`.
    pub fn from_hf_generation_config(config: &Value) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_length: get_usize_or(config, "max_length", defaults.max_length),
            decoder_start_token_id: get_token_or(
                config,
                "decoder_start_token_id",
                defaults.decoder_start_token_id,
            )?,
            eos_token_id: get_token_or(config, "eos_token_id", defaults.eos_token_id)?,
            pad_token_id: get_token_or(config, "pad_token_id", defaults.pad_token_id)?,
            no_timestamps_token_id: get_optional_token(config, "no_timestamps_token_id")?,
            is_multilingual: get_bool_or(config, "is_multilingual", false),
            lang_to_id: get_token_map(config, "lang_to_id")?,
            task_to_id: get_token_map(config, "task_to_id")?,
            max_initial_timestamp_index: get_optional_usize(
                config,
                "max_initial_timestamp_index",
            ),
        })
    }

    /// Build the tag forcing list for a request.
    ///
    /// Multilingual checkpoints get `(1, <|lang|>)` when a language is
    /// given and `(2, <|task|>)` (default `transcribe`).  Without
    /// timestamps, `<|notimestamps|>` is forced at the next index unless it
    /// is already in the list.
    ///
    /// `language` accepts either the tag (`<|en|>`) or the bare code (`en`).
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] for an unknown language or task.
    pub fn forced_decoder_ids(
        &self,
        language: Option<&str>,
        task: Option<&str>,
        return_timestamps: bool,
    ) -> Result<Vec<(usize, u32)>> {
        let mut forced = Vec::new();

        if self.is_multilingual {
            if let Some(language) = language {
                forced.push((1, self.language_token(language)?));
            }
            let task = task.unwrap_or("transcribe");
            let task_id = self.task_to_id.get(task).copied().ok_or_else(|| {
                DecodeError::Config(format!("unknown task '{task}' in task_to_id"))
            })?;
            forced.push((2, task_id));
        }

        if let Some(no_ts) = self.no_timestamps_token_id.filter(|_| !return_timestamps) {
            if !forced.iter().any(|&(_, token)| token == no_ts) {
                let idx = forced.last().map_or(1, |&(idx, _)| idx + 1);
                forced.push((idx, no_ts));
            }
        }

        Ok(forced)
    }

    /// Token id of a language, given as `<|en|>` or `en`.
    fn language_token(&self, language: &str) -> Result<u32> {
        let tag = if language.starts_with("<|") {
            language.to_owned()
        } else {
            format!("<|{language}|>")
        };
        self.lang_to_id
            .get(&tag)
            .copied()
            .ok_or_else(|| DecodeError::Config(format!("unknown language '{language}'")))
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| DecodeError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| DecodeError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    get_optional_usize(config, key).unwrap_or(default)
}

/// Extract an optional `usize` field, returning `None` if absent.
fn get_optional_usize(config: &Value, key: &str) -> Option<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Extract a `bool` field, returning a default if absent.
fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Convert a JSON number to a token id.
fn as_token(key: &str, value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| DecodeError::Config(format!("field '{key}' is not a valid token id")))
}

/// Extract an optional token id.
///
/// Some checkpoints store `eos_token_id` as a list; the first entry wins.
fn get_optional_token(config: &Value, key: &str) -> Result<Option<u32>> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items.first().map(|v| as_token(key, v)).transpose(),
        Some(value) => as_token(key, value).map(Some),
    }
}

/// Extract a token id, returning a default if absent.
fn get_token_or(config: &Value, key: &str, default: u32) -> Result<u32> {
    Ok(get_optional_token(config, key)?.unwrap_or(default))
}

/// Extract a `{ "name": id, ... }` token map; absent maps are empty.
fn get_token_map(config: &Value, key: &str) -> Result<HashMap<String, u32>> {
    let Some(map) = config.get(key).and_then(Value::as_object) else {
        return Ok(HashMap::new());
    };
    map.iter()
        .map(|(name, value)| Ok((name.clone(), as_token(key, value)?)))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// whisper-tiny `config.json`, trimmed to the fields we read.
    fn tiny_config_json() -> Value {
        serde_json::json!({
            "model_type": "whisper",
            "d_model": 384,
            "encoder_layers": 4,
            "decoder_layers": 4,
            "encoder_attention_heads": 6,
            "decoder_attention_heads": 6,
            "encoder_ffn_dim": 1536,
            "decoder_ffn_dim": 1536,
            "num_mel_bins": 80,
            "max_source_positions": 1500,
            "max_target_positions": 448,
            "vocab_size": 51865,
            "activation_function": "gelu",
            "scale_embedding": false,
            "decoder_start_token_id": 50258,
            "eos_token_id": 50257,
            "pad_token_id": 50257
        })
    }

    fn multilingual_generation_json() -> Value {
        serde_json::json!({
            "max_length": 448,
            "decoder_start_token_id": 50258,
            "eos_token_id": 50257,
            "pad_token_id": 50257,
            "no_timestamps_token_id": 50363,
            "is_multilingual": true,
            "lang_to_id": { "<|en|>": 50259, "<|de|>": 50261 },
            "task_to_id": { "transcribe": 50359, "translate": 50358 },
            "max_initial_timestamp_index": 50
        })
    }

    #[test]
    fn parse_tiny_config() {
        let config = WhisperConfig::from_hf_config(&tiny_config_json()).unwrap();
        assert_eq!(config.d_model, 384);
        assert_eq!(config.decoder_layers, 4);
        assert_eq!(config.decoder_head_dim(), 64);
        assert_eq!(config.input_frames(), 3000);
        assert_eq!(config.activation, Activation::Gelu);
        assert!(config.tie_word_embeddings);
        assert!((config.layer_norm_eps - 1e-5).abs() < f64::EPSILON);
        assert_eq!(config.decoder_start_token_id, 50258);
        assert_eq!(config.eos_token_id, 50257);
    }

    #[test]
    fn indivisible_heads_is_config_error() {
        let mut json = tiny_config_json();
        json["decoder_attention_heads"] = serde_json::json!(5);
        let err = WhisperConfig::from_hf_config(&json).unwrap_err();
        assert!(matches!(err, DecodeError::Config(_)));
    }

    #[test]
    fn wrong_model_type_errors() {
        let mut json = tiny_config_json();
        json["model_type"] = serde_json::json!("llama");
        assert!(WhisperConfig::from_hf_config(&json).is_err());
    }

    #[test]
    fn missing_dimension_errors() {
        let mut json = tiny_config_json();
        json.as_object_mut().unwrap().remove("d_model");
        assert!(WhisperConfig::from_hf_config(&json).is_err());
    }

    #[test]
    fn unknown_activation_errors() {
        let mut json = tiny_config_json();
        json["activation_function"] = serde_json::json!("swish");
        assert!(WhisperConfig::from_hf_config(&json).is_err());
    }

    #[test]
    fn eos_list_takes_first_entry() {
        let json = serde_json::json!({ "eos_token_id": [50257, 50256] });
        let config = GenerationConfig::from_hf_generation_config(&json).unwrap();
        assert_eq!(config.eos_token_id, 50257);
        assert_eq!(config.max_length, 448);
    }

    #[test]
    fn multilingual_forced_ids_without_timestamps() {
        let config =
            GenerationConfig::from_hf_generation_config(&multilingual_generation_json()).unwrap();
        let forced = config.forced_decoder_ids(Some("en"), None, false).unwrap();
        assert_eq!(forced, vec![(1, 50259), (2, 50359), (3, 50363)]);
    }

    #[test]
    fn multilingual_forced_ids_with_timestamps() {
        let config =
            GenerationConfig::from_hf_generation_config(&multilingual_generation_json()).unwrap();
        let forced = config
            .forced_decoder_ids(Some("<|de|>"), Some("translate"), true)
            .unwrap();
        assert_eq!(forced, vec![(1, 50261), (2, 50358)]);
        assert_eq!(config.max_initial_timestamp_index, Some(50));
    }

    #[test]
    fn missing_language_leaves_slot_one_free() {
        let config =
            GenerationConfig::from_hf_generation_config(&multilingual_generation_json()).unwrap();
        let forced = config.forced_decoder_ids(None, None, false).unwrap();
        assert_eq!(forced, vec![(2, 50359), (3, 50363)]);
    }

    #[test]
    fn english_only_forces_no_timestamps_at_one() {
        let json = serde_json::json!({ "no_timestamps_token_id": 50362 });
        let config = GenerationConfig::from_hf_generation_config(&json).unwrap();
        let forced = config.forced_decoder_ids(Some("en"), None, false).unwrap();
        assert_eq!(forced, vec![(1, 50362)]);
    }

    #[test]
    fn unknown_language_errors() {
        let config =
            GenerationConfig::from_hf_generation_config(&multilingual_generation_json()).unwrap();
        let err = config.forced_decoder_ids(Some("xx"), None, false).unwrap_err();
        assert!(matches!(err, DecodeError::Config(_)));
    }
}
